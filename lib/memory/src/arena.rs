// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Arena Allocator
//!
//! Heap-like sub-allocation out of a single reserved region. An [`ArenaAllocator`] takes
//! ownership of a [`MemoryDescription`] and hands out [`ArenaBuffer`]s that return their
//! pages when dropped.
//!
//! Page bookkeeping is done by the [`offset_allocator`] crate, which builds on
//! [Sebastian Aaltonen's OffsetAllocator](https://github.com/sebbbi/OffsetAllocator).

use crate::StorageKind;

use super::{MemoryDescription, StorageError};
use offset_allocator::{Allocation, Allocator};
use parking_lot::Mutex;
use std::{any::Any, sync::Arc};

/// Errors specific to arena allocation.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("Page size must be a power of 2")]
    PageSizeNotAligned,

    #[error("Allocation failed")]
    AllocationFailed,

    #[error("Failed to convert pages to u32")]
    PagesNotConvertible,

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// Arena allocator backed by an instance of a [`MemoryDescription`] object.
///
/// The allocator is thread-safe, and the storage is shared between the allocator and the buffers,
/// so the backing memory outlives every buffer carved from it.
#[derive(Clone)]
pub struct ArenaAllocator<S: MemoryDescription> {
    storage: Arc<S>,
    allocator: Arc<Mutex<Allocator>>,
    page_size: u64,
    pages: u32,
}

impl<S: MemoryDescription> std::fmt::Debug for ArenaAllocator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ArenaAllocator {{ storage: {:?}, page_size: {}, pages: {} }}",
            self.storage, self.page_size, self.pages
        )
    }
}

/// A buffer allocated from an [`ArenaAllocator`].
///
/// The allocation is freed when the buffer is dropped.
pub struct ArenaBuffer<S: MemoryDescription> {
    offset: usize,
    address: usize,
    requested_size: usize,
    storage: Arc<S>,
    allocation: Allocation,
    allocator: Arc<Mutex<Allocator>>,
}

impl<S: MemoryDescription> ArenaAllocator<S> {
    /// Create a new [`ArenaAllocator`] from a [`MemoryDescription`] object and a page size.
    ///
    /// The page size must be a power of two. The storage is divided into whole pages; any
    /// trailing bytes that do not fill a page are never handed out.
    pub fn new(storage: S, page_size: usize) -> std::result::Result<Self, ArenaError> {
        let storage = Arc::new(storage);

        if !page_size.is_power_of_two() {
            return Err(ArenaError::PageSizeNotAligned);
        }

        let pages: u32 = (storage.size() / page_size)
            .try_into()
            .map_err(|_| ArenaError::PagesNotConvertible)?;

        let allocator = Arc::new(Mutex::new(Allocator::new(pages)));

        Ok(Self {
            storage,
            allocator,
            page_size: page_size as u64,
            pages,
        })
    }

    /// Allocate a new [`ArenaBuffer`] of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> std::result::Result<ArenaBuffer<S>, ArenaError> {
        if size == 0 {
            return Err(ArenaError::AllocationFailed);
        }

        let size = size as u64;
        let pages = size.div_ceil(self.page_size);

        let allocation = self
            .allocator
            .lock()
            .allocate(pages.try_into().map_err(|_| ArenaError::AllocationFailed)?)
            .ok_or(ArenaError::AllocationFailed)?;

        let offset = allocation.offset as u64 * self.page_size;
        let address = self.storage.addr() + offset as usize;

        debug_assert!(address + size as usize <= self.storage.addr() + self.storage.size());

        Ok(ArenaBuffer {
            offset: offset as usize,
            address,
            requested_size: size as usize,
            allocation,
            storage: self.storage.clone(),
            allocator: self.allocator.clone(),
        })
    }

    /// Bytes the arena can hand out in total.
    pub fn capacity(&self) -> usize {
        self.pages as usize * self.page_size as usize
    }

    /// Page granularity of the arena.
    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    /// Storage kind of the backing reservation.
    pub fn storage_kind(&self) -> StorageKind {
        self.storage.storage_kind()
    }
}

impl<S: MemoryDescription> ArenaBuffer<S> {
    /// Byte offset of this buffer inside the arena reservation.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<S: MemoryDescription> std::fmt::Debug for ArenaBuffer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ArenaBuffer {{ addr: {}, size: {}, kind: {:?}, allocator: {:p} }}",
            self.address,
            self.requested_size,
            self.storage.storage_kind(),
            Arc::as_ptr(&self.storage)
        )
    }
}

impl<S: MemoryDescription + 'static> MemoryDescription for ArenaBuffer<S> {
    fn addr(&self) -> usize {
        self.address
    }
    fn size(&self) -> usize {
        self.requested_size
    }
    fn storage_kind(&self) -> StorageKind {
        self.storage.storage_kind()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<S: MemoryDescription> Drop for ArenaBuffer<S> {
    fn drop(&mut self) {
        self.allocator.lock().free(self.allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemStorage;

    const PAGE_SIZE: usize = 4096;
    const PAGE_COUNT: usize = 10;
    const TOTAL_STORAGE_SIZE: usize = PAGE_SIZE * PAGE_COUNT;

    fn create_allocator() -> ArenaAllocator<SystemStorage> {
        let storage = SystemStorage::new(TOTAL_STORAGE_SIZE).unwrap();
        ArenaAllocator::new(storage, PAGE_SIZE).unwrap()
    }

    #[test]
    fn test_arena_allocator_new_invalid_page_size() {
        let storage = SystemStorage::new(TOTAL_STORAGE_SIZE).unwrap();
        let allocator_result = ArenaAllocator::new(storage, PAGE_SIZE + 1);
        assert!(matches!(
            allocator_result,
            Err(ArenaError::PageSizeNotAligned)
        ));
    }

    #[test]
    fn test_capacity_discards_partial_page() {
        let storage = SystemStorage::new(TOTAL_STORAGE_SIZE + 17).unwrap();
        let allocator = ArenaAllocator::new(storage, PAGE_SIZE).unwrap();
        assert_eq!(allocator.capacity(), TOTAL_STORAGE_SIZE);
        assert_eq!(allocator.page_size(), PAGE_SIZE);
    }

    #[test]
    fn test_allocate_multiple_buffers() {
        let allocator = create_allocator();
        let buffer1 = allocator.allocate(PAGE_SIZE * 2).unwrap();
        assert_eq!(buffer1.size(), PAGE_SIZE * 2);
        assert_eq!(buffer1.addr(), allocator.storage.addr());
        assert_eq!(buffer1.offset(), 0);

        let buffer2 = allocator.allocate(PAGE_SIZE * 3).unwrap();
        assert_eq!(buffer2.size(), PAGE_SIZE * 3);
        assert_eq!(buffer2.addr(), allocator.storage.addr() + PAGE_SIZE * 2);
    }

    #[test]
    fn test_allocate_zero_bytes_fails() {
        let allocator = create_allocator();
        assert!(matches!(
            allocator.allocate(0),
            Err(ArenaError::AllocationFailed)
        ));
    }

    #[test]
    fn test_allocate_too_large() {
        let allocator = create_allocator();
        let buffer_result = allocator.allocate(TOTAL_STORAGE_SIZE + PAGE_SIZE);
        assert!(matches!(buffer_result, Err(ArenaError::AllocationFailed)));
    }

    #[test]
    fn test_buffer_drop_and_reallocate() {
        let allocator = create_allocator();
        // two of these do not fit; the second only succeeds if the first was returned
        let buffer_size = PAGE_SIZE * 6;

        {
            let buffer1 = allocator.allocate(buffer_size).unwrap();
            assert_eq!(buffer1.addr(), allocator.storage.addr());
        }

        let buffer2 = allocator.allocate(buffer_size).unwrap();
        assert_eq!(buffer2.size(), buffer_size);
        assert_eq!(buffer2.addr(), allocator.storage.addr());
    }

    #[test]
    fn test_fill_with_non_aligned_and_fail() {
        let allocator = create_allocator();
        // PAGE_SIZE + 1 rounds up to two pages
        let single_alloc_size = PAGE_SIZE + 1;
        let num_possible_allocs = PAGE_COUNT / 2;

        let mut allocated_buffers = Vec::with_capacity(num_possible_allocs);
        for i in 0..num_possible_allocs {
            let buffer = allocator
                .allocate(single_alloc_size)
                .unwrap_or_else(|e| panic!("allocation {} failed: {e}", i + 1));
            assert_eq!(buffer.size(), single_alloc_size);
            allocated_buffers.push(buffer);
        }

        assert!(matches!(
            allocator.allocate(1),
            Err(ArenaError::AllocationFailed)
        ));
    }

    #[test]
    fn test_buffers_are_disjoint() {
        let allocator = create_allocator();
        let a = allocator.allocate(100).unwrap();
        let b = allocator.allocate(100).unwrap();
        let (lo, hi) = if a.addr() < b.addr() { (&a, &b) } else { (&b, &a) };
        assert!(lo.addr() + lo.size() <= hi.addr());
    }
}
