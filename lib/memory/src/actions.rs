// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Storage actions.

use super::{MemoryDescription, StorageError};

/// Extension trait for storage types that support memory setting operations
pub trait Memset: MemoryDescription {
    /// Sets a region of memory to a specific value
    ///
    /// # Arguments
    /// * `value` - The value to set
    /// * `offset` - Offset in bytes from the start of the storage
    /// * `size` - Number of bytes to set
    fn memset(&mut self, value: u8, offset: usize, size: usize) -> Result<(), StorageError>;
}

/// Extension trait for host storage that can be viewed as bytes.
pub trait Slice: MemoryDescription {
    /// Returns an immutable byte slice view of the entire storage region
    ///
    /// # Safety
    /// The caller must ensure:
    /// - The memory region remains valid for the lifetime of the returned slice
    /// - No concurrent mutable access occurs while the slice is in use
    unsafe fn as_slice(&self) -> Result<&[u8], StorageError>;

    /// Returns an immutable byte slice view of a subregion
    fn slice(&self, offset: usize, len: usize) -> Result<&[u8], StorageError> {
        // SAFETY: implementors only hand out views of memory they own
        let slice = unsafe { self.as_slice()? };

        slice
            .get(offset..offset.saturating_add(len))
            .ok_or_else(|| StorageError::Unsupported("slice out of bounds".into()))
    }
}

/// Extension trait for host storage that can be written through a byte slice.
pub trait SliceMut: MemoryDescription {
    /// Returns a mutable byte slice view of the entire storage region
    ///
    /// # Safety
    /// The caller must ensure no other view of the region is alive while the
    /// returned slice is in use.
    unsafe fn as_mut_slice(&mut self) -> Result<&mut [u8], StorageError>;
}
