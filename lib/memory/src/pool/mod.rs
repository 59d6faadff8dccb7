// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Staging memory pool.
//!
//! Pack and unpack operations that cannot hand a layout straight to the message library
//! gather rows into a contiguous scratch buffer first. [`StagingPool`] reserves that scratch
//! memory once and hands out [`StagingBuffer`]s on request:
//!
//! * host placement is served from an [`ArenaAllocator`] over one reservation, falling back to
//!   a dedicated allocation when the arena is exhausted
//! * device placement (feature `cuda`) is served from a per-device [`CudaMemPool`] and comes
//!   with a stream leased from a per-device free list
//!
//! Buffers return to the pool when dropped. Two buffers that are alive at the same time never
//! overlap.

#[cfg(feature = "cuda")]
pub mod cuda;

#[cfg(feature = "cuda")]
pub use cuda::{CudaMemPool, CudaMemPoolBuilder, StreamLease};

use crate::{
    ArenaAllocator, ArenaBuffer, Buffer, MemoryDescription, Result, StorageError, StorageKind,
    SystemStorage, actions, create_buffer,
};
#[cfg(feature = "cuda")]
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Sizing of the staging reservations.
#[derive(Debug, Clone)]
pub struct StagingPoolConfig {
    /// Bytes reserved up front for host staging; zero disables the arena.
    pub host_reserve_bytes: usize,

    /// Page granularity of the host arena. Must be a power of two.
    pub page_size: usize,

    /// Back the host arena with pinned memory (feature `cuda` only).
    pub pinned_host: bool,

    /// Bytes pre-allocated in each device memory pool.
    pub device_reserve_bytes: usize,
}

impl Default for StagingPoolConfig {
    fn default() -> Self {
        Self {
            host_reserve_bytes: 64 << 20,
            page_size: 4096,
            pinned_host: false,
            device_reserve_bytes: 64 << 20,
        }
    }
}

/// Counters shared between the pool and the buffers it handed out.
#[derive(Debug, Default)]
struct PoolCounters {
    outstanding: AtomicUsize,
    dedicated: AtomicUsize,
}

/// Pool of staging memory and device execution contexts.
pub struct StagingPool {
    config: StagingPoolConfig,
    host: Option<ArenaAllocator<Buffer>>,
    counters: Arc<PoolCounters>,
    #[cfg(feature = "cuda")]
    devices: Mutex<std::collections::HashMap<u32, Arc<cuda::DeviceStaging>>>,
}

impl std::fmt::Debug for StagingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingPool")
            .field("config", &self.config)
            .field("host", &self.host)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl StagingPool {
    /// Reserve host staging memory according to `config`.
    ///
    /// Device pools are created lazily, the first time a device placement is requested.
    pub fn new(config: StagingPoolConfig) -> Result<Self> {
        let host = if config.host_reserve_bytes > 0 {
            let storage = Self::host_storage(&config)?;
            let arena = ArenaAllocator::new(storage, config.page_size)
                .map_err(|e| StorageError::AllocationFailed(e.to_string()))?;
            tracing::debug!(
                capacity = arena.capacity(),
                kind = ?arena.storage_kind(),
                "reserved host staging arena"
            );
            Some(arena)
        } else {
            None
        };

        Ok(Self {
            config,
            host,
            counters: Arc::new(PoolCounters::default()),
            #[cfg(feature = "cuda")]
            devices: Mutex::new(Default::default()),
        })
    }

    /// Pinned memory when requested and available, system memory otherwise.
    #[cfg(feature = "cuda")]
    fn host_allocation(len: usize, pinned: bool) -> Result<Buffer> {
        if pinned {
            match crate::PinnedStorage::new(len, 0) {
                Ok(storage) => return Ok(create_buffer(storage)),
                Err(e) => {
                    tracing::warn!(len, "pinned staging unavailable, using system memory: {e}")
                }
            }
        }
        Ok(create_buffer(SystemStorage::new(len)?))
    }

    #[cfg(feature = "cuda")]
    fn host_storage(config: &StagingPoolConfig) -> Result<Buffer> {
        Self::host_allocation(config.host_reserve_bytes, config.pinned_host)
    }

    #[cfg(not(feature = "cuda"))]
    fn host_storage(config: &StagingPoolConfig) -> Result<Buffer> {
        if config.pinned_host {
            tracing::warn!("pinned host staging requested without cuda support; using system memory");
        }
        Ok(create_buffer(SystemStorage::new(config.host_reserve_bytes)?))
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> &StagingPoolConfig {
        &self.config
    }

    /// Number of staging buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.counters.outstanding.load(Ordering::Acquire)
    }

    /// Number of buffers that did not fit in the arena and were allocated on their own.
    pub fn dedicated_allocations(&self) -> usize {
        self.counters.dedicated.load(Ordering::Relaxed)
    }

    /// Obtain a staging buffer of exactly `len` usable bytes in the given placement.
    ///
    /// A zero-length request succeeds and yields an empty buffer.
    pub fn acquire(&self, len: usize, placement: StorageKind) -> Result<StagingBuffer> {
        let region = if len == 0 {
            Region::Empty
        } else {
            match placement {
                StorageKind::System | StorageKind::Pinned => self.acquire_host(len)?,
                StorageKind::Device(device_id) => self.acquire_device(len, device_id)?,
            }
        };

        self.counters.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(StagingBuffer {
            region,
            len,
            placement,
            counters: self.counters.clone(),
        })
    }

    fn acquire_host(&self, len: usize) -> Result<Region> {
        if let Some(arena) = &self.host {
            match arena.allocate(len) {
                Ok(buffer) => return Ok(Region::Arena(buffer)),
                Err(e) => {
                    tracing::debug!(len, "host staging arena exhausted ({e}); allocating dedicated buffer");
                }
            }
        }

        self.counters.dedicated.fetch_add(1, Ordering::Relaxed);
        Ok(Region::Dedicated(Self::dedicated_host(len, &self.config)?))
    }

    #[cfg(feature = "cuda")]
    fn dedicated_host(len: usize, config: &StagingPoolConfig) -> Result<Buffer> {
        Self::host_allocation(len, config.pinned_host)
    }

    #[cfg(not(feature = "cuda"))]
    fn dedicated_host(len: usize, _config: &StagingPoolConfig) -> Result<Buffer> {
        Ok(create_buffer(SystemStorage::new(len)?))
    }

    #[cfg(feature = "cuda")]
    fn device(&self, device_id: u32) -> Result<Arc<cuda::DeviceStaging>> {
        let mut devices = self.devices.lock();
        if let Some(existing) = devices.get(&device_id) {
            return Ok(existing.clone());
        }
        let staging = Arc::new(cuda::DeviceStaging::new(
            device_id,
            self.config.device_reserve_bytes,
        )?);
        devices.insert(device_id, staging.clone());
        Ok(staging)
    }

    #[cfg(feature = "cuda")]
    fn acquire_device(&self, len: usize, device_id: u32) -> Result<Region> {
        let staging = self.device(device_id)?;
        Ok(Region::Device(cuda::DeviceAllocation::new(staging, len)?))
    }

    #[cfg(not(feature = "cuda"))]
    fn acquire_device(&self, _len: usize, device_id: u32) -> Result<Region> {
        Err(StorageError::Unsupported(format!(
            "device staging on device {device_id} requires the cuda feature"
        )))
    }

    /// Lease a stream for issuing copies on `device_id`.
    ///
    /// Concurrent callers receive distinct streams; the lease returns its stream to the
    /// device free list on drop.
    #[cfg(feature = "cuda")]
    pub fn stream(&self, device_id: u32) -> Result<StreamLease> {
        self.device(device_id)?.lease_stream()
    }
}

enum Region {
    Empty,
    Arena(ArenaBuffer<Buffer>),
    Dedicated(Buffer),
    #[cfg(feature = "cuda")]
    Device(cuda::DeviceAllocation),
}

/// Scratch memory checked out from a [`StagingPool`].
///
/// Usable size is exactly the requested length, even when the backing allocation is larger.
pub struct StagingBuffer {
    region: Region,
    len: usize,
    placement: StorageKind,
    counters: Arc<PoolCounters>,
}

impl StagingBuffer {
    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Placement that was requested for this buffer.
    pub fn placement(&self) -> StorageKind {
        self.placement
    }

    /// Stream owning the stream-ordered device allocation, if any.
    #[cfg(feature = "cuda")]
    pub fn stream(&self) -> Option<&Arc<cudarc::driver::CudaStream>> {
        match &self.region {
            Region::Device(allocation) => Some(allocation.stream()),
            _ => None,
        }
    }

    /// Return the buffer to the pool. Equivalent to dropping it.
    pub fn release(self) {}
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("addr", &self.addr())
            .field("len", &self.len)
            .field("placement", &self.placement)
            .finish()
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.counters.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl MemoryDescription for StagingBuffer {
    fn addr(&self) -> usize {
        match &self.region {
            Region::Empty => 0,
            Region::Arena(buffer) => buffer.addr(),
            Region::Dedicated(buffer) => buffer.addr(),
            #[cfg(feature = "cuda")]
            Region::Device(allocation) => allocation.ptr() as usize,
        }
    }

    fn size(&self) -> usize {
        self.len
    }

    fn storage_kind(&self) -> StorageKind {
        match &self.region {
            Region::Empty => self.placement,
            Region::Arena(buffer) => buffer.storage_kind(),
            Region::Dedicated(buffer) => buffer.storage_kind(),
            #[cfg(feature = "cuda")]
            Region::Device(allocation) => StorageKind::Device(allocation.device_id()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl actions::Slice for StagingBuffer {
    unsafe fn as_slice(&self) -> Result<&[u8]> {
        if self.len == 0 {
            return Ok(&[]);
        }
        if !self.storage_kind().is_host() {
            return Err(StorageError::Unsupported(
                "device staging buffers cannot be viewed from the host".into(),
            ));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.addr() as *const u8, self.len) })
    }
}

impl actions::SliceMut for StagingBuffer {
    unsafe fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if self.len == 0 {
            return Ok(&mut []);
        }
        if !self.storage_kind().is_host() {
            return Err(StorageError::Unsupported(
                "device staging buffers cannot be viewed from the host".into(),
            ));
        }
        // SAFETY: the region is exclusively owned by this buffer while it is checked out
        Ok(unsafe { std::slice::from_raw_parts_mut(self.addr() as *mut u8, self.len) })
    }
}
