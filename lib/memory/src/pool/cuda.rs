// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device staging: a stream-ordered CUDA memory pool plus a free list of streams.

use crate::{Result, StorageError, context::cuda_context};
use cudarc::driver::sys::{
    self, CUmemAllocationType, CUmemLocationType, CUmemPool_attribute, CUmemPoolProps,
    CUmemoryPool, CUresult,
};
use cudarc::driver::{CudaContext, CudaStream};
use parking_lot::Mutex;
use std::ptr;
use std::sync::Arc;

fn driver_failure(call: &str, result: CUresult) -> StorageError {
    StorageError::OperationFailed(format!("{call} failed with error: {result:?}"))
}

/// Builder for a CUDA memory pool.
///
/// # Example
/// ```ignore
/// let pool = CudaMemPoolBuilder::new(context, 64 * 1024 * 1024)
///     .release_threshold(32 * 1024 * 1024)
///     .build()?;
/// ```
pub struct CudaMemPoolBuilder {
    context: Arc<CudaContext>,
    /// Bytes to pre-allocate to warm the pool.
    reserve_size: usize,
    release_threshold: Option<u64>,
}

impl CudaMemPoolBuilder {
    pub fn new(context: Arc<CudaContext>, reserve_size: usize) -> Self {
        Self {
            context,
            reserve_size,
            release_threshold: None,
        }
    }

    /// Memory above this threshold is returned to the system when freed.
    pub fn release_threshold(mut self, threshold: u64) -> Self {
        self.release_threshold = Some(threshold);
        self
    }

    /// Create the pool, apply the release threshold and warm it with one reserve-sized
    /// allocation.
    pub fn build(self) -> Result<CudaMemPool> {
        let mut props: CUmemPoolProps = unsafe { std::mem::zeroed() };
        props.allocType = CUmemAllocationType::CU_MEM_ALLOCATION_TYPE_PINNED;
        props.location.type_ = CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE;
        props.location.id = self.context.cu_device();

        let mut pool: CUmemoryPool = ptr::null_mut();

        let result = unsafe { sys::cuMemPoolCreate(&mut pool, &props) };
        if result != CUresult::CUDA_SUCCESS {
            return Err(driver_failure("cuMemPoolCreate", result));
        }

        if let Some(threshold) = self.release_threshold {
            let result = unsafe {
                sys::cuMemPoolSetAttribute(
                    pool,
                    CUmemPool_attribute::CU_MEMPOOL_ATTR_RELEASE_THRESHOLD,
                    &threshold as *const u64 as *mut std::ffi::c_void,
                )
            };
            if result != CUresult::CUDA_SUCCESS {
                unsafe { sys::cuMemPoolDestroy(pool) };
                return Err(driver_failure("cuMemPoolSetAttribute", result));
            }
        }

        let cuda_pool = CudaMemPool {
            inner: Mutex::new(pool),
        };

        if self.reserve_size > 0 {
            let stream = self.context.new_stream()?;
            let ptr = cuda_pool.alloc_async(self.reserve_size, &stream)?;
            cuda_pool.free_async(ptr, &stream)?;
            stream.synchronize()?;
        }

        Ok(cuda_pool)
    }
}

/// Safe wrapper around a CUDA memory pool.
///
/// `cuMemAllocFromPoolAsync` is not host-thread reentrant, so allocation is serialized
/// through a mutex. Frees only enqueue a stream-ordered release of a unique pointer and
/// do not take the lock.
pub struct CudaMemPool {
    inner: Mutex<CUmemoryPool>,
}

// SAFETY: every host-side use of the pool handle is serialized through the mutex.
unsafe impl Send for CudaMemPool {}
unsafe impl Sync for CudaMemPool {}

impl CudaMemPool {
    pub fn builder(context: Arc<CudaContext>, reserve_size: usize) -> CudaMemPoolBuilder {
        CudaMemPoolBuilder::new(context, reserve_size)
    }

    /// Stream-ordered allocation of `size` bytes.
    pub fn alloc_async(&self, size: usize, stream: &CudaStream) -> Result<u64> {
        let pool = self.inner.lock();
        let mut ptr: u64 = 0;

        // SAFETY: the borrow keeps the stream alive for the duration of the call.
        let result =
            unsafe { sys::cuMemAllocFromPoolAsync(&mut ptr, size, *pool, stream.cu_stream()) };
        if result != CUresult::CUDA_SUCCESS {
            return Err(driver_failure("cuMemAllocFromPoolAsync", result));
        }

        Ok(ptr)
    }

    /// Stream-ordered free of a pointer previously returned by [`CudaMemPool::alloc_async`].
    pub fn free_async(&self, ptr: u64, stream: &CudaStream) -> Result<()> {
        let result = unsafe { sys::cuMemFreeAsync(ptr, stream.cu_stream()) };
        if result != CUresult::CUDA_SUCCESS {
            return Err(driver_failure("cuMemFreeAsync", result));
        }
        Ok(())
    }
}

impl Drop for CudaMemPool {
    fn drop(&mut self) {
        let pool = self.inner.get_mut();
        let result = unsafe { sys::cuMemPoolDestroy(*pool) };
        if result != CUresult::CUDA_SUCCESS {
            tracing::warn!("cuMemPoolDestroy failed with error: {:?}", result);
        }
    }
}

/// Per-device staging state owned by the staging pool.
pub(crate) struct DeviceStaging {
    device_id: u32,
    context: Arc<CudaContext>,
    memory: CudaMemPool,
    streams: Mutex<Vec<Arc<CudaStream>>>,
}

impl DeviceStaging {
    pub(crate) fn new(device_id: u32, reserve_bytes: usize) -> Result<Self> {
        let context = cuda_context(device_id)?;
        let memory = CudaMemPool::builder(context.clone(), reserve_bytes).build()?;
        tracing::debug!(device_id, reserve_bytes, "created device staging pool");
        Ok(Self {
            device_id,
            context,
            memory,
            streams: Mutex::new(Vec::new()),
        })
    }

    /// Pop an idle stream or create a new one.
    pub(crate) fn lease_stream(self: &Arc<Self>) -> Result<StreamLease> {
        let stream = match self.streams.lock().pop() {
            Some(stream) => stream,
            None => self.context.new_stream()?,
        };
        Ok(StreamLease {
            stream: Some(stream),
            owner: self.clone(),
        })
    }
}

/// A stream checked out from a device free list.
///
/// Streams are handed to one caller at a time, so work issued on a leased stream never
/// interleaves with another caller's work.
pub struct StreamLease {
    stream: Option<Arc<CudaStream>>,
    owner: Arc<DeviceStaging>,
}

impl StreamLease {
    pub fn device_id(&self) -> u32 {
        self.owner.device_id
    }
}

impl std::ops::Deref for StreamLease {
    type Target = Arc<CudaStream>;

    fn deref(&self) -> &Self::Target {
        match &self.stream {
            Some(stream) => stream,
            None => unreachable!("stream lease accessed after release"),
        }
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.owner.streams.lock().push(stream);
        }
    }
}

/// A stream-ordered device allocation together with the stream that orders it.
pub(crate) struct DeviceAllocation {
    ptr: u64,
    lease: StreamLease,
}

impl DeviceAllocation {
    pub(crate) fn new(owner: Arc<DeviceStaging>, len: usize) -> Result<Self> {
        owner.context.bind_to_thread()?;
        let lease = owner.lease_stream()?;
        let ptr = owner.memory.alloc_async(len, &lease)?;
        Ok(Self { ptr, lease })
    }

    pub(crate) fn ptr(&self) -> u64 {
        self.ptr
    }

    pub(crate) fn device_id(&self) -> u32 {
        self.lease.device_id()
    }

    pub(crate) fn stream(&self) -> &Arc<CudaStream> {
        &self.lease
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if let Err(e) = self.lease.owner.memory.free_async(self.ptr, &self.lease) {
            tracing::warn!("failed to return device staging memory: {e}");
        }
    }
}
