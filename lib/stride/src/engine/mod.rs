// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pack/unpack engine.
//!
//! The engine executes a [`PackPlan`] against application memory along one of two routes:
//!
//! * [`Route::Native`]: the library's own pack/unpack runs with the plan's datatype. Used
//!   for host memory, or for device memory when the library is device-aware.
//! * [`Route::Staged`]: the engine copies rows itself between the region and a staging
//!   buffer, with the host kernel or (feature `cuda`) per-row asynchronous device copies.
//!
//! Packed data always follows the canonical row order of the plan's descriptor.

#[cfg(feature = "cuda")]
mod cuda;
mod host;
pub mod notification;

pub use notification::{CompletionChecker, CompletionSignal};
#[cfg(feature = "cuda")]
pub use notification::CudaEventChecker;

use crate::error::{Result, StrideError};
use crate::library::MessageLibrary;
use crate::plan::PackPlan;
use dynamo_memory::{MemoryDescription, StagingBuffer, StagingPool, StorageKind};
use host::Direction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Packs at or above this many bytes run on the rayon pool.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1 << 20;

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    Host,
    Device(u32),
}

impl Placement {
    pub fn is_host(&self) -> bool {
        matches!(self, Placement::Host)
    }

    pub fn storage_kind(&self) -> StorageKind {
        match self {
            Placement::Host => StorageKind::System,
            Placement::Device(id) => StorageKind::Device(*id),
        }
    }
}

impl From<StorageKind> for Placement {
    fn from(kind: StorageKind) -> Self {
        match kind {
            StorageKind::System | StorageKind::Pinned => Placement::Host,
            StorageKind::Device(id) => Placement::Device(id),
        }
    }
}

/// An application buffer: base address of the region plus its placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHandle {
    pub addr: usize,
    pub placement: Placement,
}

impl MemoryHandle {
    pub fn host(addr: usize) -> Self {
        Self {
            addr,
            placement: Placement::Host,
        }
    }

    pub fn device(addr: usize, device_id: u32) -> Self {
        Self {
            addr,
            placement: Placement::Device(device_id),
        }
    }

    /// The same buffer shifted by `offset` bytes.
    pub fn offset(&self, offset: usize) -> Self {
        Self {
            addr: self.addr + offset,
            placement: self.placement,
        }
    }
}

/// What the wrapped library can do with memory it is handed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryCapabilities {
    /// The library accepts device pointers in pack, unpack and transfer calls.
    pub device_aware: bool,
}

/// How a plan is executed for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Native,
    Staged,
}

/// A packed region in a pool-backed staging buffer.
///
/// The staging memory returns to the pool on drop. If the pack is still running when the
/// buffer is dropped, the drop waits for it first.
pub struct PackedBuffer {
    staging: StagingBuffer,
    pending: Option<CompletionSignal>,
}

impl std::fmt::Debug for PackedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedBuffer")
            .field("staging", &self.staging)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl PackedBuffer {
    /// Block until the packed bytes are in place.
    pub fn wait(&mut self) -> Result<()> {
        if let Some(signal) = self.pending.take() {
            signal.wait()?;
        }
        Ok(())
    }

    /// Non-blocking readiness check.
    pub fn is_ready(&mut self) -> Result<bool> {
        match self.pending.as_mut() {
            None => Ok(true),
            Some(signal) => {
                let ready = signal.is_complete()?;
                if ready {
                    self.pending = None;
                }
                Ok(ready)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    pub fn addr(&self) -> usize {
        self.staging.addr()
    }

    pub fn placement(&self) -> Placement {
        self.staging.storage_kind().into()
    }

    /// View of the packed bytes. Waits for the pack to finish.
    pub fn as_bytes(&mut self) -> Result<&[u8]> {
        self.wait()?;
        use dynamo_memory::actions::Slice;
        Ok(unsafe { self.staging.as_slice()? })
    }
}

impl Drop for PackedBuffer {
    fn drop(&mut self) {
        if let Some(signal) = self.pending.take() {
            if let Err(e) = signal.wait() {
                tracing::warn!("pack did not complete before its buffer was released: {e}");
            }
        }
    }
}

/// Executes pack plans against application memory.
pub struct PackEngine {
    library: Arc<dyn MessageLibrary>,
    pool: Arc<StagingPool>,
    capabilities: LibraryCapabilities,
    parallel_threshold: usize,
}

impl std::fmt::Debug for PackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackEngine")
            .field("capabilities", &self.capabilities)
            .field("parallel_threshold", &self.parallel_threshold)
            .finish()
    }
}

impl PackEngine {
    pub fn new(
        library: Arc<dyn MessageLibrary>,
        pool: Arc<StagingPool>,
        capabilities: LibraryCapabilities,
    ) -> Self {
        Self {
            library,
            pool,
            capabilities,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn library(&self) -> &Arc<dyn MessageLibrary> {
        &self.library
    }

    pub fn pool(&self) -> &Arc<StagingPool> {
        &self.pool
    }

    pub fn capabilities(&self) -> LibraryCapabilities {
        self.capabilities
    }

    /// The route `plan` takes for memory in `placement`.
    pub fn route(&self, plan: &PackPlan, placement: Placement) -> Route {
        if plan.datatype().is_some() && (placement.is_host() || self.capabilities.device_aware) {
            Route::Native
        } else {
            Route::Staged
        }
    }

    /// Whether the engine can copy rows of a region in `placement` itself.
    pub fn can_stage(&self, placement: Placement) -> bool {
        placement.is_host() || cfg!(feature = "cuda")
    }

    /// Staging buffer of `len` bytes from the pool.
    pub fn acquire_staging(&self, len: usize, placement: Placement) -> Result<StagingBuffer> {
        Ok(self.pool.acquire(len, placement.storage_kind())?)
    }

    /// Where packed data for `source` is staged: next to the source on the native route,
    /// host memory on the staged route.
    fn staging_placement(&self, route: Route, source: Placement) -> Placement {
        match route {
            Route::Native => source,
            Route::Staged => Placement::Host,
        }
    }

    /// Pack the region described by `plan` at `source` into a staging buffer.
    ///
    /// # Safety
    /// `source.addr` must be valid for reads over every row of the plan and must stay valid
    /// until the returned buffer reports ready.
    pub unsafe fn pack(&self, plan: &PackPlan, source: MemoryHandle) -> Result<PackedBuffer> {
        let len = plan.packed_len();
        let route = self.route(plan, source.placement);
        let staging = self.acquire_staging(len, self.staging_placement(route, source.placement))?;
        let pending = unsafe { self.execute(plan, route, Direction::Gather, source, &staging, len)? };
        Ok(PackedBuffer {
            staging,
            pending: Some(pending),
        })
    }

    /// Scatter `packed_len` bytes at `packed` into the region described by `plan` at `dest`.
    ///
    /// A short `packed_len` fills the leading rows only, the last one possibly partially.
    ///
    /// # Safety
    /// `packed` must be valid for `packed_len` bytes and `dest.addr` valid for writes over
    /// every row of the plan, both until the returned signal completes.
    pub unsafe fn unpack(
        &self,
        plan: &PackPlan,
        packed: MemoryHandle,
        packed_len: usize,
        dest: MemoryHandle,
    ) -> Result<CompletionSignal> {
        let route = self.route(plan, dest.placement);
        let len = packed_len.min(plan.packed_len());
        match route {
            Route::Native if len == plan.packed_len() => {
                let datatype = plan.datatype().ok_or_else(|| {
                    StrideError::InvalidArgument("native route without a datatype".into())
                })?;
                let mut position = 0;
                unsafe {
                    self.library.unpack(
                        packed.addr as *const u8,
                        len,
                        &mut position,
                        dest.addr as *mut u8,
                        1,
                        datatype,
                    )?
                };
                Ok(CompletionSignal::completed())
            }
            // partial data cannot go through the library's unpack
            _ => unsafe { self.copy_rows(plan, Direction::Scatter, dest, packed, len) },
        }
    }

    unsafe fn execute(
        &self,
        plan: &PackPlan,
        route: Route,
        direction: Direction,
        region: MemoryHandle,
        staging: &StagingBuffer,
        len: usize,
    ) -> Result<CompletionSignal> {
        let staged = MemoryHandle {
            addr: staging.addr(),
            placement: staging.storage_kind().into(),
        };
        match route {
            Route::Native => {
                let datatype = plan.datatype().ok_or_else(|| {
                    StrideError::InvalidArgument("native route without a datatype".into())
                })?;
                let mut position = 0;
                unsafe {
                    self.library.pack(
                        region.addr as *const u8,
                        1,
                        datatype,
                        staged.addr as *mut u8,
                        len,
                        &mut position,
                    )?
                };
                Ok(CompletionSignal::completed())
            }
            Route::Staged => unsafe { self.copy_rows(plan, direction, region, staged, len) },
        }
    }

    unsafe fn copy_rows(
        &self,
        plan: &PackPlan,
        direction: Direction,
        region: MemoryHandle,
        packed: MemoryHandle,
        limit: usize,
    ) -> Result<CompletionSignal> {
        match region.placement {
            Placement::Host if packed.placement.is_host() => Ok(unsafe {
                host::run(
                    direction,
                    plan.shared_descriptor(),
                    region.addr,
                    packed.addr,
                    limit,
                    self.parallel_threshold,
                )
            }),
            _ => unsafe { self.copy_rows_device(plan, direction, region, packed, limit) },
        }
    }

    #[cfg(feature = "cuda")]
    unsafe fn copy_rows_device(
        &self,
        plan: &PackPlan,
        direction: Direction,
        region: MemoryHandle,
        packed: MemoryHandle,
        limit: usize,
    ) -> Result<CompletionSignal> {
        let Placement::Device(device_id) = region.placement else {
            return Err(StrideError::InvalidArgument(
                "host region with a device-resident packed buffer".into(),
            ));
        };
        let lease = self.pool.stream(device_id)?;
        let signal = unsafe {
            cuda::run(
                direction,
                plan.descriptor(),
                region.addr as u64,
                packed.addr,
                packed.placement.storage_kind(),
                limit,
                lease,
            )?
        };
        Ok(signal)
    }

    #[cfg(not(feature = "cuda"))]
    unsafe fn copy_rows_device(
        &self,
        _plan: &PackPlan,
        _direction: Direction,
        region: MemoryHandle,
        _packed: MemoryHandle,
        _limit: usize,
    ) -> Result<CompletionSignal> {
        Err(dynamo_memory::StorageError::Unsupported(format!(
            "device copies for {:?} require the cuda feature",
            region.placement
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent3;
    use crate::layout::StrategyId;
    use crate::library::{LoopbackLibrary, LoopbackWorld};
    use dynamo_memory::StagingPoolConfig;
    use rstest::rstest;

    fn engine(threshold: usize) -> (Arc<LoopbackLibrary>, PackEngine) {
        let lib = Arc::new(LoopbackWorld::new(1).library(0));
        let pool = Arc::new(
            StagingPool::new(StagingPoolConfig {
                host_reserve_bytes: 1 << 20,
                ..Default::default()
            })
            .unwrap(),
        );
        let engine = PackEngine::new(lib.clone(), pool, LibraryCapabilities::default())
            .with_parallel_threshold(threshold);
        (lib, engine)
    }

    #[rstest]
    #[case(StrategyId::DirectCopy, Route::Staged)]
    #[case(StrategyId::Subarray, Route::Native)]
    #[case(StrategyId::V1HvHv, Route::Native)]
    fn test_host_round_trip(#[case] strategy: StrategyId, #[case] route: Route) {
        let (_lib, engine) = engine(usize::MAX);
        let copy = Extent3::new(24, 5, 3);
        let alloc = Extent3::new(40, 8, 4);
        let source: Vec<u8> = (0..alloc.product()).map(|i| (i * 7 % 256) as u8).collect();
        let plan = PackPlan::build(engine.library(), strategy, copy, alloc, 1).unwrap();
        assert_eq!(engine.route(&plan, Placement::Host), route);

        let mut packed =
            unsafe { engine.pack(&plan, MemoryHandle::host(source.as_ptr() as usize)) }.unwrap();
        assert_eq!(packed.len(), copy.product());
        let bytes = packed.as_bytes().unwrap().to_vec();

        let mut dest = vec![0u8; alloc.product()];
        unsafe {
            engine.unpack(
                &plan,
                MemoryHandle::host(bytes.as_ptr() as usize),
                bytes.len(),
                MemoryHandle::host(dest.as_mut_ptr() as usize),
            )
        }
        .unwrap()
        .wait()
        .unwrap();

        for row in plan.descriptor().rows() {
            let r = row.offset..row.offset + row.len;
            assert_eq!(dest[r.clone()], source[r]);
        }
    }

    #[test]
    fn test_parallel_pack_matches_native_pack() {
        let (_lib, engine) = engine(1);
        let copy = Extent3::new(100, 13, 47);
        let alloc = Extent3::new(128, 16, 48);
        let source: Vec<u8> = (0..alloc.product()).map(|i| (i % 253) as u8).collect();

        let staged = PackPlan::build(engine.library(), StrategyId::DirectCopy, copy, alloc, 1).unwrap();
        let native = PackPlan::build(engine.library(), StrategyId::V1HvHv, copy, alloc, 1).unwrap();
        let mut a = unsafe { engine.pack(&staged, MemoryHandle::host(source.as_ptr() as usize)) }.unwrap();
        let mut b = unsafe { engine.pack(&native, MemoryHandle::host(source.as_ptr() as usize)) }.unwrap();
        assert_eq!(a.as_bytes().unwrap(), b.as_bytes().unwrap());
        assert_eq!(a.len(), 61100);
    }

    #[test]
    fn test_staging_is_returned() {
        let (_lib, engine) = engine(usize::MAX);
        let plan = PackPlan::build(
            engine.library(),
            StrategyId::Contiguous,
            Extent3::new(64, 1, 1),
            Extent3::new(64, 1, 1),
            1,
        )
        .unwrap();
        let source = vec![5u8; 64];
        let packed = unsafe { engine.pack(&plan, MemoryHandle::host(source.as_ptr() as usize)) }.unwrap();
        assert_eq!(engine.pool().outstanding(), 1);
        drop(packed);
        assert_eq!(engine.pool().outstanding(), 0);
    }

    #[test]
    fn test_device_placement_routes() {
        let (_lib, engine) = engine(usize::MAX);
        let plan = PackPlan::build(
            engine.library(),
            StrategyId::Subarray,
            Extent3::new(8, 2, 2),
            Extent3::new(16, 4, 4),
            1,
        )
        .unwrap();
        assert_eq!(engine.route(&plan, Placement::Device(0)), Route::Staged);
        assert!(engine.can_stage(Placement::Host));
        assert_eq!(engine.can_stage(Placement::Device(0)), cfg!(feature = "cuda"));

        let aware = PackEngine::new(
            engine.library().clone(),
            engine.pool().clone(),
            LibraryCapabilities { device_aware: true },
        );
        assert_eq!(aware.route(&plan, Placement::Device(0)), Route::Native);
    }

    #[cfg(feature = "testing-cuda")]
    #[rstest]
    #[case(Extent3::new(24, 5, 3), Extent3::new(40, 8, 4))]
    #[case(Extent3::new(100, 13, 1), Extent3::new(128, 16, 1))]
    fn test_device_round_trip(#[case] copy: Extent3, #[case] alloc: Extent3) {
        use cudarc::driver::result as cuda_result;

        let (_lib, engine) = engine(usize::MAX);
        let plan = PackPlan::build(engine.library(), StrategyId::DirectCopy, copy, alloc, 1).unwrap();
        let source: Vec<u8> = (0..alloc.product()).map(|i| (i * 7 % 251 + 1) as u8).collect();

        let device_src = engine.acquire_staging(alloc.product(), Placement::Device(0)).unwrap();
        let device_dst = engine.acquire_staging(alloc.product(), Placement::Device(0)).unwrap();
        dynamo_memory::context::cuda_context(0).unwrap().bind_to_thread().unwrap();
        // stream-ordered allocations must be ready before synchronous copies touch them
        device_src.stream().unwrap().synchronize().unwrap();
        device_dst.stream().unwrap().synchronize().unwrap();
        unsafe {
            cuda_result::memcpy_htod_sync(device_src.addr() as u64, &source).unwrap();
            cuda_result::memcpy_htod_sync(device_dst.addr() as u64, &vec![0u8; alloc.product()])
                .unwrap();
        }

        let mut packed =
            unsafe { engine.pack(&plan, MemoryHandle::device(device_src.addr(), 0)) }.unwrap();
        packed.wait().unwrap();
        assert_eq!(packed.placement(), Placement::Host);
        let bytes = packed.as_bytes().unwrap().to_vec();
        let expected: Vec<u8> = plan
            .descriptor()
            .rows()
            .flat_map(|row| source[row.offset..row.offset + row.len].iter().copied())
            .collect();
        assert_eq!(bytes, expected);

        unsafe {
            engine.unpack(
                &plan,
                MemoryHandle::host(bytes.as_ptr() as usize),
                bytes.len(),
                MemoryHandle::device(device_dst.addr(), 0),
            )
        }
        .unwrap()
        .wait()
        .unwrap();

        let mut dest = vec![0u8; alloc.product()];
        unsafe { cuda_result::memcpy_dtoh_sync(&mut dest, device_dst.addr() as u64).unwrap() };
        let mut covered = 0;
        for row in plan.descriptor().rows() {
            let r = row.offset..row.offset + row.len;
            assert_eq!(dest[r.clone()], source[r]);
            covered += row.len;
        }
        // every source byte is non-zero, so only the rows were written
        assert_eq!(dest.iter().filter(|b| **b != 0).count(), covered);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_device_pack_without_cuda_fails_cleanly() {
        let (_lib, engine) = engine(usize::MAX);
        let plan = PackPlan::build(
            engine.library(),
            StrategyId::DirectCopy,
            Extent3::new(8, 2, 2),
            Extent3::new(16, 4, 4),
            1,
        )
        .unwrap();
        let result = unsafe { engine.pack(&plan, MemoryHandle::device(0x1000, 0)) };
        assert!(matches!(result, Err(StrideError::Storage(_))));
        assert_eq!(engine.pool().outstanding(), 0);
    }
}
