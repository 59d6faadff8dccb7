// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The interception layer.
//!
//! An [`Interceptor`] wraps a [`MessageLibrary`] and is itself one, so the application keeps
//! calling the same entry points. On the first call it resolves its mode from
//! [`StrideConfig`]:
//!
//! * **Bypass**: every call goes to the wrapped library untouched.
//! * **Active**: datatype constructors are recorded and decoded on commit. Transfers of a
//!   single instance of a decoded strided type, and transfers of device-resident contiguous
//!   buffers, go through a [`PackPlan`] chosen by the [`Selector`]: either the library moves
//!   the data with a substitute datatype, or the engine packs into a staging buffer that is
//!   sent as bytes. Anything else, and anything that fails before data moves, is forwarded.
//!
//! Non-blocking staged receives complete only once the unpack has finished; the
//! application's request handle stays live until then.

mod pending;
mod types;

use crate::config::StrideConfig;
use crate::datatype::TypeRecord;
use crate::engine::{LibraryCapabilities, MemoryHandle, PackEngine, Placement, Route};
use crate::extent::Extent3;
use crate::layout::{ShapeClass, StrategyId, classify};
use crate::library::{
    Communicator, Datatype, ErrorCode, LibResult, MessageLibrary, NamedType, Order,
    RequestHandle, Status, ThreadLevel,
};
use crate::plan::PackPlan;
use crate::selector::{PlacementPair, Selector, SizeBucket, measure};
use crate::topology::Topology;
use dynamo_memory::{MemoryDescription, StagingPool};
use parking_lot::Mutex;
use pending::{PendingKind, PendingTransfer};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use types::TypeRegistry;

/// How transfers have been handled since start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterceptStats {
    /// Sent or received by the library with a substitute datatype.
    pub native: u64,
    /// Packed or unpacked by the engine through a staging buffer.
    pub staged: u64,
    /// Passed through untouched.
    pub forwarded: u64,
    /// Optimization was attempted but failed before any data moved; passed through.
    pub fallbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    native: AtomicU64,
    staged: AtomicU64,
    forwarded: AtomicU64,
    fallbacks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> InterceptStats {
        InterceptStats {
            native: self.native.load(Ordering::Relaxed),
            staged: self.staged.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Send,
    Recv,
}

/// A transfer the interceptor takes over.
struct Transfer {
    plan: Arc<PackPlan>,
    region: MemoryHandle,
    route: Route,
}

struct ActiveState {
    thread_level: ThreadLevel,
    engine: PackEngine,
    selector: Selector,
    types: TypeRegistry,
    // keyed by the library's request handle
    pending: Mutex<HashMap<u64, PendingTransfer>>,
    byte: Datatype,
}

impl ActiveState {
    fn new(library: &Arc<dyn MessageLibrary>, config: &StrideConfig) -> crate::Result<Self> {
        let thread_level = library.thread_level();
        tracing::info!(%thread_level, "message library thread support");

        let capabilities = LibraryCapabilities {
            device_aware: config.device_aware,
        };
        let pool = Arc::new(StagingPool::new(config.staging_pool_config())?);
        let engine = PackEngine::new(library.clone(), pool, capabilities);

        let table = measure::initial_table(
            &engine,
            config.measure,
            config.measure_iterations,
            config.perf_cache_path.as_deref(),
        )
        .unwrap_or_else(|e| {
            tracing::warn!("strategy measurement failed, using defaults: {e}");
            Default::default()
        });

        Ok(Self {
            thread_level,
            selector: Selector::with_table(table, capabilities),
            types: TypeRegistry::new(library.as_ref()),
            pending: Mutex::new(HashMap::new()),
            byte: library.named_type(NamedType::Byte),
            engine,
        })
    }

    fn library(&self) -> &dyn MessageLibrary {
        self.engine.library().as_ref()
    }

    /// Build a plan, retrying with the general indexed encoding before giving up.
    fn build_plan(
        &self,
        strategy: StrategyId,
        copy: Extent3,
        alloc: Extent3,
        element_size: usize,
    ) -> Option<PackPlan> {
        let library = self.engine.library();
        match PackPlan::build(library, strategy, copy, alloc, element_size) {
            Ok(plan) => return Some(plan),
            Err(e) => tracing::debug!(%strategy, "plan construction failed: {e}"),
        }
        if strategy == StrategyId::Hindexed {
            return None;
        }
        match PackPlan::build(library, StrategyId::Hindexed, copy, alloc, element_size) {
            Ok(plan) => Some(plan),
            Err(e) => {
                tracing::warn!(%copy, %alloc, "no plan for region, forwarding: {e}");
                None
            }
        }
    }

    /// Decide whether the interceptor handles a transfer of `count` instances of `ty` at
    /// `addr`. `None` means forward the call.
    fn prepare(
        &self,
        topology: &dyn Topology,
        addr: usize,
        count: usize,
        ty: Datatype,
        side: Side,
    ) -> Option<Transfer> {
        let placement = topology.placement(addr);
        let pair = match side {
            Side::Send => PlacementPair::from((placement, Placement::Host)),
            Side::Recv => PlacementPair::from((Placement::Host, placement)),
        };

        let (plan, base) = match self.types.named(ty) {
            Some(_) if placement.is_host() => return None,
            Some(named) => {
                let len = count.checked_mul(named.size())?;
                if len == 0 {
                    return None;
                }
                let extent = Extent3::new(len, 1, 1);
                let strategy =
                    self.selector
                        .select(ShapeClass::Contiguous, SizeBucket::of(len), pair);
                let plan = self.build_plan(strategy, extent, extent, named.size())?;
                (Arc::new(plan), 0)
            }
            None => {
                if count != 1 {
                    return None;
                }
                let block = self.types.block(ty)?;
                if block.packed_len() == 0 {
                    return None;
                }
                let class = classify(&block.copy, &block.alloc);
                let strategy =
                    self.selector.select(class, SizeBucket::of(block.packed_len()), pair);
                let plan = match self.types.cached_plan(ty, strategy) {
                    Some(plan) => plan,
                    None => {
                        let plan =
                            self.build_plan(strategy, block.copy, block.alloc, block.element_size)?;
                        self.types.store_plan(ty, strategy, Arc::new(plan))
                    }
                };
                (plan, block.base_offset())
            }
        };

        let region = MemoryHandle {
            addr: addr.checked_add(base)?,
            placement,
        };
        let route = self.engine.route(&plan, placement);
        if route == Route::Staged && !self.engine.can_stage(placement) {
            tracing::debug!(?placement, "no device copy support, forwarding");
            return None;
        }
        tracing::trace!(
            strategy = %plan.strategy(),
            ?route,
            ?side,
            bytes = plan.packed_len(),
            "taking over transfer"
        );
        Some(Transfer {
            plan,
            region,
            route,
        })
    }

    fn native_datatype(transfer: &Transfer) -> LibResult<Datatype> {
        transfer.plan.datatype().ok_or(ErrorCode::ERR_INTERN)
    }
}

enum Mode {
    Bypass,
    Active(Box<ActiveState>),
}

/// A [`MessageLibrary`] that accelerates strided transfers of the library it wraps.
pub struct Interceptor {
    library: Arc<dyn MessageLibrary>,
    topology: Arc<dyn Topology>,
    config: StrideConfig,
    mode: OnceLock<Mode>,
    counters: Counters,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("mode", &self.mode.get().map(Self::name_of))
            .field("topology", &self.topology)
            .field("config", &self.config)
            .finish()
    }
}

impl Interceptor {
    pub fn new(library: Arc<dyn MessageLibrary>, config: StrideConfig) -> Self {
        Self {
            library,
            topology: default_topology(),
            config,
            mode: OnceLock::new(),
            counters: Counters::default(),
        }
    }

    /// Wrap `library` with the configuration from files and `DYN_STRIDE_*` variables, and
    /// install logging at the configured verbosity.
    pub fn from_settings(library: Arc<dyn MessageLibrary>) -> anyhow::Result<Self> {
        let config = StrideConfig::from_settings()?;
        crate::logging::init(config.verbosity);
        tracing::debug!(%config, "stride configuration");
        Ok(Self::new(library, config))
    }

    /// Replace the placement oracle. Only effective before the first call.
    pub fn with_topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = topology;
        self
    }

    pub fn config(&self) -> &StrideConfig {
        &self.config
    }

    /// "bypass" or "active". Resolves the mode if no call has done so yet.
    pub fn mode_name(&self) -> &'static str {
        Self::name_of(self.mode())
    }

    pub fn is_active(&self) -> bool {
        matches!(self.mode(), Mode::Active(_))
    }

    pub fn stats(&self) -> InterceptStats {
        self.counters.snapshot()
    }

    /// The strategy selector, when active.
    pub fn selector(&self) -> Option<&Selector> {
        match self.mode() {
            Mode::Active(state) => Some(&state.selector),
            Mode::Bypass => None,
        }
    }

    /// Non-blocking transfers still holding staging memory or plans.
    pub fn pending_transfers(&self) -> usize {
        match self.mode() {
            Mode::Active(state) => state.pending.lock().len(),
            Mode::Bypass => 0,
        }
    }

    /// Derived datatypes currently recorded.
    pub fn recorded_types(&self) -> usize {
        match self.mode() {
            Mode::Active(state) => state.types.len(),
            Mode::Bypass => 0,
        }
    }

    fn name_of(mode: &Mode) -> &'static str {
        match mode {
            Mode::Bypass => "bypass",
            Mode::Active(_) => "active",
        }
    }

    fn mode(&self) -> &Mode {
        self.mode.get_or_init(|| self.resolve())
    }

    fn resolve(&self) -> Mode {
        if self.config.disable {
            tracing::info!("stride layer disabled, forwarding all calls");
            return Mode::Bypass;
        }
        match ActiveState::new(&self.library, &self.config) {
            Ok(state) => {
                tracing::info!("stride layer active");
                Mode::Active(Box::new(state))
            }
            Err(e) => {
                tracing::warn!("stride layer failed to initialize, forwarding all calls: {e}");
                Mode::Bypass
            }
        }
    }

    fn active(&self) -> Option<&ActiveState> {
        match self.mode() {
            Mode::Active(state) => Some(state),
            Mode::Bypass => None,
        }
    }

    /// Take over a transfer, or count it as forwarded.
    fn take_over(
        &self,
        addr: usize,
        count: usize,
        ty: Datatype,
        side: Side,
    ) -> Option<(&ActiveState, Transfer)> {
        let taken = self.active().and_then(|state| {
            state
                .prepare(self.topology.as_ref(), addr, count, ty, side)
                .map(|transfer| (state, transfer))
        });
        if taken.is_none() {
            Counters::bump(&self.counters.forwarded);
        }
        taken
    }

    fn record_constructed(
        &self,
        result: LibResult<Datatype>,
        old: Datatype,
        build: impl FnOnce(Arc<TypeRecord>) -> TypeRecord,
    ) -> LibResult<Datatype> {
        let ty = result?;
        if let Some(state) = self.active() {
            match state.types.record(old) {
                Some(old) => state.types.insert(ty, build(old)),
                None => tracing::trace!(?ty, "base type unknown, not recording"),
            }
        }
        Ok(ty)
    }

    fn fall_back(&self, what: &str, e: crate::StrideError) {
        tracing::debug!("{what} failed before data moved, forwarding: {e}");
        Counters::bump(&self.counters.fallbacks);
    }

    /// Complete a pending transfer for `request`, if the interceptor owns one.
    fn progress_pending(
        &self,
        request: &mut RequestHandle,
        blocking: bool,
    ) -> Option<LibResult<Option<Status>>> {
        let state = self.active()?;
        let key = request.0;
        let mut transfer = state.pending.lock().remove(&key)?;
        let result = transfer.progress(state.library(), &state.engine, *request, blocking);
        match result {
            Ok(Some(status)) => {
                *request = RequestHandle::NULL;
                Some(Ok(Some(status)))
            }
            Ok(None) => {
                state.pending.lock().insert(key, transfer);
                Some(Ok(None))
            }
            Err(code) => {
                // a failed completion retires the library request, so the staging memory
                // and plan go with it
                tracing::debug!(request = key, "non-blocking transfer failed: {code}");
                drop(transfer);
                *request = RequestHandle::NULL;
                Some(Err(code))
            }
        }
    }
}

#[cfg(feature = "cuda")]
fn default_topology() -> Arc<dyn Topology> {
    Arc::new(crate::topology::CudaTopology)
}

#[cfg(not(feature = "cuda"))]
fn default_topology() -> Arc<dyn Topology> {
    Arc::new(crate::topology::HostTopology)
}

impl MessageLibrary for Interceptor {
    fn thread_level(&self) -> ThreadLevel {
        match self.active() {
            Some(state) => state.thread_level,
            None => self.library.thread_level(),
        }
    }

    fn comm_rank(&self, comm: Communicator) -> LibResult<i32> {
        self.library.comm_rank(comm)
    }

    fn comm_size(&self, comm: Communicator) -> LibResult<i32> {
        self.library.comm_size(comm)
    }

    fn named_type(&self, ty: NamedType) -> Datatype {
        self.library.named_type(ty)
    }

    fn type_contiguous(&self, count: usize, old: Datatype) -> LibResult<Datatype> {
        let result = self.library.type_contiguous(count, old);
        self.record_constructed(result, old, |old| TypeRecord::Contiguous { count, old })
    }

    fn type_vector(
        &self,
        count: usize,
        blocklength: usize,
        stride: isize,
        old: Datatype,
    ) -> LibResult<Datatype> {
        let result = self.library.type_vector(count, blocklength, stride, old);
        self.record_constructed(result, old, |old| TypeRecord::Vector {
            count,
            blocklength,
            stride,
            old,
        })
    }

    fn type_create_hvector(
        &self,
        count: usize,
        blocklength: usize,
        stride: isize,
        old: Datatype,
    ) -> LibResult<Datatype> {
        let result = self.library.type_create_hvector(count, blocklength, stride, old);
        self.record_constructed(result, old, |old| TypeRecord::Hvector {
            count,
            blocklength,
            stride,
            old,
        })
    }

    fn type_create_hindexed(
        &self,
        blocklengths: &[usize],
        displacements: &[isize],
        old: Datatype,
    ) -> LibResult<Datatype> {
        let result = self.library.type_create_hindexed(blocklengths, displacements, old);
        self.record_constructed(result, old, |old| TypeRecord::Hindexed {
            blocklengths: blocklengths.to_vec(),
            displacements: displacements.to_vec(),
            old,
        })
    }

    fn type_create_hindexed_block(
        &self,
        blocklength: usize,
        displacements: &[isize],
        old: Datatype,
    ) -> LibResult<Datatype> {
        let result = self.library.type_create_hindexed_block(blocklength, displacements, old);
        self.record_constructed(result, old, |old| TypeRecord::HindexedBlock {
            blocklength,
            displacements: displacements.to_vec(),
            old,
        })
    }

    fn type_create_subarray(
        &self,
        sizes: &[usize],
        subsizes: &[usize],
        starts: &[usize],
        order: Order,
        old: Datatype,
    ) -> LibResult<Datatype> {
        let result = self.library.type_create_subarray(sizes, subsizes, starts, order, old);
        self.record_constructed(result, old, |old| TypeRecord::Subarray {
            sizes: sizes.to_vec(),
            subsizes: subsizes.to_vec(),
            starts: starts.to_vec(),
            order,
            old,
        })
    }

    fn type_commit(&self, ty: Datatype) -> LibResult<()> {
        self.library.type_commit(ty)?;
        if let Some(state) = self.active() {
            match state.types.commit(ty) {
                Some(block) => tracing::debug!(
                    ?ty,
                    copy = %block.copy,
                    alloc = %block.alloc,
                    start = %block.start,
                    "decoded strided datatype"
                ),
                None => tracing::trace!(?ty, "datatype is not a strided block"),
            }
        }
        Ok(())
    }

    fn type_free(&self, ty: Datatype) -> LibResult<()> {
        self.library.type_free(ty)?;
        if let Some(state) = self.active() {
            state.types.remove(ty);
        }
        Ok(())
    }

    fn type_size(&self, ty: Datatype) -> LibResult<usize> {
        self.library.type_size(ty)
    }

    fn type_extent(&self, ty: Datatype) -> LibResult<(isize, usize)> {
        self.library.type_extent(ty)
    }

    unsafe fn pack(
        &self,
        inbuf: *const u8,
        incount: usize,
        ty: Datatype,
        outbuf: *mut u8,
        outsize: usize,
        position: &mut usize,
    ) -> LibResult<()> {
        unsafe { self.library.pack(inbuf, incount, ty, outbuf, outsize, position) }
    }

    unsafe fn unpack(
        &self,
        inbuf: *const u8,
        insize: usize,
        position: &mut usize,
        outbuf: *mut u8,
        outcount: usize,
        ty: Datatype,
    ) -> LibResult<()> {
        unsafe { self.library.unpack(inbuf, insize, position, outbuf, outcount, ty) }
    }

    unsafe fn send(
        &self,
        buf: *const u8,
        count: usize,
        ty: Datatype,
        dest: i32,
        tag: i32,
        comm: Communicator,
    ) -> LibResult<()> {
        if let Some((state, transfer)) = self.take_over(buf as usize, count, ty, Side::Send) {
            match transfer.route {
                Route::Native => {
                    let datatype = ActiveState::native_datatype(&transfer)?;
                    Counters::bump(&self.counters.native);
                    return unsafe {
                        self.library
                            .send(transfer.region.addr as *const u8, 1, datatype, dest, tag, comm)
                    };
                }
                Route::Staged => {
                    let packed = unsafe { state.engine.pack(&transfer.plan, transfer.region) }
                        .and_then(|mut packed| packed.wait().map(|_| packed));
                    match packed {
                        Ok(packed) => {
                            Counters::bump(&self.counters.staged);
                            return unsafe {
                                self.library.send(
                                    packed.addr() as *const u8,
                                    packed.len(),
                                    state.byte,
                                    dest,
                                    tag,
                                    comm,
                                )
                            };
                        }
                        Err(e) => self.fall_back("pack", e),
                    }
                }
            }
        }
        unsafe { self.library.send(buf, count, ty, dest, tag, comm) }
    }

    unsafe fn recv(
        &self,
        buf: *mut u8,
        count: usize,
        ty: Datatype,
        source: i32,
        tag: i32,
        comm: Communicator,
    ) -> LibResult<Status> {
        if let Some((state, transfer)) = self.take_over(buf as usize, count, ty, Side::Recv) {
            match transfer.route {
                Route::Native => {
                    let datatype = ActiveState::native_datatype(&transfer)?;
                    Counters::bump(&self.counters.native);
                    return unsafe {
                        self.library
                            .recv(transfer.region.addr as *mut u8, 1, datatype, source, tag, comm)
                    };
                }
                Route::Staged => {
                    match state
                        .engine
                        .acquire_staging(transfer.plan.packed_len(), Placement::Host)
                    {
                        Ok(staging) => {
                            Counters::bump(&self.counters.staged);
                            let status = unsafe {
                                self.library.recv(
                                    staging.addr() as *mut u8,
                                    staging.len(),
                                    state.byte,
                                    source,
                                    tag,
                                    comm,
                                )?
                            };
                            if status.cancelled {
                                return Ok(status);
                            }
                            let packed = MemoryHandle::host(staging.addr());
                            unsafe {
                                state.engine.unpack(
                                    &transfer.plan,
                                    packed,
                                    status.count_bytes,
                                    transfer.region,
                                )
                            }
                            .and_then(|signal| signal.wait().map_err(Into::into))
                            .map_err(|e| {
                                tracing::error!("unpack of a received message failed: {e}");
                                e.error_code()
                            })?;
                            return Ok(status);
                        }
                        Err(e) => self.fall_back("staging", e),
                    }
                }
            }
        }
        unsafe { self.library.recv(buf, count, ty, source, tag, comm) }
    }

    unsafe fn isend(
        &self,
        buf: *const u8,
        count: usize,
        ty: Datatype,
        dest: i32,
        tag: i32,
        comm: Communicator,
    ) -> LibResult<RequestHandle> {
        if let Some((state, transfer)) = self.take_over(buf as usize, count, ty, Side::Send) {
            match transfer.route {
                Route::Native => {
                    let datatype = ActiveState::native_datatype(&transfer)?;
                    Counters::bump(&self.counters.native);
                    let request = unsafe {
                        self.library.isend(
                            transfer.region.addr as *const u8,
                            1,
                            datatype,
                            dest,
                            tag,
                            comm,
                        )?
                    };
                    state.pending.lock().insert(
                        request.0,
                        PendingTransfer::new(PendingKind::Retained {
                            _plan: transfer.plan,
                            _packed: None,
                        }),
                    );
                    return Ok(request);
                }
                Route::Staged => {
                    // the bytes must be in place before the library reads them
                    let packed = unsafe { state.engine.pack(&transfer.plan, transfer.region) }
                        .and_then(|mut packed| packed.wait().map(|_| packed));
                    match packed {
                        Ok(packed) => {
                            Counters::bump(&self.counters.staged);
                            let request = unsafe {
                                self.library.isend(
                                    packed.addr() as *const u8,
                                    packed.len(),
                                    state.byte,
                                    dest,
                                    tag,
                                    comm,
                                )?
                            };
                            state.pending.lock().insert(
                                request.0,
                                PendingTransfer::new(PendingKind::Retained {
                                    _plan: transfer.plan,
                                    _packed: Some(packed),
                                }),
                            );
                            return Ok(request);
                        }
                        Err(e) => self.fall_back("pack", e),
                    }
                }
            }
        }
        unsafe { self.library.isend(buf, count, ty, dest, tag, comm) }
    }

    unsafe fn irecv(
        &self,
        buf: *mut u8,
        count: usize,
        ty: Datatype,
        source: i32,
        tag: i32,
        comm: Communicator,
    ) -> LibResult<RequestHandle> {
        if let Some((state, transfer)) = self.take_over(buf as usize, count, ty, Side::Recv) {
            match transfer.route {
                Route::Native => {
                    let datatype = ActiveState::native_datatype(&transfer)?;
                    Counters::bump(&self.counters.native);
                    let request = unsafe {
                        self.library.irecv(
                            transfer.region.addr as *mut u8,
                            1,
                            datatype,
                            source,
                            tag,
                            comm,
                        )?
                    };
                    state.pending.lock().insert(
                        request.0,
                        PendingTransfer::new(PendingKind::Retained {
                            _plan: transfer.plan,
                            _packed: None,
                        }),
                    );
                    return Ok(request);
                }
                Route::Staged => {
                    match state
                        .engine
                        .acquire_staging(transfer.plan.packed_len(), Placement::Host)
                    {
                        Ok(staging) => {
                            Counters::bump(&self.counters.staged);
                            let request = unsafe {
                                self.library.irecv(
                                    staging.addr() as *mut u8,
                                    staging.len(),
                                    state.byte,
                                    source,
                                    tag,
                                    comm,
                                )?
                            };
                            state.pending.lock().insert(
                                request.0,
                                PendingTransfer::new(PendingKind::StagedRecv {
                                    plan: transfer.plan,
                                    staging,
                                    region: transfer.region,
                                    unpack: None,
                                }),
                            );
                            return Ok(request);
                        }
                        Err(e) => self.fall_back("staging", e),
                    }
                }
            }
        }
        unsafe { self.library.irecv(buf, count, ty, source, tag, comm) }
    }

    fn wait(&self, request: &mut RequestHandle) -> LibResult<Status> {
        match self.progress_pending(request, true) {
            Some(result) => result?.ok_or(ErrorCode::ERR_INTERN),
            None => self.library.wait(request),
        }
    }

    fn test(&self, request: &mut RequestHandle) -> LibResult<Option<Status>> {
        match self.progress_pending(request, false) {
            Some(result) => result,
            None => self.library.test(request),
        }
    }

    fn cancel(&self, request: &RequestHandle) -> LibResult<()> {
        if let Some(state) = self.active() {
            let done = state.pending.lock().get(&request.0).map(|t| t.request_done());
            // the library already completed it; only the unpack is outstanding
            if done == Some(true) {
                return Ok(());
            }
        }
        self.library.cancel(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{LoopbackLibrary, LoopbackWorld};

    fn config() -> StrideConfig {
        StrideConfig::builder().measure(false).build().unwrap()
    }

    fn single() -> (Arc<LoopbackLibrary>, Interceptor) {
        let lib = Arc::new(LoopbackWorld::new(1).library(0));
        let interceptor = Interceptor::new(lib.clone(), config());
        (lib, interceptor)
    }

    #[test]
    fn test_mode_follows_config() {
        let (_lib, interceptor) = single();
        assert_eq!(interceptor.mode_name(), "active");

        let lib = Arc::new(LoopbackWorld::new(1).library(0));
        let disabled = Interceptor::new(
            lib,
            StrideConfig::builder().disable(true).build().unwrap(),
        );
        assert_eq!(disabled.mode_name(), "bypass");
        assert!(disabled.selector().is_none());
    }

    #[test]
    fn test_types_are_recorded_and_forgotten() {
        let (lib, interceptor) = single();
        let byte = interceptor.named_type(NamedType::Byte);
        let row = interceptor.type_vector(4, 8, 32, byte).unwrap();
        let plane = interceptor.type_create_hvector(3, 1, 32 * 8, row).unwrap();
        interceptor.type_commit(plane).unwrap();
        assert_eq!(interceptor.recorded_types(), 2);

        let state = interceptor.active().unwrap();
        let block = state.types.block(plane).unwrap();
        assert_eq!(block.copy, Extent3::new(8, 4, 3));
        assert_eq!(block.alloc, Extent3::new(32, 8, 3));

        interceptor.type_free(plane).unwrap();
        interceptor.type_free(row).unwrap();
        assert_eq!(interceptor.recorded_types(), 0);
        assert_eq!(lib.live_types(), 0);
    }

    #[test]
    fn test_self_send_through_substitute_datatype() {
        let (lib, interceptor) = single();
        let byte = interceptor.named_type(NamedType::Byte);
        let ty = interceptor.type_vector(5, 12, 20, byte).unwrap();
        interceptor.type_commit(ty).unwrap();

        let source: Vec<u8> = (0..100u8).collect();
        let mut dest = vec![0u8; 100];
        unsafe {
            interceptor
                .send(source.as_ptr(), 1, ty, 0, 7, Communicator::WORLD)
                .unwrap();
            let status = interceptor
                .recv(dest.as_mut_ptr(), 1, ty, 0, 7, Communicator::WORLD)
                .unwrap();
            assert_eq!(status.count_bytes, 60);
        }
        for row in 0..5 {
            let r = row * 20..row * 20 + 12;
            assert_eq!(dest[r.clone()], source[r]);
            assert!(dest[row * 20 + 12..row * 20 + 20].iter().all(|&b| b == 0));
        }
        assert_eq!(interceptor.stats().native, 2);

        interceptor.type_free(ty).unwrap();
        assert_eq!(lib.live_types(), 0);
    }

    #[test]
    fn test_named_host_transfers_are_forwarded() {
        let (_lib, interceptor) = single();
        let int = interceptor.named_type(NamedType::Int);
        let source = [1i32, 2, 3, 4];
        let mut dest = [0i32; 4];
        unsafe {
            interceptor
                .send(source.as_ptr() as *const u8, 4, int, 0, 0, Communicator::WORLD)
                .unwrap();
            interceptor
                .recv(dest.as_mut_ptr() as *mut u8, 4, int, 0, 0, Communicator::WORLD)
                .unwrap();
        }
        assert_eq!(dest, source);
        assert_eq!(interceptor.stats().forwarded, 2);
        assert_eq!(interceptor.stats().native, 0);
    }

    #[test]
    fn test_cancel_pending_receive() {
        let (_lib, interceptor) = single();
        let byte = interceptor.named_type(NamedType::Byte);
        let ty = interceptor.type_vector(2, 4, 8, byte).unwrap();
        interceptor.type_commit(ty).unwrap();

        let mut dest = vec![0u8; 16];
        let mut request =
            unsafe { interceptor.irecv(dest.as_mut_ptr(), 1, ty, 0, 3, Communicator::WORLD) }
                .unwrap();
        assert_eq!(interceptor.pending_transfers(), 1);
        interceptor.cancel(&request).unwrap();
        let status = interceptor.wait(&mut request).unwrap();
        assert!(status.cancelled);
        assert!(request.is_null());
        assert_eq!(interceptor.pending_transfers(), 0);
    }

    #[test]
    fn test_truncated_receive_retires_request() {
        let (lib, interceptor) = single();
        let byte = interceptor.named_type(NamedType::Byte);
        let ty = interceptor.type_vector(2, 4, 8, byte).unwrap();
        interceptor.type_commit(ty).unwrap();

        let mut dest = vec![0u8; 16];
        let mut request =
            unsafe { interceptor.irecv(dest.as_mut_ptr(), 1, ty, 0, 9, Communicator::WORLD) }
                .unwrap();
        assert_eq!(interceptor.pending_transfers(), 1);

        // 64 bytes into an 8 byte receive
        let source = [7u8; 64];
        unsafe {
            interceptor
                .send(source.as_ptr(), 64, byte, 0, 9, Communicator::WORLD)
                .unwrap();
        }
        assert_eq!(interceptor.wait(&mut request), Err(ErrorCode::ERR_TRUNCATE));
        assert!(request.is_null());
        assert_eq!(interceptor.pending_transfers(), 0);

        // the retired handle behaves like any null request
        let status = interceptor.wait(&mut request).unwrap();
        assert_eq!(status.count_bytes, 0);

        interceptor.type_free(ty).unwrap();
        assert_eq!(lib.live_types(), 0);
    }
}
