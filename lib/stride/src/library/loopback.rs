// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process message library.
//!
//! A [`LoopbackWorld`] hosts a fixed number of ranks inside one process; each rank talks to
//! it through its own [`LoopbackLibrary`]. Derived datatypes are flattened into typemaps
//! (ordered `(displacement, length)` byte runs plus lower bound and extent) so pack, unpack
//! and transfers follow the same rules as a production library. Matching is non-overtaking:
//! a message goes to the oldest posted receive that matches it, otherwise it waits in the
//! unexpected queue for the next receive.

use super::{
    ANY_SOURCE, ANY_TAG, Communicator, Datatype, ErrorCode, LibResult, MessageLibrary, NamedType,
    Order, RequestHandle, Status, ThreadLevel,
};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const FIRST_DERIVED_HANDLE: u64 = 64;

/// One contiguous byte run of a typemap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    offset: isize,
    len: usize,
}

#[derive(Debug, Clone)]
struct TypeEntry {
    runs: Arc<Vec<Run>>,
    size: usize,
    lb: isize,
    ub: isize,
    committed: bool,
    named: bool,
}

impl TypeEntry {
    fn named(ty: NamedType) -> Self {
        let size = ty.size();
        Self {
            runs: Arc::new(vec![Run {
                offset: 0,
                len: size,
            }]),
            size,
            lb: 0,
            ub: size as isize,
            committed: true,
            named: true,
        }
    }

    fn extent(&self) -> isize {
        self.ub - self.lb
    }

    fn is_dense(&self) -> bool {
        self.lb == 0
            && self.runs.len() == 1
            && self.runs[0].offset == 0
            && self.runs[0].len as isize == self.ub
    }
}

/// Accumulates placed copies of an old type into a new typemap.
#[derive(Default)]
struct MapBuilder {
    runs: Vec<Run>,
    size: usize,
    lb: Option<isize>,
    ub: Option<isize>,
}

impl MapBuilder {
    fn push(&mut self, offset: isize, len: usize) {
        if len == 0 {
            return;
        }
        self.size += len;
        match self.runs.last_mut() {
            Some(last) if last.offset + last.len as isize == offset => last.len += len,
            _ => self.runs.push(Run { offset, len }),
        }
    }

    fn bound(&mut self, lb: isize, ub: isize) {
        self.lb = Some(self.lb.map_or(lb, |cur| cur.min(lb)));
        self.ub = Some(self.ub.map_or(ub, |cur| cur.max(ub)));
    }

    /// Place `count` back-to-back copies of `old` starting at byte displacement `disp`.
    fn place_repeated(&mut self, old: &TypeEntry, disp: isize, count: usize) {
        if count == 0 {
            return;
        }
        let extent = old.extent();
        if old.is_dense() {
            self.push(disp, old.size * count);
        } else {
            for k in 0..count {
                let base = disp + k as isize * extent;
                for run in old.runs.iter() {
                    self.push(base + run.offset, run.len);
                }
            }
        }
        let last = disp + (count as isize - 1) * extent;
        self.bound(disp + old.lb, last + old.ub);
    }

    fn finish(self) -> TypeEntry {
        TypeEntry {
            runs: Arc::new(self.runs),
            size: self.size,
            lb: self.lb.unwrap_or(0),
            ub: self.ub.unwrap_or(0),
            committed: false,
            named: false,
        }
    }
}

/// Counters observed by tests and benchmarks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub sends: usize,
    pub recvs: usize,
    pub packs: usize,
    pub unpacks: usize,
    pub types_created: usize,
    pub types_freed: usize,
    pub bytes_sent: usize,
}

#[derive(Default)]
struct Counters {
    sends: AtomicUsize,
    recvs: AtomicUsize,
    packs: AtomicUsize,
    unpacks: AtomicUsize,
    types_created: AtomicUsize,
    types_freed: AtomicUsize,
    bytes_sent: AtomicUsize,
}

struct Envelope {
    source: i32,
    tag: i32,
    comm: Communicator,
    payload: Vec<u8>,
}

struct PostedRecv {
    request: u64,
    buf: usize,
    count: usize,
    entry: TypeEntry,
    source: i32,
    tag: i32,
    comm: Communicator,
}

impl PostedRecv {
    fn matches(&self, envelope: &Envelope) -> bool {
        self.comm == envelope.comm
            && (self.source == ANY_SOURCE || self.source == envelope.source)
            && (self.tag == ANY_TAG || self.tag == envelope.tag)
    }

    /// Scatter the payload into the receive buffer.
    fn deliver(&self, envelope: Envelope) -> LibResult<Status> {
        let capacity = self.entry.size * self.count;
        if envelope.payload.len() > capacity {
            return Err(ErrorCode::ERR_TRUNCATE);
        }
        // SAFETY: the poster guaranteed `buf` covers `count` instances of the type
        unsafe {
            scatter(
                &envelope.payload,
                self.buf as *mut u8,
                self.count,
                &self.entry,
            );
        }
        Ok(Status {
            source: envelope.source,
            tag: envelope.tag,
            error: ErrorCode::SUCCESS,
            count_bytes: envelope.payload.len(),
            cancelled: false,
        })
    }
}

#[derive(Default)]
struct MailboxState {
    unexpected: VecDeque<Envelope>,
    posted: VecDeque<PostedRecv>,
    completed: HashMap<u64, LibResult<Status>>,
}

#[derive(Default)]
struct Mailbox {
    state: Mutex<MailboxState>,
    arrived: Condvar,
}

/// Shared state of an in-process set of ranks.
pub struct LoopbackWorld {
    mailboxes: Vec<Mailbox>,
    thread_level: ThreadLevel,
}

impl LoopbackWorld {
    pub fn new(ranks: usize) -> Arc<Self> {
        Self::with_thread_level(ranks, ThreadLevel::Multiple)
    }

    pub fn with_thread_level(ranks: usize, thread_level: ThreadLevel) -> Arc<Self> {
        Arc::new(Self {
            mailboxes: (0..ranks).map(|_| Mailbox::default()).collect(),
            thread_level,
        })
    }

    pub fn size(&self) -> usize {
        self.mailboxes.len()
    }

    /// Library endpoint for `rank`.
    pub fn library(self: &Arc<Self>, rank: i32) -> LoopbackLibrary {
        LoopbackLibrary::new(self.clone(), rank)
    }
}

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Send,
    Recv,
}

/// One rank's view of a [`LoopbackWorld`].
pub struct LoopbackLibrary {
    world: Arc<LoopbackWorld>,
    rank: i32,
    types: DashMap<u64, TypeEntry>,
    next_type: AtomicU64,
    requests: DashMap<u64, RequestKind>,
    next_request: AtomicU64,
    counters: Counters,
}

impl std::fmt::Debug for LoopbackLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackLibrary")
            .field("rank", &self.rank)
            .field("world_size", &self.world.size())
            .field("live_types", &self.live_types())
            .finish()
    }
}

impl LoopbackLibrary {
    fn new(world: Arc<LoopbackWorld>, rank: i32) -> Self {
        let types = DashMap::new();
        for ty in NamedType::ALL {
            types.insert(named_handle(ty).0, TypeEntry::named(ty));
        }
        Self {
            world,
            rank,
            types,
            next_type: AtomicU64::new(FIRST_DERIVED_HANDLE),
            requests: DashMap::new(),
            next_request: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Number of derived datatypes created and not yet freed.
    pub fn live_types(&self) -> usize {
        self.types.iter().filter(|entry| !entry.named).count()
    }

    pub fn stats(&self) -> LoopbackStats {
        let c = &self.counters;
        LoopbackStats {
            sends: c.sends.load(Ordering::Relaxed),
            recvs: c.recvs.load(Ordering::Relaxed),
            packs: c.packs.load(Ordering::Relaxed),
            unpacks: c.unpacks.load(Ordering::Relaxed),
            types_created: c.types_created.load(Ordering::Relaxed),
            types_freed: c.types_freed.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// The flattened typemap of `ty` as `(displacement, length)` byte runs.
    ///
    /// Adjacent runs are merged, so the result is the canonical byte coverage of one
    /// instance of the type.
    pub fn typemap(&self, ty: Datatype) -> LibResult<Vec<(isize, usize)>> {
        let entry = self.entry(ty)?;
        Ok(entry.runs.iter().map(|r| (r.offset, r.len)).collect())
    }

    fn entry(&self, ty: Datatype) -> LibResult<TypeEntry> {
        self.types
            .get(&ty.0)
            .map(|e| e.clone())
            .ok_or(ErrorCode::ERR_TYPE)
    }

    /// Type usable for communication: exists and is committed.
    fn usable(&self, ty: Datatype) -> LibResult<TypeEntry> {
        let entry = self.entry(ty)?;
        if !entry.committed {
            return Err(ErrorCode::ERR_TYPE);
        }
        Ok(entry)
    }

    fn register(&self, builder: MapBuilder) -> Datatype {
        let handle = self.next_type.fetch_add(1, Ordering::Relaxed);
        self.types.insert(handle, builder.finish());
        self.counters.types_created.fetch_add(1, Ordering::Relaxed);
        Datatype(handle)
    }

    fn check_comm(&self, comm: Communicator) -> LibResult<()> {
        if comm == Communicator::WORLD {
            Ok(())
        } else {
            Err(ErrorCode::ERR_COMM)
        }
    }

    fn check_peer(&self, rank: i32, wildcard_ok: bool) -> LibResult<()> {
        if wildcard_ok && rank == ANY_SOURCE {
            return Ok(());
        }
        if rank < 0 || rank as usize >= self.world.size() {
            return Err(ErrorCode::ERR_RANK);
        }
        Ok(())
    }

    fn mailbox(&self) -> &Mailbox {
        &self.world.mailboxes[self.rank as usize]
    }

    fn post_send(&self, payload: Vec<u8>, dest: i32, tag: i32, comm: Communicator) {
        self.counters.sends.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(payload.len(), Ordering::Relaxed);

        let envelope = Envelope {
            source: self.rank,
            tag,
            comm,
            payload,
        };

        let mailbox = &self.world.mailboxes[dest as usize];
        let mut state = mailbox.state.lock();
        let found = state.posted.iter().position(|p| p.matches(&envelope));
        match found {
            Some(pos) => {
                if let Some(posted) = state.posted.remove(pos) {
                    let result = posted.deliver(envelope);
                    state.completed.insert(posted.request, result);
                }
            }
            None => state.unexpected.push_back(envelope),
        }
        mailbox.arrived.notify_all();
    }

    fn post_recv(&self, posted: PostedRecv) {
        self.counters.recvs.fetch_add(1, Ordering::Relaxed);
        let mut state = self.mailbox().state.lock();
        let found = state.unexpected.iter().position(|e| posted.matches(e));
        match found {
            Some(pos) => {
                if let Some(envelope) = state.unexpected.remove(pos) {
                    let result = posted.deliver(envelope);
                    state.completed.insert(posted.request, result);
                }
            }
            None => state.posted.push_back(posted),
        }
    }

    fn new_request(&self, kind: RequestKind) -> u64 {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.requests.insert(id, kind);
        id
    }

    fn finish_request(&self, request: &mut RequestHandle) {
        self.requests.remove(&request.0);
        *request = RequestHandle::NULL;
    }
}

/// Handles of predefined types are fixed and identical on every rank.
fn named_handle(ty: NamedType) -> Datatype {
    let index = NamedType::ALL.iter().position(|t| *t == ty).unwrap_or(0);
    Datatype(1 + index as u64)
}

/// Copy the typemap of `count` instances at `inbuf` into `out`.
unsafe fn gather(inbuf: *const u8, count: usize, entry: &TypeEntry, out: &mut [u8]) {
    let extent = entry.extent();
    let mut pos = 0usize;
    for c in 0..count {
        let base = c as isize * extent;
        for run in entry.runs.iter() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    inbuf.offset(base + run.offset),
                    out.as_mut_ptr().add(pos),
                    run.len,
                );
            }
            pos += run.len;
        }
    }
}

/// Write `data` into the typemap of up to `count` instances at `outbuf`, stopping when
/// `data` runs out.
unsafe fn scatter(data: &[u8], outbuf: *mut u8, count: usize, entry: &TypeEntry) {
    let extent = entry.extent();
    let mut pos = 0usize;
    'outer: for c in 0..count {
        let base = c as isize * extent;
        for run in entry.runs.iter() {
            let remaining = data.len() - pos;
            if remaining == 0 {
                break 'outer;
            }
            let len = run.len.min(remaining);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(pos),
                    outbuf.offset(base + run.offset),
                    len,
                );
            }
            pos += len;
        }
    }
}

impl MessageLibrary for LoopbackLibrary {
    fn thread_level(&self) -> ThreadLevel {
        self.world.thread_level
    }

    fn comm_rank(&self, comm: Communicator) -> LibResult<i32> {
        self.check_comm(comm)?;
        Ok(self.rank)
    }

    fn comm_size(&self, comm: Communicator) -> LibResult<i32> {
        self.check_comm(comm)?;
        Ok(self.world.size() as i32)
    }

    fn named_type(&self, ty: NamedType) -> Datatype {
        named_handle(ty)
    }

    fn type_contiguous(&self, count: usize, old: Datatype) -> LibResult<Datatype> {
        let old = self.entry(old)?;
        let mut map = MapBuilder::default();
        map.place_repeated(&old, 0, count);
        Ok(self.register(map))
    }

    fn type_vector(
        &self,
        count: usize,
        blocklength: usize,
        stride: isize,
        old: Datatype,
    ) -> LibResult<Datatype> {
        let old = self.entry(old)?;
        let extent = old.extent();
        let mut map = MapBuilder::default();
        for i in 0..count {
            map.place_repeated(&old, i as isize * stride * extent, blocklength);
        }
        Ok(self.register(map))
    }

    fn type_create_hvector(
        &self,
        count: usize,
        blocklength: usize,
        stride: isize,
        old: Datatype,
    ) -> LibResult<Datatype> {
        let old = self.entry(old)?;
        let mut map = MapBuilder::default();
        for i in 0..count {
            map.place_repeated(&old, i as isize * stride, blocklength);
        }
        Ok(self.register(map))
    }

    fn type_create_hindexed(
        &self,
        blocklengths: &[usize],
        displacements: &[isize],
        old: Datatype,
    ) -> LibResult<Datatype> {
        if blocklengths.len() != displacements.len() {
            return Err(ErrorCode::ERR_ARG);
        }
        let old = self.entry(old)?;
        let mut map = MapBuilder::default();
        for (&bl, &disp) in blocklengths.iter().zip(displacements) {
            map.place_repeated(&old, disp, bl);
        }
        Ok(self.register(map))
    }

    fn type_create_hindexed_block(
        &self,
        blocklength: usize,
        displacements: &[isize],
        old: Datatype,
    ) -> LibResult<Datatype> {
        let old = self.entry(old)?;
        let mut map = MapBuilder::default();
        for &disp in displacements {
            map.place_repeated(&old, disp, blocklength);
        }
        Ok(self.register(map))
    }

    fn type_create_subarray(
        &self,
        sizes: &[usize],
        subsizes: &[usize],
        starts: &[usize],
        order: Order,
        old: Datatype,
    ) -> LibResult<Datatype> {
        let ndims = sizes.len();
        if ndims == 0 || subsizes.len() != ndims || starts.len() != ndims {
            return Err(ErrorCode::ERR_ARG);
        }
        for i in 0..ndims {
            if sizes[i] == 0 || subsizes[i] + starts[i] > sizes[i] {
                return Err(ErrorCode::ERR_ARG);
            }
        }
        let old = self.entry(old)?;
        let extent = old.extent();

        // normalize to C order: last dimension fastest
        let (sizes, subsizes, starts): (Vec<usize>, Vec<usize>, Vec<usize>) = match order {
            Order::C => (sizes.to_vec(), subsizes.to_vec(), starts.to_vec()),
            Order::Fortran => (
                sizes.iter().rev().copied().collect(),
                subsizes.iter().rev().copied().collect(),
                starts.iter().rev().copied().collect(),
            ),
        };

        let mut strides = vec![extent; ndims];
        for i in (0..ndims - 1).rev() {
            strides[i] = strides[i + 1] * sizes[i + 1] as isize;
        }

        let mut map = MapBuilder::default();
        let outer = ndims - 1;
        if subsizes.iter().all(|&s| s > 0) {
            let mut index = vec![0usize; outer];
            'walk: loop {
                let mut disp = starts[outer] as isize * strides[outer];
                for d in 0..outer {
                    disp += (starts[d] + index[d]) as isize * strides[d];
                }
                map.place_repeated(&old, disp, subsizes[outer]);

                // odometer over the outer dimensions
                let mut d = outer;
                loop {
                    if d == 0 {
                        break 'walk;
                    }
                    d -= 1;
                    index[d] += 1;
                    if index[d] < subsizes[d] {
                        break;
                    }
                    index[d] = 0;
                }
            }
        }

        // a subarray always spans the full array
        map.lb = Some(0);
        map.ub = Some(strides[0] * sizes[0] as isize);
        Ok(self.register(map))
    }

    fn type_commit(&self, ty: Datatype) -> LibResult<()> {
        let mut entry = self.types.get_mut(&ty.0).ok_or(ErrorCode::ERR_TYPE)?;
        entry.committed = true;
        Ok(())
    }

    fn type_free(&self, ty: Datatype) -> LibResult<()> {
        match self.types.get(&ty.0) {
            None => return Err(ErrorCode::ERR_TYPE),
            Some(entry) if entry.named => return Err(ErrorCode::ERR_TYPE),
            Some(_) => {}
        }
        self.types.remove(&ty.0);
        self.counters.types_freed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn type_size(&self, ty: Datatype) -> LibResult<usize> {
        Ok(self.entry(ty)?.size)
    }

    fn type_extent(&self, ty: Datatype) -> LibResult<(isize, usize)> {
        let entry = self.entry(ty)?;
        Ok((entry.lb, entry.extent().max(0) as usize))
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
        let entry = self.usable(ty)?;
        let total = entry.size * incount;
        if position.checked_add(total).is_none_or(|end| end > outsize) {
            return Err(ErrorCode::ERR_ARG);
        }
        let out = unsafe { std::slice::from_raw_parts_mut(outbuf.add(*position), total) };
        unsafe { gather(inbuf, incount, &entry, out) };
        *position += total;
        self.counters.packs.fetch_add(1, Ordering::Relaxed);
        Ok(())
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
        let entry = self.usable(ty)?;
        let total = entry.size * outcount;
        if position.checked_add(total).is_none_or(|end| end > insize) {
            return Err(ErrorCode::ERR_TRUNCATE);
        }
        let data = unsafe { std::slice::from_raw_parts(inbuf.add(*position), total) };
        unsafe { scatter(data, outbuf, outcount, &entry) };
        *position += total;
        self.counters.unpacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
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
        self.check_comm(comm)?;
        self.check_peer(dest, false)?;
        if tag < 0 {
            return Err(ErrorCode::ERR_TAG);
        }
        let entry = self.usable(ty)?;
        let mut payload = vec![0u8; entry.size * count];
        unsafe { gather(buf, count, &entry, &mut payload) };
        self.post_send(payload, dest, tag, comm);
        Ok(())
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
        let mut request = unsafe { self.irecv(buf, count, ty, source, tag, comm)? };
        self.wait(&mut request)
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
        // eager protocol: the payload is copied out before returning
        unsafe { self.send(buf, count, ty, dest, tag, comm)? };
        Ok(RequestHandle(self.new_request(RequestKind::Send)))
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
        self.check_comm(comm)?;
        self.check_peer(source, true)?;
        if tag < 0 && tag != ANY_TAG {
            return Err(ErrorCode::ERR_TAG);
        }
        let entry = self.usable(ty)?;
        let request = self.new_request(RequestKind::Recv);
        self.post_recv(PostedRecv {
            request,
            buf: buf as usize,
            count,
            entry,
            source,
            tag,
            comm,
        });
        Ok(RequestHandle(request))
    }

    fn wait(&self, request: &mut RequestHandle) -> LibResult<Status> {
        if request.is_null() {
            return Ok(Status::empty());
        }
        let kind = *self.requests.get(&request.0).ok_or(ErrorCode::ERR_REQUEST)?;
        match kind {
            RequestKind::Send => {
                self.finish_request(request);
                Ok(Status::empty())
            }
            RequestKind::Recv => {
                let mailbox = self.mailbox();
                let mut state = mailbox.state.lock();
                let result = loop {
                    if let Some(result) = state.completed.remove(&request.0) {
                        break result;
                    }
                    mailbox.arrived.wait(&mut state);
                };
                drop(state);
                self.finish_request(request);
                result
            }
        }
    }

    fn test(&self, request: &mut RequestHandle) -> LibResult<Option<Status>> {
        if request.is_null() {
            return Ok(Some(Status::empty()));
        }
        let kind = *self.requests.get(&request.0).ok_or(ErrorCode::ERR_REQUEST)?;
        match kind {
            RequestKind::Send => {
                self.finish_request(request);
                Ok(Some(Status::empty()))
            }
            RequestKind::Recv => {
                let result = self.mailbox().state.lock().completed.remove(&request.0);
                match result {
                    Some(result) => {
                        self.finish_request(request);
                        result.map(Some)
                    }
                    None => Ok(None),
                }
            }
        }
    }

    fn cancel(&self, request: &RequestHandle) -> LibResult<()> {
        let kind = *self.requests.get(&request.0).ok_or(ErrorCode::ERR_REQUEST)?;
        if let RequestKind::Recv = kind {
            let mailbox = self.mailbox();
            let mut state = mailbox.state.lock();
            let found = state.posted.iter().position(|p| p.request == request.0);
            if let Some(pos) = found {
                state.posted.remove(pos);
                let mut status = Status::empty();
                status.cancelled = true;
                state.completed.insert(request.0, Ok(status));
                mailbox.arrived.notify_all();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(ranks: usize) -> (Arc<LoopbackWorld>, Vec<LoopbackLibrary>) {
        let world = LoopbackWorld::new(ranks);
        let libs = (0..ranks as i32).map(|r| world.library(r)).collect();
        (world, libs)
    }

    #[test]
    fn test_vector_typemap_and_extent() {
        let (_, libs) = world(1);
        let lib = &libs[0];
        let byte = lib.named_type(NamedType::Byte);

        // one block of 100 bytes inside a 256 byte row has extent 100, not 256
        let row = lib.type_vector(1, 100, 256, byte).unwrap();
        assert_eq!(lib.typemap(row).unwrap(), vec![(0, 100)]);
        assert_eq!(lib.type_extent(row).unwrap(), (0, 100));

        let plane = lib.type_vector(3, 4, 10, byte).unwrap();
        assert_eq!(lib.typemap(plane).unwrap(), vec![(0, 4), (10, 4), (20, 4)]);
        assert_eq!(lib.type_size(plane).unwrap(), 12);
        assert_eq!(lib.type_extent(plane).unwrap(), (0, 24));
    }

    #[test]
    fn test_subarray_typemap_c_and_fortran() {
        let (_, libs) = world(1);
        let lib = &libs[0];
        let byte = lib.named_type(NamedType::Byte);

        let c = lib
            .type_create_subarray(&[4, 8], &[2, 3], &[1, 2], Order::C, byte)
            .unwrap();
        assert_eq!(lib.typemap(c).unwrap(), vec![(10, 3), (18, 3)]);
        assert_eq!(lib.type_extent(c).unwrap(), (0, 32));

        let f = lib
            .type_create_subarray(&[8, 4], &[3, 2], &[2, 1], Order::Fortran, byte)
            .unwrap();
        assert_eq!(lib.typemap(f).unwrap(), lib.typemap(c).unwrap());

        assert_eq!(
            lib.type_create_subarray(&[4], &[3], &[2], Order::C, byte),
            Err(ErrorCode::ERR_ARG)
        );
    }

    #[test]
    fn test_free_rules() {
        let (_, libs) = world(1);
        let lib = &libs[0];
        let byte = lib.named_type(NamedType::Byte);
        let ty = lib.type_contiguous(4, byte).unwrap();
        assert_eq!(lib.live_types(), 1);

        assert_eq!(lib.type_free(ty), Ok(()));
        assert_eq!(lib.type_free(ty), Err(ErrorCode::ERR_TYPE));
        assert_eq!(lib.type_free(byte), Err(ErrorCode::ERR_TYPE));
        assert_eq!(lib.live_types(), 0);
        assert_eq!(lib.stats().types_freed, 1);
    }

    #[test]
    fn test_uncommitted_type_is_rejected() {
        let (_, libs) = world(2);
        let byte = libs[0].named_type(NamedType::Byte);
        let ty = libs[0].type_contiguous(4, byte).unwrap();
        let data = [0u8; 4];
        let result = unsafe { libs[0].send(data.as_ptr(), 1, ty, 1, 0, Communicator::WORLD) };
        assert_eq!(result, Err(ErrorCode::ERR_TYPE));
    }

    #[test]
    fn test_pack_unpack_vector() {
        let (_, libs) = world(1);
        let lib = &libs[0];
        let byte = lib.named_type(NamedType::Byte);
        let ty = lib.type_vector(3, 2, 5, byte).unwrap();
        lib.type_commit(ty).unwrap();

        let src: Vec<u8> = (0..15).collect();
        let mut packed = [0u8; 6];
        let mut pos = 0;
        unsafe {
            lib.pack(src.as_ptr(), 1, ty, packed.as_mut_ptr(), 6, &mut pos)
                .unwrap();
        }
        assert_eq!(pos, 6);
        assert_eq!(packed, [0, 1, 5, 6, 10, 11]);

        let mut dst = [0u8; 15];
        let mut pos = 0;
        unsafe {
            lib.unpack(packed.as_ptr(), 6, &mut pos, dst.as_mut_ptr(), 1, ty)
                .unwrap();
        }
        assert_eq!(&dst[..2], &[0, 1]);
        assert_eq!(&dst[5..7], &[5, 6]);
        assert_eq!(dst[2], 0);

        let mut small = [0u8; 4];
        let mut pos = 0;
        let result = unsafe { lib.pack(src.as_ptr(), 1, ty, small.as_mut_ptr(), 4, &mut pos) };
        assert_eq!(result, Err(ErrorCode::ERR_ARG));
    }

    #[test]
    fn test_send_before_recv_and_recv_before_send() {
        let (_, libs) = world(2);
        let byte = libs[0].named_type(NamedType::Byte);

        // unexpected message path
        let data = [1u8, 2, 3, 4];
        unsafe {
            libs[0]
                .send(data.as_ptr(), 4, byte, 1, 7, Communicator::WORLD)
                .unwrap();
        }
        let mut out = [0u8; 4];
        let status = unsafe {
            libs[1]
                .recv(out.as_mut_ptr(), 4, byte, 0, 7, Communicator::WORLD)
                .unwrap()
        };
        assert_eq!(out, data);
        assert_eq!(status.count_bytes, 4);
        assert_eq!(status.source, 0);

        // posted receive path
        let mut out = [0u8; 4];
        let mut request = unsafe {
            libs[1]
                .irecv(out.as_mut_ptr(), 4, byte, ANY_SOURCE, ANY_TAG, Communicator::WORLD)
                .unwrap()
        };
        assert_eq!(libs[1].test(&mut request).unwrap(), None);
        unsafe {
            libs[0]
                .send(data.as_ptr(), 4, byte, 1, 9, Communicator::WORLD)
                .unwrap();
        }
        let status = libs[1].wait(&mut request).unwrap();
        assert!(request.is_null());
        assert_eq!(status.tag, 9);
        assert_eq!(out, data);
    }

    #[test]
    fn test_truncation_and_cancel() {
        let (_, libs) = world(2);
        let byte = libs[0].named_type(NamedType::Byte);
        let data = [9u8; 8];
        unsafe {
            libs[0]
                .send(data.as_ptr(), 8, byte, 1, 0, Communicator::WORLD)
                .unwrap();
        }
        let mut out = [0u8; 4];
        let result = unsafe { libs[1].recv(out.as_mut_ptr(), 4, byte, 0, 0, Communicator::WORLD) };
        assert_eq!(result, Err(ErrorCode::ERR_TRUNCATE));

        let mut request = unsafe {
            libs[1]
                .irecv(out.as_mut_ptr(), 4, byte, 0, 3, Communicator::WORLD)
                .unwrap()
        };
        libs[1].cancel(&request).unwrap();
        let status = libs[1].wait(&mut request).unwrap();
        assert!(status.cancelled);
    }

    #[test]
    fn test_argument_validation() {
        let (_, libs) = world(2);
        let byte = libs[0].named_type(NamedType::Byte);
        let data = [0u8; 1];
        unsafe {
            assert_eq!(
                libs[0].send(data.as_ptr(), 1, byte, 2, 0, Communicator::WORLD),
                Err(ErrorCode::ERR_RANK)
            );
            assert_eq!(
                libs[0].send(data.as_ptr(), 1, byte, 1, -5, Communicator::WORLD),
                Err(ErrorCode::ERR_TAG)
            );
            assert_eq!(
                libs[0].send(data.as_ptr(), 1, byte, 1, 0, Communicator(99)),
                Err(ErrorCode::ERR_COMM)
            );
        }
        let mut bogus = RequestHandle(12345);
        assert_eq!(libs[0].wait(&mut bogus), Err(ErrorCode::ERR_REQUEST));
    }
}
