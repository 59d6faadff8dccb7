// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The message-passing library surface.
//!
//! [`MessageLibrary`] mirrors the point-to-point, derived-datatype and pack entry points of
//! an MPI implementation, with the same argument order and the same numeric error codes.
//! The interceptor both consumes this trait (the wrapped library) and implements it (the
//! surface handed to the application), so either side can be swapped without the other
//! noticing.
//!
//! Buffer arguments are raw pointers because they name application memory that may live on
//! an accelerator; every buffer-taking method is `unsafe` for that reason.

pub mod loopback;

pub use loopback::{LoopbackLibrary, LoopbackStats, LoopbackWorld};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type returned by [`MessageLibrary`] methods.
pub type LibResult<T> = std::result::Result<T, ErrorCode>;

/// Error class as returned by the wrapped library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);
    pub const ERR_BUFFER: ErrorCode = ErrorCode(1);
    pub const ERR_COUNT: ErrorCode = ErrorCode(2);
    pub const ERR_TYPE: ErrorCode = ErrorCode(3);
    pub const ERR_TAG: ErrorCode = ErrorCode(4);
    pub const ERR_COMM: ErrorCode = ErrorCode(5);
    pub const ERR_RANK: ErrorCode = ErrorCode(6);
    pub const ERR_ARG: ErrorCode = ErrorCode(12);
    pub const ERR_TRUNCATE: ErrorCode = ErrorCode(14);
    pub const ERR_OTHER: ErrorCode = ErrorCode(15);
    pub const ERR_INTERN: ErrorCode = ErrorCode(16);
    pub const ERR_REQUEST: ErrorCode = ErrorCode(19);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    fn class_name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::SUCCESS => "MPI_SUCCESS",
            Self::ERR_BUFFER => "MPI_ERR_BUFFER",
            Self::ERR_COUNT => "MPI_ERR_COUNT",
            Self::ERR_TYPE => "MPI_ERR_TYPE",
            Self::ERR_TAG => "MPI_ERR_TAG",
            Self::ERR_COMM => "MPI_ERR_COMM",
            Self::ERR_RANK => "MPI_ERR_RANK",
            Self::ERR_ARG => "MPI_ERR_ARG",
            Self::ERR_TRUNCATE => "MPI_ERR_TRUNCATE",
            Self::ERR_OTHER => "MPI_ERR_OTHER",
            Self::ERR_INTERN => "MPI_ERR_INTERN",
            Self::ERR_REQUEST => "MPI_ERR_REQUEST",
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class_name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "error class {}", self.0),
        }
    }
}

impl std::error::Error for ErrorCode {}

/// Wildcard source rank for receives.
pub const ANY_SOURCE: i32 = -2;

/// Wildcard tag for receives.
pub const ANY_TAG: i32 = -1;

/// Opaque datatype handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Datatype(pub u64);

impl Datatype {
    pub const NULL: Datatype = Datatype(0);
}

/// Opaque communicator handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Communicator(pub u64);

impl Communicator {
    pub const WORLD: Communicator = Communicator(1);
}

/// Opaque non-blocking request handle. Completed requests are reset to [`RequestHandle::NULL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

impl RequestHandle {
    pub const NULL: RequestHandle = RequestHandle(0);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

/// Completion status of a receive or a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub source: i32,
    pub tag: i32,
    pub error: ErrorCode,
    /// Bytes delivered into the receive buffer.
    pub count_bytes: usize,
    pub cancelled: bool,
}

impl Status {
    /// Status reported for requests that carried no message (sends, null requests).
    pub fn empty() -> Self {
        Self {
            source: ANY_SOURCE,
            tag: ANY_TAG,
            error: ErrorCode::SUCCESS,
            count_bytes: 0,
            cancelled: false,
        }
    }
}

/// Thread support level provided by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreadLevel {
    Single,
    Funneled,
    Serialized,
    Multiple,
}

impl fmt::Display for ThreadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadLevel::Single => "MPI_THREAD_SINGLE",
            ThreadLevel::Funneled => "MPI_THREAD_FUNNELED",
            ThreadLevel::Serialized => "MPI_THREAD_SERIALIZED",
            ThreadLevel::Multiple => "MPI_THREAD_MULTIPLE",
        };
        f.write_str(name)
    }
}

/// Array storage order for subarray datatypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Order {
    /// Row-major, last dimension fastest.
    C,
    /// Column-major, first dimension fastest.
    Fortran,
}

/// Predefined element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NamedType {
    Byte,
    Char,
    Int,
    Float,
    Long,
    Double,
}

impl NamedType {
    pub const ALL: [NamedType; 6] = [
        NamedType::Byte,
        NamedType::Char,
        NamedType::Int,
        NamedType::Float,
        NamedType::Long,
        NamedType::Double,
    ];

    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            NamedType::Byte | NamedType::Char => 1,
            NamedType::Int | NamedType::Float => 4,
            NamedType::Long | NamedType::Double => 8,
        }
    }

    /// The floating-point element type of the given width, if there is one.
    pub fn float_of_size(size: usize) -> Option<NamedType> {
        match size {
            4 => Some(NamedType::Float),
            8 => Some(NamedType::Double),
            _ => None,
        }
    }
}

/// Entry points of a message-passing library.
///
/// All methods are callable from any thread; whether concurrent calls are permitted is
/// governed by [`MessageLibrary::thread_level`], exactly as for the real library.
pub trait MessageLibrary: Send + Sync {
    /// Thread support level granted at initialization.
    fn thread_level(&self) -> ThreadLevel;

    fn comm_rank(&self, comm: Communicator) -> LibResult<i32>;

    fn comm_size(&self, comm: Communicator) -> LibResult<i32>;

    /// Handle of a predefined type.
    fn named_type(&self, ty: NamedType) -> Datatype;

    fn type_contiguous(&self, count: usize, old: Datatype) -> LibResult<Datatype>;

    /// `count` blocks of `blocklength` elements, `stride` elements apart.
    fn type_vector(
        &self,
        count: usize,
        blocklength: usize,
        stride: isize,
        old: Datatype,
    ) -> LibResult<Datatype>;

    /// `count` blocks of `blocklength` elements, `stride` bytes apart.
    fn type_create_hvector(
        &self,
        count: usize,
        blocklength: usize,
        stride: isize,
        old: Datatype,
    ) -> LibResult<Datatype>;

    fn type_create_hindexed(
        &self,
        blocklengths: &[usize],
        displacements: &[isize],
        old: Datatype,
    ) -> LibResult<Datatype>;

    fn type_create_hindexed_block(
        &self,
        blocklength: usize,
        displacements: &[isize],
        old: Datatype,
    ) -> LibResult<Datatype>;

    fn type_create_subarray(
        &self,
        sizes: &[usize],
        subsizes: &[usize],
        starts: &[usize],
        order: Order,
        old: Datatype,
    ) -> LibResult<Datatype>;

    fn type_commit(&self, ty: Datatype) -> LibResult<()>;

    fn type_free(&self, ty: Datatype) -> LibResult<()>;

    /// Bytes of data described by one instance of `ty`.
    fn type_size(&self, ty: Datatype) -> LibResult<usize>;

    /// Lower bound and extent of `ty`, in bytes.
    fn type_extent(&self, ty: Datatype) -> LibResult<(isize, usize)>;

    /// Pack `incount` instances of `ty` read from `inbuf` into `outbuf[*position..outsize]`.
    ///
    /// # Safety
    /// `inbuf` must be valid for reads over the typemap of `incount` instances of `ty` and
    /// `outbuf` must be valid for writes of `outsize` bytes.
    unsafe fn pack(
        &self,
        inbuf: *const u8,
        incount: usize,
        ty: Datatype,
        outbuf: *mut u8,
        outsize: usize,
        position: &mut usize,
    ) -> LibResult<()>;

    /// Unpack from `inbuf[*position..insize]` into `outcount` instances of `ty` at `outbuf`.
    ///
    /// # Safety
    /// `inbuf` must be valid for reads of `insize` bytes and `outbuf` must be valid for
    /// writes over the typemap of `outcount` instances of `ty`.
    unsafe fn unpack(
        &self,
        inbuf: *const u8,
        insize: usize,
        position: &mut usize,
        outbuf: *mut u8,
        outcount: usize,
        ty: Datatype,
    ) -> LibResult<()>;

    /// Blocking send.
    ///
    /// # Safety
    /// `buf` must be valid for reads over the typemap of `count` instances of `ty`.
    unsafe fn send(
        &self,
        buf: *const u8,
        count: usize,
        ty: Datatype,
        dest: i32,
        tag: i32,
        comm: Communicator,
    ) -> LibResult<()>;

    /// Blocking receive.
    ///
    /// # Safety
    /// `buf` must be valid for writes over the typemap of `count` instances of `ty`.
    unsafe fn recv(
        &self,
        buf: *mut u8,
        count: usize,
        ty: Datatype,
        source: i32,
        tag: i32,
        comm: Communicator,
    ) -> LibResult<Status>;

    /// Non-blocking send.
    ///
    /// # Safety
    /// `buf` must stay valid and unmodified until the request completes.
    unsafe fn isend(
        &self,
        buf: *const u8,
        count: usize,
        ty: Datatype,
        dest: i32,
        tag: i32,
        comm: Communicator,
    ) -> LibResult<RequestHandle>;

    /// Non-blocking receive.
    ///
    /// # Safety
    /// `buf` must stay valid, and must not be read, until the request completes.
    unsafe fn irecv(
        &self,
        buf: *mut u8,
        count: usize,
        ty: Datatype,
        source: i32,
        tag: i32,
        comm: Communicator,
    ) -> LibResult<RequestHandle>;

    /// Block until `request` completes; resets it to [`RequestHandle::NULL`].
    fn wait(&self, request: &mut RequestHandle) -> LibResult<Status>;

    /// Complete `request` if possible; resets it to [`RequestHandle::NULL`] on completion.
    fn test(&self, request: &mut RequestHandle) -> LibResult<Option<Status>>;

    /// Mark `request` for cancellation. Completion must still be observed with wait or test.
    fn cancel(&self, request: &RequestHandle) -> LibResult<()>;
}
