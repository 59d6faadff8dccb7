// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Dynamo Stride
//!
//! Accelerated transfers of strided sub-volumes for message-passing applications.
//!
//! The crate sits between an application and its message-passing library. It recognizes
//! derived datatypes that describe a box inside a larger 3-D allocation, rewrites them into
//! whichever encoding measured fastest, and packs device-resident data through pooled
//! staging memory when the library cannot touch it directly.
//!
//! ## Layers
//!
//! - [`layout`]: pure description of a region as rows, one descriptor per strategy
//! - [`datatype`]: descriptors to library datatypes and recorded datatypes back to regions
//! - [`plan`]: a descriptor bound to the native handles that realize it
//! - [`engine`]: executes plans against host or device memory
//! - [`selector`]: picks a strategy from measured throughput
//! - [`intercept`]: the [`MessageLibrary`] wrapper applications call
//! - [`library`]: the library surface, plus an in-process reference implementation

pub mod config;
pub mod datatype;
pub mod engine;
pub mod error;
pub mod extent;
pub mod intercept;
pub mod layout;
pub mod library;
pub mod logging;
pub mod plan;
pub mod selector;
pub mod topology;

pub use config::{StrideConfig, Verbosity};
pub use datatype::{StridedBlock, TypeRecord};
pub use engine::{
    CompletionSignal, LibraryCapabilities, MemoryHandle, PackEngine, PackedBuffer, Placement,
    Route,
};
pub use error::{Result, StrideError};
pub use extent::Extent3;
pub use intercept::{InterceptStats, Interceptor};
pub use layout::{LayoutDescriptor, Row, ShapeClass, StrategyId};
pub use library::{
    Communicator, Datatype, ErrorCode, LibResult, LoopbackLibrary, LoopbackWorld,
    MessageLibrary, NamedType, RequestHandle, Status,
};
pub use plan::PackPlan;
pub use selector::{PerformanceTable, PlacementPair, Selector, SizeBucket};
pub use topology::{HostTopology, RegisteredTopology, Topology};
