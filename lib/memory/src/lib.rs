// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Storage and staging memory for strided transfers.
//!
//! This crate provides:
//! - A single trait for type erasure (`MemoryDescription`)
//! - Concrete storage types for system and pinned host memory
//! - An arena allocator carving sub-buffers out of one reservation
//! - The staging pool handing out scratch buffers and execution contexts
//! - RAII everywhere: buffers go back to their pool when dropped

pub mod actions;
pub mod arena;
pub mod pool;

#[cfg(feature = "cuda")]
pub mod context;
#[cfg(feature = "cuda")]
mod pinned;
mod system;


pub use arena::{ArenaAllocator, ArenaBuffer, ArenaError};
#[cfg(feature = "cuda")]
pub use pinned::PinnedStorage;
pub use pool::{StagingBuffer, StagingPool, StagingPoolConfig};
#[cfg(feature = "cuda")]
pub use pool::StreamLease;
pub use system::SystemStorage;

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),
}

/// Storage type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    /// System memory (malloc)
    System,

    /// CUDA pinned host memory
    Pinned,

    /// CUDA device memory with device ID
    Device(u32),
}

impl StorageKind {
    /// True for memory the CPU can dereference.
    pub fn is_host(&self) -> bool {
        matches!(self, StorageKind::System | StorageKind::Pinned)
    }
}

/// Core trait for memory regions that can be type-erased.
///
/// Concrete storage types implement this trait to enable type erasure via
/// `Arc<dyn MemoryDescription>`.
pub trait MemoryDescription: Send + Sync + fmt::Debug {
    /// Base address of the memory region.
    fn addr(&self) -> usize;

    /// Size of the memory region in bytes.
    fn size(&self) -> usize;

    /// Type of storage backing this region.
    fn storage_kind(&self) -> StorageKind;

    /// Enable downcasting to concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Type-erased memory region.
#[derive(Clone)]
pub struct Buffer(Arc<dyn MemoryDescription>);

impl MemoryDescription for Buffer {
    fn addr(&self) -> usize {
        self.0.addr()
    }
    fn size(&self) -> usize {
        self.0.size()
    }
    fn storage_kind(&self) -> StorageKind {
        self.0.storage_kind()
    }
    fn as_any(&self) -> &dyn Any {
        self.0.as_any()
    }
}

impl std::ops::Deref for Buffer {
    type Target = dyn MemoryDescription;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("addr", &self.addr())
            .field("size", &self.size())
            .field("kind", &self.storage_kind())
            .finish()
    }
}

/// Helper function to convert concrete storage to type-erased form.
pub fn create_buffer<S: MemoryDescription + 'static>(memory: S) -> Buffer {
    Buffer(Arc::new(memory))
}
