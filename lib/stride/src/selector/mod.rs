// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Strategy selection.
//!
//! The [`Selector`] answers "which strategy is fastest for this shape, size and placement"
//! from a measured [`PerformanceTable`]. A lookup tries the exact size bucket first, then
//! smaller buckets for the same class and placement, then a fixed default. The answer is
//! deterministic for a given table.

pub mod measure;
mod table;

pub use table::{PerformanceKey, PerformanceRecord, PerformanceTable};

use crate::engine::{LibraryCapabilities, Placement};
use crate::layout::{ShapeClass, StrategyId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Host or device, without the device ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    Host,
    Device,
}

impl From<Placement> for PlacementKind {
    fn from(placement: Placement) -> Self {
        match placement {
            Placement::Host => PlacementKind::Host,
            Placement::Device(_) => PlacementKind::Device,
        }
    }
}

/// Placement of the source and destination of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlacementPair {
    pub source: PlacementKind,
    pub destination: PlacementKind,
}

impl PlacementPair {
    pub const fn new(source: PlacementKind, destination: PlacementKind) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub const HOST: PlacementPair = PlacementPair::new(PlacementKind::Host, PlacementKind::Host);

    pub fn is_host(&self) -> bool {
        self.source == PlacementKind::Host && self.destination == PlacementKind::Host
    }
}

impl From<(Placement, Placement)> for PlacementPair {
    fn from((source, destination): (Placement, Placement)) -> Self {
        Self::new(source.into(), destination.into())
    }
}

/// `floor(log2(bytes))`; zero bytes fall in bucket zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SizeBucket(pub u32);

impl SizeBucket {
    pub fn of(bytes: usize) -> Self {
        match bytes {
            0 => SizeBucket(0),
            n => SizeBucket(usize::BITS - 1 - n.leading_zeros()),
        }
    }
}

impl fmt::Display for SizeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "2^{}", self.0)
    }
}

pub struct Selector {
    table: RwLock<Arc<PerformanceTable>>,
    capabilities: LibraryCapabilities,
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("entries", &self.table.read().len())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl Selector {
    /// A selector with an empty table; every lookup returns the default.
    pub fn new(capabilities: LibraryCapabilities) -> Self {
        Self::with_table(PerformanceTable::default(), capabilities)
    }

    pub fn with_table(table: PerformanceTable, capabilities: LibraryCapabilities) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            capabilities,
        }
    }

    /// Replace the table. Lookups already holding a snapshot keep using the old one.
    pub fn publish(&self, table: PerformanceTable) {
        *self.table.write() = Arc::new(table);
    }

    pub fn snapshot(&self) -> Arc<PerformanceTable> {
        self.table.read().clone()
    }

    /// Whether `strategy` can be used for `class` with buffers in `placement`.
    pub fn is_candidate(&self, strategy: StrategyId, class: ShapeClass, placement: PlacementPair) -> bool {
        strategy.applicable_to(class)
            && (!strategy.is_native() || placement.is_host() || self.capabilities.device_aware)
    }

    /// Strategy to use when the table has nothing for the key.
    pub fn default_strategy(&self, class: ShapeClass, placement: PlacementPair) -> StrategyId {
        if !placement.is_host() && !self.capabilities.device_aware {
            StrategyId::DirectCopy
        } else if class == ShapeClass::Contiguous {
            StrategyId::Contiguous
        } else {
            StrategyId::Subarray
        }
    }

    pub fn select(&self, class: ShapeClass, bucket: SizeBucket, placement: PlacementPair) -> StrategyId {
        let table = self.snapshot();
        for b in (0..=bucket.0).rev() {
            let key = PerformanceKey {
                class,
                bucket: SizeBucket(b),
                placement,
            };
            if let Some(best) = table.best(&key, |s| self.is_candidate(s, class, placement)) {
                return best;
            }
        }
        self.default_strategy(class, placement)
    }
}
