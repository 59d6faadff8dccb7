// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::ShapeClass;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A named way to realize a layout: one of the native datatype encodings, or the
/// direct-copy kernel that gathers rows itself.
///
/// Strategies are ordered by name; the selector uses that order to break throughput ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    /// Flat contiguous type of `n` bytes.
    Contiguous,
    ContiguousSingleBlock,
    ContiguousSubarray,
    ContiguousUnitBlocks,
    /// Row-copy kernel into a staging buffer; no native datatype.
    DirectCopy,
    Hindexed,
    HindexedBlock,
    Subarray,
    SubarrayVector,
    #[serde(rename = "v1_hv_hv")]
    V1HvHv,
    #[serde(rename = "v_hv_byte")]
    VHvByte,
    #[serde(rename = "v_hv_typed")]
    VHvTyped,
    Vector,
    #[serde(rename = "vn_hv_hv")]
    VnHvHv,
}

impl StrategyId {
    pub const ALL: [StrategyId; 14] = [
        StrategyId::Contiguous,
        StrategyId::ContiguousSingleBlock,
        StrategyId::ContiguousSubarray,
        StrategyId::ContiguousUnitBlocks,
        StrategyId::DirectCopy,
        StrategyId::Hindexed,
        StrategyId::HindexedBlock,
        StrategyId::Subarray,
        StrategyId::SubarrayVector,
        StrategyId::V1HvHv,
        StrategyId::VHvByte,
        StrategyId::VHvTyped,
        StrategyId::Vector,
        StrategyId::VnHvHv,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StrategyId::Contiguous => "contiguous",
            StrategyId::ContiguousSingleBlock => "contiguous_single_block",
            StrategyId::ContiguousSubarray => "contiguous_subarray",
            StrategyId::ContiguousUnitBlocks => "contiguous_unit_blocks",
            StrategyId::DirectCopy => "direct_copy",
            StrategyId::Hindexed => "hindexed",
            StrategyId::HindexedBlock => "hindexed_block",
            StrategyId::Subarray => "subarray",
            StrategyId::SubarrayVector => "subarray_vector",
            StrategyId::V1HvHv => "v1_hv_hv",
            StrategyId::VHvByte => "v_hv_byte",
            StrategyId::VHvTyped => "v_hv_typed",
            StrategyId::Vector => "vector",
            StrategyId::VnHvHv => "vn_hv_hv",
        }
    }

    /// True for strategies realized by a native datatype handed to the library.
    pub fn is_native(&self) -> bool {
        !matches!(self, StrategyId::DirectCopy)
    }

    /// True for the four encodings of a single contiguous run.
    pub fn is_contiguous_encoding(&self) -> bool {
        matches!(
            self,
            StrategyId::Contiguous
                | StrategyId::ContiguousSingleBlock
                | StrategyId::ContiguousSubarray
                | StrategyId::ContiguousUnitBlocks
        )
    }

    /// Whether this strategy can realize every region of the given class.
    ///
    /// Element-size restrictions of [`StrategyId::VHvTyped`] are checked at build time.
    pub fn applicable_to(&self, class: ShapeClass) -> bool {
        match class {
            ShapeClass::Contiguous => {
                self.is_contiguous_encoding() || *self == StrategyId::DirectCopy
            }
            ShapeClass::Vector1D => !self.is_contiguous_encoding(),
            ShapeClass::PlaneThenDepth => {
                !self.is_contiguous_encoding() && *self != StrategyId::Vector
            }
        }
    }

    /// Strategies applicable to `class`, in name order.
    pub fn candidates(class: ShapeClass) -> impl Iterator<Item = StrategyId> {
        Self::ALL.into_iter().filter(move |s| s.applicable_to(class))
    }
}

impl Ord for StrategyId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name().cmp(other.name())
    }
}

impl PartialOrd for StrategyId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| format!("unknown strategy: {s}"))
    }
}
