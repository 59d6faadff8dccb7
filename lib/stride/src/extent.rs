// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Three-dimensional extents.
//!
//! An [`Extent3`] describes either the region being copied or the allocation that
//! contains it. `x` is the fastest-varying axis and is always measured in bytes when
//! used with the layout builder; `y` and `z` count rows and planes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;

/// Axis selector for indexing an [`Extent3`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent3 {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Extent3 {
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// Total count covered by the extent.
    pub fn product(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Total count, or `None` on overflow.
    pub fn checked_product(&self) -> Option<usize> {
        self.x.checked_mul(self.y)?.checked_mul(self.z)
    }

    /// Size of one x,y plane.
    pub fn plane(&self) -> usize {
        self.x * self.y
    }

    /// True when every axis of `self` is no larger than the same axis of `outer`.
    pub fn fits_within(&self, outer: &Extent3) -> bool {
        self.x <= outer.x && self.y <= outer.y && self.z <= outer.z
    }

    /// Byte offset of row `(y, z)` when `self` is the allocation extent.
    pub fn row_offset(&self, y: usize, z: usize) -> usize {
        z * self.y * self.x + y * self.x
    }

    /// Byte offset of the corner `start` when `self` is the allocation extent.
    pub fn offset_of(&self, start: &Extent3) -> usize {
        self.row_offset(start.y, start.z) + start.x
    }

    /// Elementwise sum, `None` on overflow.
    pub fn checked_add(&self, other: &Extent3) -> Option<Extent3> {
        Some(Extent3 {
            x: self.x.checked_add(other.x)?,
            y: self.y.checked_add(other.y)?,
            z: self.z.checked_add(other.z)?,
        })
    }

    /// Extents listed slowest axis first, the order used for C-order subarrays.
    pub fn to_c_order(&self) -> [usize; 3] {
        [self.z, self.y, self.x]
    }
}

impl Index<Axis> for Extent3 {
    type Output = usize;

    fn index(&self, axis: Axis) -> &usize {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }
}

impl Index<usize> for Extent3 {
    type Output = usize;

    fn index(&self, axis: usize) -> &usize {
        match axis {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("Extent3 index out of range: {axis}"),
        }
    }
}

impl From<(usize, usize, usize)> for Extent3 {
    fn from((x, y, z): (usize, usize, usize)) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Extent3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}
