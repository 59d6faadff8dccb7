// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Recovery of strided blocks from recorded datatype constructors.
//!
//! Applications describe a sub-volume with whatever nesting of vector, hvector, subarray or
//! indexed constructors suits them. Each constructor call is recorded as a [`TypeRecord`];
//! at commit time [`decode`] walks the record tree and, when the typemap is a regular grid of
//! equal rows, returns the `(copy, alloc, start)` triple that reproduces it exactly. Anything
//! else decodes to `None` and the datatype is handled by the wrapped library as-is.

use crate::extent::Extent3;
use crate::library::{NamedType, Order};
use std::sync::Arc;

/// One recorded datatype constructor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRecord {
    Named(NamedType),
    Contiguous {
        count: usize,
        old: Arc<TypeRecord>,
    },
    Vector {
        count: usize,
        blocklength: usize,
        stride: isize,
        old: Arc<TypeRecord>,
    },
    Hvector {
        count: usize,
        blocklength: usize,
        stride: isize,
        old: Arc<TypeRecord>,
    },
    Hindexed {
        blocklengths: Vec<usize>,
        displacements: Vec<isize>,
        old: Arc<TypeRecord>,
    },
    HindexedBlock {
        blocklength: usize,
        displacements: Vec<isize>,
        old: Arc<TypeRecord>,
    },
    Subarray {
        sizes: Vec<usize>,
        subsizes: Vec<usize>,
        starts: Vec<usize>,
        order: Order,
        old: Arc<TypeRecord>,
    },
}

/// A strided region recovered from a datatype: `copy` at corner `start` inside `alloc`.
///
/// All x values are in bytes. `element_size` is the size of the innermost named type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StridedBlock {
    pub copy: Extent3,
    pub alloc: Extent3,
    pub start: Extent3,
    pub element_size: usize,
}

impl StridedBlock {
    /// Bytes of payload in the block.
    pub fn packed_len(&self) -> usize {
        self.copy.product()
    }

    /// Byte offset of the block corner from the datatype origin.
    pub fn base_offset(&self) -> usize {
        self.alloc.offset_of(&self.start)
    }
}

/// Intermediate result: a block plus the datatype extent and the number of meaningful axes.
#[derive(Debug, Clone, Copy)]
struct Shape {
    block: StridedBlock,
    dims: usize,
    extent: usize,
}

impl Shape {
    fn dense(len: usize, element_size: usize) -> Self {
        Self {
            block: StridedBlock {
                copy: Extent3::new(len, 1, 1),
                alloc: Extent3::new(len, 1, 1),
                start: Extent3::default(),
                element_size,
            },
            dims: 1,
            extent: len,
        }
    }

    /// A single gap-free run starting at the origin.
    fn run_len(&self) -> Option<usize> {
        let b = &self.block;
        (self.dims == 1 && b.start == Extent3::default() && b.copy.x == self.extent)
            .then_some(self.extent)
    }

    /// Rows of `row` bytes, `count` of them, `pitch` bytes apart.
    fn rows(row: usize, count: usize, pitch: usize, element_size: usize) -> Option<Self> {
        if count <= 1 || pitch == row {
            return Some(Self::dense(row * count, element_size));
        }
        if pitch < row {
            return None;
        }
        Some(Self {
            block: StridedBlock {
                copy: Extent3::new(row, count, 1),
                alloc: Extent3::new(pitch, count, 1),
                start: Extent3::default(),
                element_size,
            },
            dims: 2,
            extent: (count - 1) * pitch + row,
        })
    }

    /// `count` copies of a full plane at `pitch` bytes apart.
    fn planes(plane: &Shape, count: usize, pitch: usize) -> Option<Self> {
        if count == 1 {
            return Some(*plane);
        }
        let b = &plane.block;
        if plane.dims != 2 || b.start != Extent3::default() || b.alloc.x == 0 {
            return None;
        }
        if pitch % b.alloc.x != 0 {
            return None;
        }
        let alloc_y = pitch / b.alloc.x;
        if alloc_y < b.copy.y {
            return None;
        }
        Some(Self {
            block: StridedBlock {
                copy: Extent3::new(b.copy.x, b.copy.y, count),
                alloc: Extent3::new(b.alloc.x, alloc_y, count),
                start: Extent3::default(),
                element_size: b.element_size,
            },
            dims: 3,
            extent: (count - 1) * pitch + plane.extent,
        })
    }
}

fn non_negative(value: isize) -> Option<usize> {
    usize::try_from(value).ok()
}

/// Infer a `(rows per plane, row pitch, plane pitch)` grid from row displacements.
fn infer_grid(row: usize, displacements: &[usize], element_size: usize) -> Option<Shape> {
    let n = displacements.len();
    if n == 0 || displacements[0] != 0 {
        return None;
    }
    if n == 1 {
        return Some(Shape::dense(row, element_size));
    }
    let pitch = displacements[1];
    let rows_per_plane = displacements
        .windows(2)
        .take_while(|w| w[1] == w[0] + pitch)
        .count()
        + 1;
    let plane = Shape::rows(row, rows_per_plane, pitch, element_size)?;
    if rows_per_plane == n {
        return Some(plane);
    }
    if n % rows_per_plane != 0 {
        return None;
    }
    let plane_pitch = displacements[rows_per_plane];
    for (i, &d) in displacements.iter().enumerate() {
        if d != (i / rows_per_plane) * plane_pitch + (i % rows_per_plane) * pitch {
            return None;
        }
    }
    Shape::planes(&plane, n / rows_per_plane, plane_pitch)
}

fn decode_shape(record: &TypeRecord) -> Option<Shape> {
    match record {
        TypeRecord::Named(ty) => Some(Shape::dense(ty.size(), ty.size())),
        TypeRecord::Contiguous { count, old } => {
            let old = decode_shape(old)?;
            let len = old.run_len()?;
            Some(Shape::dense(len * count, old.block.element_size))
        }
        TypeRecord::Vector {
            count,
            blocklength,
            stride,
            old,
        } => {
            let old = decode_shape(old)?;
            let stride = non_negative(*stride)?;
            match old.run_len() {
                Some(len) => Shape::rows(blocklength * len, *count, stride * len, old.block.element_size),
                // vector(count, 1, 1, plane) repeats the plane at its own extent
                None if *blocklength == 1 && stride == 1 => {
                    let b = &old.block;
                    if old.dims == 2 && old.extent == b.alloc.plane() {
                        Shape::planes(&old, *count, old.extent)
                    } else {
                        None
                    }
                }
                None => None,
            }
        }
        TypeRecord::Hvector {
            count,
            blocklength,
            stride,
            old,
        } => {
            let old = decode_shape(old)?;
            let stride = non_negative(*stride)?;
            match old.run_len() {
                Some(len) => Shape::rows(blocklength * len, *count, stride, old.block.element_size),
                None if *blocklength == 1 => Shape::planes(&old, *count, stride),
                None => None,
            }
        }
        TypeRecord::HindexedBlock {
            blocklength,
            displacements,
            old,
        } => {
            let old = decode_shape(old)?;
            let len = old.run_len()?;
            let displacements: Option<Vec<usize>> =
                displacements.iter().map(|d| non_negative(*d)).collect();
            infer_grid(blocklength * len, &displacements?, old.block.element_size)
        }
        TypeRecord::Hindexed {
            blocklengths,
            displacements,
            old,
        } => {
            let first = *blocklengths.first()?;
            if blocklengths.iter().any(|bl| *bl != first) || blocklengths.len() != displacements.len() {
                return None;
            }
            decode_shape(&TypeRecord::HindexedBlock {
                blocklength: first,
                displacements: displacements.clone(),
                old: old.clone(),
            })
        }
        TypeRecord::Subarray {
            sizes,
            subsizes,
            starts,
            order,
            old,
        } => {
            let old = decode_shape(old)?;
            let elem = old.run_len()?;
            let ndims = sizes.len();
            if ndims == 0 || ndims > 3 || subsizes.len() != ndims || starts.len() != ndims {
                return None;
            }
            // fastest axis first
            let axis = |values: &[usize], i: usize| -> usize {
                if i >= ndims {
                    return 1;
                }
                match order {
                    Order::C => values[ndims - 1 - i],
                    Order::Fortran => values[i],
                }
            };
            let start_axis = |i: usize| if i >= ndims { 0 } else { axis(starts, i) };
            let block = StridedBlock {
                copy: Extent3::new(axis(subsizes, 0) * elem, axis(subsizes, 1), axis(subsizes, 2)),
                alloc: Extent3::new(axis(sizes, 0) * elem, axis(sizes, 1), axis(sizes, 2)),
                start: Extent3::new(start_axis(0) * elem, start_axis(1), start_axis(2)),
                element_size: old.block.element_size,
            };
            Some(Shape {
                block,
                dims: ndims,
                extent: block.alloc.product(),
            })
        }
    }
}

/// Recover the strided block described by a datatype, if it is a regular grid of rows.
pub fn decode(record: &TypeRecord) -> Option<StridedBlock> {
    let shape = decode_shape(record)?;
    let block = shape.block;
    let end = block.start.checked_add(&block.copy)?;
    if !block.copy.fits_within(&block.alloc) || !end.fits_within(&block.alloc) {
        return None;
    }
    Some(block)
}
