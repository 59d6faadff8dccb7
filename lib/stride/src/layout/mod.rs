// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Layout descriptors for strided regions.
//!
//! A region is a `copy` sub-volume embedded in an `alloc` volume, x fastest and measured in
//! bytes. Every descriptor, whatever its encoding, enumerates the same rows in the same
//! order: for each plane `z` in `0..copy.z` and each row `y` in `0..copy.y`, `copy.x` bytes at
//! `z * alloc.y * alloc.x + y * alloc.x`. Encodings differ only in how the native datatype
//! realizing them is assembled (see [`crate::datatype::construct`]).
//!
//! Building a descriptor is pure. Descriptors are built at the origin of the allocation;
//! callers holding a region with a non-zero corner shift the base address by
//! [`Extent3::offset_of`], or use [`build_subarray_at`].

mod strategy;

pub use strategy::StrategyId;

use crate::error::{Result, StrideError};
use crate::extent::Extent3;
use crate::library::NamedType;
use serde::{Deserialize, Serialize};

/// Canonical geometric class of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeClass {
    /// One contiguous byte run.
    Contiguous,
    /// Equal blocks at a uniform stride.
    #[serde(rename = "vector_1d")]
    Vector1D,
    /// Rows inside planes inside a volume.
    PlaneThenDepth,
}

/// Encodings of a single contiguous run of `n` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContiguousEncoding {
    /// `n` one-byte blocks at unit stride.
    UnitBlocks,
    /// One block of `n` bytes.
    SingleBlock,
    /// Trivial one-dimensional subarray.
    Subarray1D,
    /// Plain contiguous type.
    Flat,
}

/// Element type of the typed plane encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Byte,
    Typed(NamedType),
}

impl ElementKind {
    pub fn size(&self) -> usize {
        match self {
            ElementKind::Byte => 1,
            ElementKind::Typed(ty) => ty.size(),
        }
    }
}

/// How one row is described in the row-plane-depth encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowEncoding {
    /// A single block of `copy.x` bytes inside a row of `alloc.x` bytes.
    SingleBlock,
    /// `copy.x` unit blocks at unit stride.
    UnitBlocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexedForm {
    /// Uniform block length.
    Block,
    /// Per-row block length.
    General,
}

/// One contiguous byte run of a region, relative to the allocation base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Row {
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutDescriptor {
    Contiguous {
        len: usize,
        encoding: ContiguousEncoding,
    },
    Vector1D {
        count: usize,
        blocklength: usize,
        stride: usize,
    },
    PlaneThenDepth {
        copy: Extent3,
        alloc: Extent3,
        element: ElementKind,
    },
    RowPlaneDepth {
        copy: Extent3,
        alloc: Extent3,
        row: RowEncoding,
    },
    IndexedRows {
        copy: Extent3,
        alloc: Extent3,
        rows: Vec<Row>,
        form: IndexedForm,
    },
    Subarray {
        copy: Extent3,
        alloc: Extent3,
        start: Extent3,
    },
    SubarrayVector {
        copy: Extent3,
        alloc: Extent3,
    },
}

impl LayoutDescriptor {
    /// Number of rows enumerated by the descriptor.
    pub fn row_count(&self) -> usize {
        match self {
            LayoutDescriptor::Contiguous { len, .. } => usize::from(*len > 0),
            LayoutDescriptor::Vector1D {
                count, blocklength, ..
            } => {
                if *blocklength == 0 {
                    0
                } else {
                    *count
                }
            }
            LayoutDescriptor::IndexedRows { rows, .. } => rows.len(),
            LayoutDescriptor::PlaneThenDepth { copy, .. }
            | LayoutDescriptor::RowPlaneDepth { copy, .. }
            | LayoutDescriptor::Subarray { copy, .. }
            | LayoutDescriptor::SubarrayVector { copy, .. } => {
                if copy.x == 0 {
                    0
                } else {
                    copy.y * copy.z
                }
            }
        }
    }

    /// Row `index` in canonical order. Constant time for every variant.
    pub fn row(&self, index: usize) -> Option<Row> {
        if index >= self.row_count() {
            return None;
        }
        let row = match self {
            LayoutDescriptor::Contiguous { len, .. } => Row {
                offset: 0,
                len: *len,
            },
            LayoutDescriptor::Vector1D {
                blocklength,
                stride,
                ..
            } => Row {
                offset: index * stride,
                len: *blocklength,
            },
            LayoutDescriptor::IndexedRows { rows, .. } => rows[index],
            LayoutDescriptor::Subarray { copy, alloc, start } => {
                let (y, z) = (index % copy.y, index / copy.y);
                Row {
                    offset: alloc.offset_of(start) + alloc.row_offset(y, z),
                    len: copy.x,
                }
            }
            LayoutDescriptor::PlaneThenDepth { copy, alloc, .. }
            | LayoutDescriptor::RowPlaneDepth { copy, alloc, .. }
            | LayoutDescriptor::SubarrayVector { copy, alloc } => {
                let (y, z) = (index % copy.y, index / copy.y);
                Row {
                    offset: alloc.row_offset(y, z),
                    len: copy.x,
                }
            }
        };
        Some(row)
    }

    /// All rows in canonical order.
    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        (0..self.row_count()).filter_map(move |i| self.row(i))
    }

    /// Bytes produced by packing the region.
    pub fn packed_len(&self) -> usize {
        match self {
            LayoutDescriptor::Contiguous { len, .. } => *len,
            LayoutDescriptor::Vector1D {
                count, blocklength, ..
            } => count * blocklength,
            LayoutDescriptor::IndexedRows { rows, .. } => rows.iter().map(|r| r.len).sum(),
            LayoutDescriptor::PlaneThenDepth { copy, .. }
            | LayoutDescriptor::RowPlaneDepth { copy, .. }
            | LayoutDescriptor::Subarray { copy, .. }
            | LayoutDescriptor::SubarrayVector { copy, .. } => copy.product(),
        }
    }

    /// Byte coverage with adjacent rows merged; equal for every encoding of the same region.
    pub fn merged_rows(&self) -> Vec<Row> {
        let mut merged: Vec<Row> = Vec::with_capacity(self.row_count());
        for row in self.rows() {
            match merged.last_mut() {
                Some(last) if last.offset + last.len == row.offset => last.len += row.len,
                _ => merged.push(row),
            }
        }
        merged
    }

    /// Highest byte offset touched, exclusive. The allocation must be at least this long.
    pub fn span(&self) -> usize {
        self.rows().map(|r| r.offset + r.len).max().unwrap_or(0)
    }
}

/// Parameters `(count, blocklength, stride)` when the region is one uniformly strided axis.
fn vector_params(copy: &Extent3, alloc: &Extent3) -> Option<(usize, usize, usize)> {
    if copy.y == 1 || copy.x == alloc.x {
        // each plane is a single run
        Some((copy.z, copy.x * copy.y, alloc.plane()))
    } else if copy.z == 1 {
        Some((copy.y, copy.x, alloc.x))
    } else if copy.y == alloc.y {
        Some((copy.y * copy.z, copy.x, alloc.x))
    } else {
        None
    }
}

fn is_contiguous(copy: &Extent3, alloc: &Extent3) -> bool {
    copy.product() == 0
        || ((copy.y == 1 || copy.x == alloc.x)
            && (copy.z == 1 || copy.plane() == alloc.plane()))
}

/// The canonical class of the region `copy` inside `alloc`.
pub fn classify(copy: &Extent3, alloc: &Extent3) -> ShapeClass {
    if is_contiguous(copy, alloc) {
        ShapeClass::Contiguous
    } else if vector_params(copy, alloc).is_some() {
        ShapeClass::Vector1D
    } else {
        ShapeClass::PlaneThenDepth
    }
}

fn validate(copy: &Extent3, alloc: &Extent3) -> Result<()> {
    if !copy.fits_within(alloc) || alloc.checked_product().is_none() {
        return Err(StrideError::InvalidExtent {
            copy: *copy,
            alloc: *alloc,
        });
    }
    Ok(())
}

fn enumerate_rows(copy: &Extent3, alloc: &Extent3) -> Vec<Row> {
    if copy.x == 0 {
        return Vec::new();
    }
    let mut rows = Vec::with_capacity(copy.y * copy.z);
    for z in 0..copy.z {
        for y in 0..copy.y {
            rows.push(Row {
                offset: alloc.row_offset(y, z),
                len: copy.x,
            });
        }
    }
    rows
}

fn canonical(class: ShapeClass, copy: &Extent3, alloc: &Extent3) -> LayoutDescriptor {
    match (class, vector_params(copy, alloc)) {
        (ShapeClass::Contiguous, _) => LayoutDescriptor::Contiguous {
            len: copy.product(),
            encoding: ContiguousEncoding::Flat,
        },
        (ShapeClass::Vector1D, Some((count, blocklength, stride))) => {
            LayoutDescriptor::Vector1D {
                count,
                blocklength,
                stride,
            }
        }
        _ => LayoutDescriptor::PlaneThenDepth {
            copy: *copy,
            alloc: *alloc,
            element: ElementKind::Byte,
        },
    }
}

/// Build the descriptor realizing `strategy` for the region `copy` at the origin of `alloc`.
///
/// `element_size` is the size of the user's element type; it only matters for the typed
/// plane encoding. Fails with [`StrideError::InvalidExtent`] when `copy` does not fit in
/// `alloc`, and with [`StrideError::NotApplicable`] when the strategy cannot express the
/// region's class.
pub fn build(
    strategy: StrategyId,
    copy: Extent3,
    alloc: Extent3,
    element_size: usize,
) -> Result<LayoutDescriptor> {
    validate(&copy, &alloc)?;
    let class = classify(&copy, &alloc);

    let contiguous = |encoding| {
        if class == ShapeClass::Contiguous {
            Ok(LayoutDescriptor::Contiguous {
                len: copy.product(),
                encoding,
            })
        } else {
            Err(StrideError::not_applicable(
                strategy,
                format!("region {copy} in {alloc} is not contiguous"),
            ))
        }
    };

    match strategy {
        StrategyId::Contiguous => contiguous(ContiguousEncoding::Flat),
        StrategyId::ContiguousSingleBlock => contiguous(ContiguousEncoding::SingleBlock),
        StrategyId::ContiguousSubarray => contiguous(ContiguousEncoding::Subarray1D),
        StrategyId::ContiguousUnitBlocks => contiguous(ContiguousEncoding::UnitBlocks),
        StrategyId::DirectCopy => Ok(canonical(class, &copy, &alloc)),
        StrategyId::Vector => match class {
            ShapeClass::Contiguous => {
                let len = copy.product();
                Ok(LayoutDescriptor::Vector1D {
                    count: 1,
                    blocklength: len,
                    stride: len,
                })
            }
            _ => match vector_params(&copy, &alloc) {
                Some((count, blocklength, stride)) => Ok(LayoutDescriptor::Vector1D {
                    count,
                    blocklength,
                    stride,
                }),
                None => Err(StrideError::not_applicable(
                    strategy,
                    format!("region {copy} in {alloc} has more than one strided axis"),
                )),
            },
        },
        StrategyId::V1HvHv => Ok(LayoutDescriptor::RowPlaneDepth {
            copy,
            alloc,
            row: RowEncoding::SingleBlock,
        }),
        StrategyId::VnHvHv => Ok(LayoutDescriptor::RowPlaneDepth {
            copy,
            alloc,
            row: RowEncoding::UnitBlocks,
        }),
        StrategyId::VHvByte => Ok(LayoutDescriptor::PlaneThenDepth {
            copy,
            alloc,
            element: ElementKind::Byte,
        }),
        StrategyId::VHvTyped => {
            let ty = NamedType::float_of_size(element_size).ok_or_else(|| {
                StrideError::not_applicable(
                    strategy,
                    format!("no element type of size {element_size}"),
                )
            })?;
            if copy.x % element_size != 0 || alloc.x % element_size != 0 {
                return Err(StrideError::not_applicable(
                    strategy,
                    format!("row widths {} and {} are not multiples of {element_size}", copy.x, alloc.x),
                ));
            }
            Ok(LayoutDescriptor::PlaneThenDepth {
                copy,
                alloc,
                element: ElementKind::Typed(ty),
            })
        }
        StrategyId::HindexedBlock => Ok(LayoutDescriptor::IndexedRows {
            copy,
            alloc,
            rows: enumerate_rows(&copy, &alloc),
            form: IndexedForm::Block,
        }),
        StrategyId::Hindexed => Ok(LayoutDescriptor::IndexedRows {
            copy,
            alloc,
            rows: enumerate_rows(&copy, &alloc),
            form: IndexedForm::General,
        }),
        StrategyId::Subarray => Ok(LayoutDescriptor::Subarray {
            copy,
            alloc,
            start: Extent3::default(),
        }),
        StrategyId::SubarrayVector => Ok(LayoutDescriptor::SubarrayVector { copy, alloc }),
    }
}

/// Subarray descriptor for a region whose corner sits at `start` inside `alloc`.
pub fn build_subarray_at(copy: Extent3, alloc: Extent3, start: Extent3) -> Result<LayoutDescriptor> {
    validate(&copy, &alloc)?;
    let end = start
        .checked_add(&copy)
        .ok_or_else(|| StrideError::InvalidArgument(format!("start {start} overflows")))?;
    if !end.fits_within(&alloc) {
        return Err(StrideError::InvalidArgument(format!(
            "region {copy} at {start} exceeds allocation {alloc}"
        )));
    }
    Ok(LayoutDescriptor::Subarray { copy, alloc, start })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn e(x: usize, y: usize, z: usize) -> Extent3 {
        Extent3::new(x, y, z)
    }

    #[test]
    fn test_reference_scenario() {
        let copy = e(100, 13, 47);
        let alloc = e(256, 512, 1024);
        let d = build(StrategyId::V1HvHv, copy, alloc, 1).unwrap();
        assert_eq!(d.row_count(), 611);
        assert_eq!(d.row(0), Some(Row { offset: 0, len: 100 }));
        assert_eq!(d.row(1), Some(Row { offset: 256, len: 100 }));
        assert_eq!(d.row(13), Some(Row { offset: 131072, len: 100 }));
        assert_eq!(d.row(610), Some(Row { offset: 46 * 131072 + 12 * 256, len: 100 }));
        assert_eq!(d.row(610).unwrap().offset, 6032384);
        assert_eq!(d.row(611), None);
        assert_eq!(d.packed_len(), 61100);
        assert_eq!(classify(&copy, &alloc), ShapeClass::PlaneThenDepth);
    }

    #[rstest]
    #[case(e(64, 8, 4), e(64, 8, 4), ShapeClass::Contiguous)]
    #[case(e(64, 4, 1), e(64, 8, 4), ShapeClass::Contiguous)]
    #[case(e(10, 1, 1), e(64, 8, 4), ShapeClass::Contiguous)]
    #[case(e(0, 8, 4), e(64, 8, 4), ShapeClass::Contiguous)]
    #[case(e(10, 8, 1), e(64, 8, 4), ShapeClass::Vector1D)]
    #[case(e(10, 1, 4), e(64, 8, 4), ShapeClass::Vector1D)]
    #[case(e(64, 4, 4), e(64, 8, 4), ShapeClass::Vector1D)]
    #[case(e(10, 8, 4), e(64, 8, 4), ShapeClass::Vector1D)]
    #[case(e(10, 4, 4), e(64, 8, 4), ShapeClass::PlaneThenDepth)]
    fn test_classify(#[case] copy: Extent3, #[case] alloc: Extent3, #[case] class: ShapeClass) {
        assert_eq!(classify(&copy, &alloc), class);
    }

    #[test]
    fn test_extent_violation_is_rejected() {
        for strategy in StrategyId::ALL {
            let err = build(strategy, e(300, 1, 1), e(256, 1, 1), 1).unwrap_err();
            assert!(matches!(err, StrideError::InvalidExtent { .. }), "{strategy}");
        }
    }

    #[test]
    fn test_all_encodings_enumerate_the_same_rows() {
        let copy = e(24, 3, 5);
        let alloc = e(40, 7, 6);
        let expected = build(StrategyId::Hindexed, copy, alloc, 8).unwrap().merged_rows();
        let unmerged = enumerate_rows(&copy, &alloc);
        for strategy in StrategyId::candidates(ShapeClass::PlaneThenDepth) {
            let d = build(strategy, copy, alloc, 8).unwrap();
            assert_eq!(d.merged_rows(), expected, "{strategy}");
            if strategy != StrategyId::DirectCopy {
                // the strided encodings agree row for row, not only after merging
                assert_eq!(d.rows().collect::<Vec<_>>(), unmerged, "{strategy}");
            }
            assert_eq!(d.packed_len(), copy.product(), "{strategy}");
        }
    }

    #[test]
    fn test_contiguous_collapse() {
        let n = e(4096, 1, 1);
        for strategy in StrategyId::candidates(ShapeClass::Contiguous) {
            let d = build(strategy, n, e(8192, 4, 4), 1).unwrap();
            assert_eq!(d.merged_rows(), vec![Row { offset: 0, len: 4096 }], "{strategy}");
        }
        let err = build(StrategyId::Contiguous, e(10, 2, 1), e(20, 2, 1), 1).unwrap_err();
        assert!(matches!(err, StrideError::NotApplicable { .. }));
    }

    #[test]
    fn test_single_plane_degenerates() {
        let copy = e(16, 5, 1);
        let alloc = e(32, 8, 1);
        let vector = build(StrategyId::Vector, copy, alloc, 1).unwrap();
        assert_eq!(
            vector,
            LayoutDescriptor::Vector1D {
                count: 5,
                blocklength: 16,
                stride: 32
            }
        );
        for strategy in [StrategyId::V1HvHv, StrategyId::Subarray, StrategyId::VHvByte] {
            let d = build(strategy, copy, alloc, 1).unwrap();
            assert_eq!(d.merged_rows(), vector.merged_rows(), "{strategy}");
        }
    }

    #[test]
    fn test_typed_plane_requires_divisible_rows() {
        let d = build(StrategyId::VHvTyped, e(16, 2, 2), e(32, 4, 4), 4).unwrap();
        assert!(matches!(
            d,
            LayoutDescriptor::PlaneThenDepth {
                element: ElementKind::Typed(NamedType::Float),
                ..
            }
        ));
        assert!(build(StrategyId::VHvTyped, e(18, 2, 2), e(32, 4, 4), 4).is_err());
        assert!(build(StrategyId::VHvTyped, e(16, 2, 2), e(32, 4, 4), 3).is_err());
    }

    #[test]
    fn test_subarray_at_offset() {
        let d = build_subarray_at(e(4, 2, 2), e(16, 8, 8), e(2, 1, 3)).unwrap();
        let base = 3 * 128 + 16 + 2;
        assert_eq!(d.row(0), Some(Row { offset: base, len: 4 }));
        assert_eq!(d.row(3), Some(Row { offset: base + 128 + 16, len: 4 }));
        assert!(build_subarray_at(e(4, 2, 2), e(16, 8, 8), e(13, 0, 0)).is_err());
    }

    #[test]
    fn test_empty_region() {
        let d = build(StrategyId::Subarray, e(0, 3, 3), e(8, 8, 8), 1).unwrap();
        assert_eq!(d.row_count(), 0);
        assert_eq!(d.packed_len(), 0);
        assert_eq!(classify(&e(0, 3, 3), &e(8, 8, 8)), ShapeClass::Contiguous);
    }
}
