// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::error::Result;
use crate::layout::{ContiguousEncoding, ElementKind, IndexedForm, LayoutDescriptor, RowEncoding};
use crate::library::{Datatype, MessageLibrary, NamedType, Order};
use std::sync::Arc;

/// A committed native datatype together with every handle created to build it.
///
/// Intermediate handles are kept alive for as long as the outer type and freed, each exactly
/// once, when the value is dropped.
pub struct NativeType {
    outer: Datatype,
    handles: Vec<Datatype>,
    library: Arc<dyn MessageLibrary>,
}

impl NativeType {
    /// The committed datatype to hand to the library.
    pub fn datatype(&self) -> Datatype {
        self.outer
    }

    /// Every handle owned, in creation order. The last one is the outer type.
    pub fn handles(&self) -> &[Datatype] {
        &self.handles
    }
}

impl std::fmt::Debug for NativeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeType")
            .field("outer", &self.outer)
            .field("handles", &self.handles)
            .finish()
    }
}

impl Drop for NativeType {
    fn drop(&mut self) {
        for handle in self.handles.drain(..).rev() {
            if let Err(code) = self.library.type_free(handle) {
                tracing::warn!(handle = handle.0, "failed to free datatype: {code}");
            }
        }
    }
}

/// Records handles while a datatype is being assembled; frees them if assembly fails.
struct Assembly<'a> {
    library: &'a Arc<dyn MessageLibrary>,
    handles: Vec<Datatype>,
}

impl<'a> Assembly<'a> {
    fn track(&mut self, created: crate::library::LibResult<Datatype>) -> Result<Datatype> {
        let handle = created?;
        self.handles.push(handle);
        Ok(handle)
    }

    fn finish(mut self, outer: Datatype) -> Result<NativeType> {
        self.library.type_commit(outer)?;
        Ok(NativeType {
            outer,
            handles: std::mem::take(&mut self.handles),
            library: self.library.clone(),
        })
    }
}

impl Drop for Assembly<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..).rev() {
            let _ = self.library.type_free(handle);
        }
    }
}

/// Build and commit the native datatype realizing `descriptor`.
///
/// The datatype describes one instance of the region relative to the allocation base. Only
/// the outer type is committed.
pub fn construct(library: &Arc<dyn MessageLibrary>, descriptor: &LayoutDescriptor) -> Result<NativeType> {
    let byte = library.named_type(NamedType::Byte);
    let mut asm = Assembly {
        library,
        handles: Vec::new(),
    };

    if descriptor.packed_len() == 0 {
        let outer = asm.track(library.type_contiguous(0, byte))?;
        return asm.finish(outer);
    }

    let outer = match descriptor {
        LayoutDescriptor::Contiguous { len, encoding } => {
            let n = *len;
            match encoding {
                ContiguousEncoding::UnitBlocks => asm.track(library.type_vector(n, 1, 1, byte))?,
                ContiguousEncoding::SingleBlock => {
                    asm.track(library.type_vector(1, n, n as isize, byte))?
                }
                ContiguousEncoding::Subarray1D => asm.track(library.type_create_subarray(
                    &[n],
                    &[n],
                    &[0],
                    Order::C,
                    byte,
                ))?,
                ContiguousEncoding::Flat => asm.track(library.type_contiguous(n, byte))?,
            }
        }
        LayoutDescriptor::Vector1D {
            count,
            blocklength,
            stride,
        } => asm.track(library.type_vector(*count, *blocklength, *stride as isize, byte))?,
        LayoutDescriptor::RowPlaneDepth { copy, alloc, row } => {
            let row = match row {
                RowEncoding::SingleBlock => {
                    asm.track(library.type_vector(1, copy.x, alloc.x as isize, byte))?
                }
                RowEncoding::UnitBlocks => asm.track(library.type_vector(copy.x, 1, 1, byte))?,
            };
            let plane = asm.track(library.type_create_hvector(copy.y, 1, alloc.x as isize, row))?;
            asm.track(library.type_create_hvector(copy.z, 1, alloc.plane() as isize, plane))?
        }
        LayoutDescriptor::PlaneThenDepth {
            copy,
            alloc,
            element,
        } => {
            let (ty, size) = match element {
                ElementKind::Byte => (byte, 1),
                ElementKind::Typed(named) => (library.named_type(*named), named.size()),
            };
            let plane = asm.track(library.type_vector(
                copy.y,
                copy.x / size,
                (alloc.x / size) as isize,
                ty,
            ))?;
            asm.track(library.type_create_hvector(copy.z, 1, alloc.plane() as isize, plane))?
        }
        LayoutDescriptor::IndexedRows { copy, rows, form, .. } => {
            let displacements: Vec<isize> = rows.iter().map(|r| r.offset as isize).collect();
            match form {
                IndexedForm::Block => asm.track(library.type_create_hindexed_block(
                    copy.x,
                    &displacements,
                    byte,
                ))?,
                IndexedForm::General => {
                    let lengths: Vec<usize> = rows.iter().map(|r| r.len).collect();
                    asm.track(library.type_create_hindexed(&lengths, &displacements, byte))?
                }
            }
        }
        LayoutDescriptor::Subarray { copy, alloc, start } => {
            // drop leading dimensions the allocation does not have
            let dims = if alloc.z > 1 {
                3
            } else if alloc.y > 1 {
                2
            } else {
                1
            };
            let sizes = alloc.to_c_order();
            let subsizes = copy.to_c_order();
            let starts = start.to_c_order();
            let skip = 3 - dims;
            asm.track(library.type_create_subarray(
                &sizes[skip..],
                &subsizes[skip..],
                &starts[skip..],
                Order::C,
                byte,
            ))?
        }
        LayoutDescriptor::SubarrayVector { copy, alloc } => {
            let plane = asm.track(library.type_create_subarray(
                &[alloc.y, alloc.x],
                &[copy.y, copy.x],
                &[0, 0],
                Order::C,
                byte,
            ))?;
            asm.track(library.type_vector(copy.z, 1, 1, plane))?
        }
    };

    asm.finish(outer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent3;
    use crate::layout::{self, ShapeClass, StrategyId};
    use crate::library::LoopbackWorld;

    fn merged(runs: Vec<(isize, usize)>) -> Vec<(usize, usize)> {
        runs.into_iter().map(|(o, l)| (o as usize, l)).collect()
    }

    #[test]
    fn test_native_typemap_matches_descriptor_for_every_encoding() {
        let world = LoopbackWorld::new(1);
        let lib = Arc::new(world.library(0));
        let dyn_lib: Arc<dyn MessageLibrary> = lib.clone();

        let copy = Extent3::new(16, 3, 4);
        let alloc = Extent3::new(32, 5, 6);
        for strategy in StrategyId::candidates(ShapeClass::PlaneThenDepth) {
            if !strategy.is_native() {
                continue;
            }
            let descriptor = layout::build(strategy, copy, alloc, 4).unwrap();
            let native = construct(&dyn_lib, &descriptor).unwrap();
            let expected: Vec<(usize, usize)> = descriptor
                .merged_rows()
                .into_iter()
                .map(|r| (r.offset, r.len))
                .collect();
            assert_eq!(
                merged(lib.typemap(native.datatype()).unwrap()),
                expected,
                "{strategy}"
            );
            assert_eq!(lib.type_size(native.datatype()).unwrap(), copy.product());
        }
    }

    #[test]
    fn test_intermediate_handles_are_freed_once() {
        let world = LoopbackWorld::new(1);
        let lib = Arc::new(world.library(0));
        let dyn_lib: Arc<dyn MessageLibrary> = lib.clone();

        let descriptor =
            layout::build(StrategyId::V1HvHv, Extent3::new(8, 2, 2), Extent3::new(16, 4, 4), 1)
                .unwrap();
        let native = construct(&dyn_lib, &descriptor).unwrap();
        assert_eq!(native.handles().len(), 3);
        assert_eq!(lib.live_types(), 3);
        drop(native);
        assert_eq!(lib.live_types(), 0);
        assert_eq!(lib.stats().types_freed, 3);
    }

    #[test]
    fn test_flat_subarray_uses_one_dimension() {
        let world = LoopbackWorld::new(1);
        let lib = Arc::new(world.library(0));
        let dyn_lib: Arc<dyn MessageLibrary> = lib.clone();

        let descriptor =
            layout::build(StrategyId::Subarray, Extent3::new(8, 1, 1), Extent3::new(64, 1, 1), 1)
                .unwrap();
        let native = construct(&dyn_lib, &descriptor).unwrap();
        assert_eq!(lib.typemap(native.datatype()).unwrap(), vec![(0, 8)]);
        assert_eq!(lib.type_extent(native.datatype()).unwrap(), (0, 64));
    }
}
