// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ready-to-execute pack plans.

use crate::datatype::{NativeType, construct};
use crate::error::Result;
use crate::extent::Extent3;
use crate::layout::{self, LayoutDescriptor, StrategyId};
use crate::library::{Datatype, MessageLibrary};
use std::sync::Arc;

/// A layout descriptor bound to the native datatype that realizes it.
///
/// The plan owns every datatype handle created for it, intermediates included, and frees
/// each exactly once: when it is dropped, or when [`PackPlan::rebuild`] replaces it with a
/// different layout. Plans for [`StrategyId::DirectCopy`] carry no native datatype.
pub struct PackPlan {
    strategy: StrategyId,
    descriptor: Arc<LayoutDescriptor>,
    native: Option<NativeType>,
    library: Arc<dyn MessageLibrary>,
}

impl std::fmt::Debug for PackPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackPlan")
            .field("strategy", &self.strategy)
            .field("descriptor", &self.descriptor)
            .field("native", &self.native)
            .finish()
    }
}

impl PackPlan {
    /// Describe `copy` inside `alloc` with `strategy` and build its native datatype.
    pub fn build(
        library: &Arc<dyn MessageLibrary>,
        strategy: StrategyId,
        copy: Extent3,
        alloc: Extent3,
        element_size: usize,
    ) -> Result<Self> {
        let descriptor = layout::build(strategy, copy, alloc, element_size)?;
        Self::from_descriptor(library, strategy, descriptor)
    }

    pub fn from_descriptor(
        library: &Arc<dyn MessageLibrary>,
        strategy: StrategyId,
        descriptor: LayoutDescriptor,
    ) -> Result<Self> {
        let native = if strategy.is_native() {
            Some(construct(library, &descriptor)?)
        } else {
            None
        };
        tracing::trace!(%strategy, rows = descriptor.row_count(), "built pack plan");
        Ok(Self {
            strategy,
            descriptor: Arc::new(descriptor),
            native,
            library: library.clone(),
        })
    }

    /// Rebind the plan to a new layout. Nothing is rebuilt when the strategy and
    /// descriptor are unchanged; otherwise the previous handles are released once the new
    /// ones exist.
    pub fn rebuild(
        &mut self,
        strategy: StrategyId,
        copy: Extent3,
        alloc: Extent3,
        element_size: usize,
    ) -> Result<()> {
        let descriptor = layout::build(strategy, copy, alloc, element_size)?;
        if strategy == self.strategy && descriptor == *self.descriptor {
            return Ok(());
        }
        *self = Self::from_descriptor(&self.library, strategy, descriptor)?;
        Ok(())
    }

    pub fn strategy(&self) -> StrategyId {
        self.strategy
    }

    pub fn descriptor(&self) -> &LayoutDescriptor {
        &self.descriptor
    }

    pub(crate) fn shared_descriptor(&self) -> Arc<LayoutDescriptor> {
        self.descriptor.clone()
    }

    /// The committed native datatype, if the strategy has one.
    pub fn datatype(&self) -> Option<Datatype> {
        self.native.as_ref().map(|n| n.datatype())
    }

    pub fn packed_len(&self) -> usize {
        self.descriptor.packed_len()
    }

    /// Number of native datatype handles owned by the plan.
    pub fn owned_handles(&self) -> usize {
        self.native.as_ref().map_or(0, |n| n.handles().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{LoopbackLibrary, LoopbackWorld};
    use rstest::rstest;

    fn library() -> (Arc<LoopbackLibrary>, Arc<dyn MessageLibrary>) {
        let lib = Arc::new(LoopbackWorld::new(1).library(0));
        let dyn_lib: Arc<dyn MessageLibrary> = lib.clone();
        (lib, dyn_lib)
    }

    #[rstest]
    #[case(StrategyId::V1HvHv, 3)]
    #[case(StrategyId::VnHvHv, 3)]
    #[case(StrategyId::VHvByte, 2)]
    #[case(StrategyId::SubarrayVector, 2)]
    #[case(StrategyId::Subarray, 1)]
    #[case(StrategyId::Hindexed, 1)]
    #[case(StrategyId::DirectCopy, 0)]
    fn test_plan_frees_every_handle(#[case] strategy: StrategyId, #[case] handles: usize) {
        let (lib, dyn_lib) = library();
        let plan = PackPlan::build(
            &dyn_lib,
            strategy,
            Extent3::new(8, 3, 2),
            Extent3::new(16, 4, 4),
            1,
        )
        .unwrap();
        assert_eq!(plan.owned_handles(), handles);
        assert_eq!(lib.live_types(), handles);
        assert_eq!(plan.datatype().is_some(), strategy.is_native());
        drop(plan);
        assert_eq!(lib.live_types(), 0);
        assert_eq!(lib.stats().types_freed, handles);
    }

    #[test]
    fn test_rebuild() {
        let (lib, dyn_lib) = library();
        let copy = Extent3::new(8, 3, 2);
        let alloc = Extent3::new(16, 4, 4);
        let mut plan = PackPlan::build(&dyn_lib, StrategyId::V1HvHv, copy, alloc, 1).unwrap();
        let before = plan.datatype();

        plan.rebuild(StrategyId::V1HvHv, copy, alloc, 1).unwrap();
        assert_eq!(plan.datatype(), before);
        assert_eq!(lib.stats().types_created, 3);

        plan.rebuild(StrategyId::Subarray, copy, alloc, 1).unwrap();
        assert_ne!(plan.datatype(), before);
        assert_eq!(lib.live_types(), 1);
        assert_eq!(lib.stats().types_freed, 3);

        // a failed rebuild leaves the plan untouched
        assert!(plan.rebuild(StrategyId::Subarray, Extent3::new(32, 1, 1), alloc, 1).is_err());
        assert_eq!(plan.strategy(), StrategyId::Subarray);
        assert_eq!(lib.live_types(), 1);
    }
}
