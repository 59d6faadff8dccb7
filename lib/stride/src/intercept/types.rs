// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::datatype::{StridedBlock, TypeRecord, decode};
use crate::layout::StrategyId;
use crate::library::{Datatype, MessageLibrary, NamedType};
use crate::plan::PackPlan;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

struct TypeInfo {
    record: Arc<TypeRecord>,
    block: Option<StridedBlock>,
    plans: Mutex<BTreeMap<StrategyId, Arc<PackPlan>>>,
}

/// Application datatypes seen by the interceptor.
///
/// Named types are resolved once at start-up. Derived types are recorded as they are
/// constructed, decoded on commit and forgotten on free, which releases their cached plans.
pub(crate) struct TypeRegistry {
    named: HashMap<Datatype, NamedType>,
    derived: DashMap<Datatype, TypeInfo>,
}

impl TypeRegistry {
    pub(crate) fn new(library: &dyn MessageLibrary) -> Self {
        let named = NamedType::ALL
            .into_iter()
            .map(|ty| (library.named_type(ty), ty))
            .collect();
        Self {
            named,
            derived: DashMap::new(),
        }
    }

    pub(crate) fn named(&self, ty: Datatype) -> Option<NamedType> {
        self.named.get(&ty).copied()
    }

    /// Constructor record of `ty`, if it is named or was built while recording.
    pub(crate) fn record(&self, ty: Datatype) -> Option<Arc<TypeRecord>> {
        if let Some(named) = self.named(ty) {
            return Some(Arc::new(TypeRecord::Named(named)));
        }
        self.derived.get(&ty).map(|info| info.record.clone())
    }

    pub(crate) fn insert(&self, ty: Datatype, record: TypeRecord) {
        self.derived.insert(
            ty,
            TypeInfo {
                record: Arc::new(record),
                block: None,
                plans: Mutex::new(BTreeMap::new()),
            },
        );
    }

    /// Decode `ty` and remember the result. Returns the decoded block, if any.
    pub(crate) fn commit(&self, ty: Datatype) -> Option<StridedBlock> {
        let mut info = self.derived.get_mut(&ty)?;
        info.block = decode(&info.record);
        info.block
    }

    pub(crate) fn remove(&self, ty: Datatype) -> bool {
        self.derived.remove(&ty).is_some()
    }

    pub(crate) fn block(&self, ty: Datatype) -> Option<StridedBlock> {
        self.derived.get(&ty).and_then(|info| info.block)
    }

    pub(crate) fn cached_plan(&self, ty: Datatype, strategy: StrategyId) -> Option<Arc<PackPlan>> {
        let info = self.derived.get(&ty)?;
        let plans = info.plans.lock();
        plans.get(&strategy).cloned()
    }

    /// Cache `plan` for `ty` under `strategy`. If another thread got there first its plan
    /// wins and is returned.
    pub(crate) fn store_plan(
        &self,
        ty: Datatype,
        strategy: StrategyId,
        plan: Arc<PackPlan>,
    ) -> Arc<PackPlan> {
        match self.derived.get(&ty) {
            Some(info) => info.plans.lock().entry(strategy).or_insert(plan).clone(),
            None => plan,
        }
    }

    /// Number of derived types currently recorded.
    pub(crate) fn len(&self) -> usize {
        self.derived.len()
    }
}
