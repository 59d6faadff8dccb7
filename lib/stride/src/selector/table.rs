// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{PlacementPair, SizeBucket};
use crate::error::{Result, StrideError};
use crate::layout::{ShapeClass, StrategyId};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Lookup key of the performance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PerformanceKey {
    pub class: ShapeClass,
    pub bucket: SizeBucket,
    pub placement: PlacementPair,
}

/// Measured throughput, in bytes per second, of every strategy timed for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub key: PerformanceKey,
    pub throughput: BTreeMap<StrategyId, f64>,
}

/// Measured strategy throughput by shape class, size bucket and placement.
///
/// Serialized as a list of [`PerformanceRecord`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<PerformanceRecord>", into = "Vec<PerformanceRecord>")]
pub struct PerformanceTable {
    records: BTreeMap<PerformanceKey, BTreeMap<StrategyId, f64>>,
}

impl From<Vec<PerformanceRecord>> for PerformanceTable {
    fn from(records: Vec<PerformanceRecord>) -> Self {
        let mut table = PerformanceTable::default();
        for record in records {
            for (strategy, throughput) in record.throughput {
                // non-finite entries in a cache file are dropped
                let _ = table.record(record.key, strategy, throughput);
            }
        }
        table
    }
}

impl From<PerformanceTable> for Vec<PerformanceRecord> {
    fn from(table: PerformanceTable) -> Self {
        table
            .records
            .into_iter()
            .map(|(key, throughput)| PerformanceRecord { key, throughput })
            .collect()
    }
}

impl PerformanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the throughput of `strategy` for `key`, replacing any earlier value.
    pub fn record(&mut self, key: PerformanceKey, strategy: StrategyId, throughput: f64) -> Result<()> {
        if !throughput.is_finite() || throughput < 0.0 {
            return Err(StrideError::InvalidArgument(format!(
                "throughput for {strategy} must be finite and non-negative, got {throughput}"
            )));
        }
        self.records.entry(key).or_default().insert(strategy, throughput);
        Ok(())
    }

    pub fn get(&self, key: &PerformanceKey) -> Option<&BTreeMap<StrategyId, f64>> {
        self.records.get(key)
    }

    /// Fastest strategy for `key` among those accepted by `allowed`.
    ///
    /// Equal throughputs resolve to the strategy with the smallest name.
    pub fn best(
        &self,
        key: &PerformanceKey,
        allowed: impl Fn(StrategyId) -> bool,
    ) -> Option<StrategyId> {
        let mut best: Option<(StrategyId, f64)> = None;
        for (&strategy, &throughput) in self.records.get(key)? {
            if !allowed(strategy) {
                continue;
            }
            match best {
                Some((_, top)) if throughput.total_cmp(&top).is_le() => {}
                _ => best = Some((strategy, throughput)),
            }
        }
        best.map(|(strategy, _)| strategy)
    }

    pub fn records(&self) -> impl Iterator<Item = (&PerformanceKey, &BTreeMap<StrategyId, f64>)> {
        self.records.iter()
    }

    /// Number of keys with at least one measurement.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading performance table {}", path.display()))?;
        let table = serde_json::from_slice(&data)
            .with_context(|| format!("parsing performance table {}", path.display()))?;
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).context("serializing performance table")?;
        std::fs::write(path, data)
            .with_context(|| format!("writing performance table {}", path.display()))?;
        Ok(())
    }
}
