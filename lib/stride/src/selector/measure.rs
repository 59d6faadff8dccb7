// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Start-up throughput measurement.
//!
//! For each shape class and each size on a fixed ladder, every applicable strategy packs a
//! representative host region `iterations` times through the engine; the mean bytes per
//! second goes into the table under the host-to-host placement.
//!
//! With the `cuda` feature the same ladder is timed against device 0 as well: packing a
//! device region into host staging (device-to-host) and unpacking host bytes into a device
//! region (host-to-device). The staged copy always competes there; native encodings join
//! only when the library is device-aware. Without a usable device the pairs are skipped.

use super::{PerformanceKey, PerformanceTable, PlacementPair, SizeBucket};
use crate::engine::{MemoryHandle, PackEngine};
#[cfg(feature = "cuda")]
use crate::engine::Placement;
use crate::error::{Result, StrideError};
use crate::extent::Extent3;
use crate::layout::{ShapeClass, StrategyId, classify};
use crate::plan::PackPlan;
use std::path::Path;
use std::time::{Duration, Instant};

/// Region sizes timed for every class, in bytes.
pub const SIZE_LADDER: [usize; 4] = [1 << 10, 1 << 13, 1 << 16, 1 << 19];

/// Element size used for the typed plane encoding during measurement.
const MEASURE_ELEMENT_SIZE: usize = 4;

#[cfg(feature = "cuda")]
const MEASURE_DEVICE: u32 = 0;

/// Representative `(copy, alloc)` of `bytes` payload for each class.
pub fn representative(class: ShapeClass, bytes: usize) -> (Extent3, Extent3) {
    match class {
        ShapeClass::Contiguous => {
            let e = Extent3::new(bytes, 1, 1);
            (e, e)
        }
        ShapeClass::Vector1D => {
            let rows = (bytes / 128).max(1);
            (Extent3::new(128, rows, 1), Extent3::new(256, rows, 1))
        }
        ShapeClass::PlaneThenDepth => {
            let depth = (bytes / 512).max(2);
            (Extent3::new(128, 4, depth), Extent3::new(256, 8, depth))
        }
    }
}

/// One timed operation and the memory it touches.
#[derive(Debug, Clone, Copy)]
enum Transfer {
    /// Pack the region at the handle into staging.
    Pack(MemoryHandle),
    /// Unpack a full packed buffer into the region at `dest`.
    Unpack {
        packed: MemoryHandle,
        dest: MemoryHandle,
    },
}

impl Transfer {
    fn run(self, engine: &PackEngine, plan: &PackPlan) -> Result<()> {
        match self {
            Transfer::Pack(source) => Ok(unsafe { engine.pack(plan, source)? }.wait()?),
            Transfer::Unpack { packed, dest } => {
                Ok(unsafe { engine.unpack(plan, packed, plan.packed_len(), dest)? }.wait()?)
            }
        }
    }
}

fn time_strategy(
    engine: &PackEngine,
    strategy: StrategyId,
    copy: Extent3,
    alloc: Extent3,
    transfer: Transfer,
    iterations: usize,
) -> Result<f64> {
    let plan = PackPlan::build(engine.library(), strategy, copy, alloc, MEASURE_ELEMENT_SIZE)?;

    // warm-up, not timed
    transfer.run(engine, &plan)?;

    let started = Instant::now();
    for _ in 0..iterations {
        transfer.run(engine, &plan)?;
    }
    let elapsed = started.elapsed().max(Duration::from_nanos(1));
    Ok((plan.packed_len() * iterations) as f64 / elapsed.as_secs_f64())
}

/// Time `strategies` for one transfer and record each under `key`.
#[allow(clippy::too_many_arguments)]
fn record_strategies(
    table: &mut PerformanceTable,
    engine: &PackEngine,
    key: PerformanceKey,
    strategies: impl Iterator<Item = StrategyId>,
    copy: Extent3,
    alloc: Extent3,
    transfer: Transfer,
    iterations: usize,
) -> Result<()> {
    for strategy in strategies {
        match time_strategy(engine, strategy, copy, alloc, transfer, iterations) {
            Ok(throughput) => {
                tracing::trace!(class = ?key.class, placement = ?key.placement, %strategy, throughput, "measured");
                table.record(key, strategy, throughput)?;
            }
            Err(StrideError::NotApplicable { .. }) => {}
            Err(e) => {
                tracing::debug!(class = ?key.class, placement = ?key.placement, %strategy, "skipping strategy: {e}");
            }
        }
    }
    Ok(())
}

/// A device region of `len` bytes that synchronous and stream copies may use right away.
#[cfg(feature = "cuda")]
fn device_region(engine: &PackEngine, len: usize) -> Result<dynamo_memory::StagingBuffer> {
    let region = engine.acquire_staging(len, Placement::Device(MEASURE_DEVICE))?;
    if let Some(stream) = region.stream() {
        stream.synchronize().map_err(anyhow::Error::from)?;
    }
    Ok(region)
}

/// Time the device-to-host and host-to-device pairs for one representative region.
#[cfg(feature = "cuda")]
fn measure_device_pairs(
    table: &mut PerformanceTable,
    engine: &PackEngine,
    class: ShapeClass,
    copy: Extent3,
    alloc: Extent3,
    iterations: usize,
) -> Result<()> {
    use dynamo_memory::MemoryDescription;

    let region = device_region(engine, alloc.product())?;
    let device = MemoryHandle::device(region.addr(), MEASURE_DEVICE);
    let packed = vec![0x5au8; copy.product()];
    let device_aware = engine.capabilities().device_aware;
    let strategies = move || {
        StrategyId::candidates(class).filter(move |s| !s.is_native() || device_aware)
    };

    for (pair, transfer) in [
        (
            PlacementPair::from((Placement::Device(MEASURE_DEVICE), Placement::Host)),
            Transfer::Pack(device),
        ),
        (
            PlacementPair::from((Placement::Host, Placement::Device(MEASURE_DEVICE))),
            Transfer::Unpack {
                packed: MemoryHandle::host(packed.as_ptr() as usize),
                dest: device,
            },
        ),
    ] {
        let key = PerformanceKey {
            class,
            bucket: SizeBucket::of(copy.product()),
            placement: pair,
        };
        record_strategies(table, engine, key, strategies(), copy, alloc, transfer, iterations)?;
    }
    Ok(())
}

/// Time every applicable strategy over the size ladder.
pub fn measure(engine: &PackEngine, iterations: usize) -> Result<PerformanceTable> {
    if iterations == 0 {
        return Err(StrideError::InvalidArgument(
            "measurement needs at least one iteration".into(),
        ));
    }

    let mut table = PerformanceTable::new();
    let started = Instant::now();
    #[cfg(feature = "cuda")]
    let mut device_pairs = true;

    for class in [ShapeClass::Contiguous, ShapeClass::Vector1D, ShapeClass::PlaneThenDepth] {
        for bytes in SIZE_LADDER {
            let (copy, alloc) = representative(class, bytes);
            debug_assert_eq!(classify(&copy, &alloc), class);
            let source = vec![0xa5u8; alloc.product()];
            let key = PerformanceKey {
                class,
                bucket: SizeBucket::of(copy.product()),
                placement: PlacementPair::HOST,
            };
            record_strategies(
                &mut table,
                engine,
                key,
                StrategyId::candidates(class),
                copy,
                alloc,
                Transfer::Pack(MemoryHandle::host(source.as_ptr() as usize)),
                iterations,
            )?;

            #[cfg(feature = "cuda")]
            if device_pairs {
                if let Err(e) =
                    measure_device_pairs(&mut table, engine, class, copy, alloc, iterations)
                {
                    tracing::warn!("skipping device placements in measurement: {e}");
                    device_pairs = false;
                }
            }
        }
    }

    tracing::info!(
        entries = table.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "strategy measurement complete"
    );
    Ok(table)
}

/// The table to start with: the cache file when it exists, otherwise a fresh measurement
/// (saved to the cache path when one is given), otherwise empty.
pub fn initial_table(
    engine: &PackEngine,
    measure_enabled: bool,
    iterations: usize,
    cache_path: Option<&Path>,
) -> Result<PerformanceTable> {
    if let Some(path) = cache_path {
        if path.exists() {
            match PerformanceTable::load(path) {
                Ok(table) => {
                    tracing::info!(path = %path.display(), entries = table.len(), "loaded performance table");
                    return Ok(table);
                }
                Err(e) => tracing::warn!("ignoring unreadable performance table: {e}"),
            }
        }
    }

    if !measure_enabled {
        return Ok(PerformanceTable::new());
    }

    let table = measure(engine, iterations)?;
    if let Some(path) = cache_path {
        if let Err(e) = table.save(path) {
            tracing::warn!("failed to save performance table: {e}");
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LibraryCapabilities;
    use crate::library::LoopbackWorld;
    use dynamo_memory::{StagingPool, StagingPoolConfig};
    use std::sync::Arc;

    fn engine() -> PackEngine {
        let lib = Arc::new(LoopbackWorld::new(1).library(0));
        let pool = Arc::new(StagingPool::new(StagingPoolConfig::default()).unwrap());
        PackEngine::new(lib, pool, LibraryCapabilities::default())
    }

    #[test]
    fn test_representatives_have_their_class() {
        for class in [ShapeClass::Contiguous, ShapeClass::Vector1D, ShapeClass::PlaneThenDepth] {
            for bytes in SIZE_LADDER {
                let (copy, alloc) = representative(class, bytes);
                assert_eq!(classify(&copy, &alloc), class, "{class:?} {bytes}");
                assert_eq!(copy.product(), bytes);
            }
        }
    }

    #[test]
    fn test_measure_fills_every_key() {
        let table = measure(&engine(), 1).unwrap();
        let host_keys = table.records().filter(|(key, _)| key.placement.is_host()).count();
        assert_eq!(host_keys, 3 * SIZE_LADDER.len());
        for (key, entries) in table.records() {
            if !cfg!(feature = "cuda") {
                assert!(key.placement.is_host());
            }
            for strategy in entries.keys() {
                assert!(strategy.applicable_to(key.class));
            }
        }
        assert!(measure(&engine(), 0).is_err());
    }

    #[cfg(feature = "testing-cuda")]
    #[test]
    fn test_measure_times_device_pairs() {
        use crate::selector::PlacementKind;

        let table = measure(&engine(), 1).unwrap();
        for pair in [
            PlacementPair::new(PlacementKind::Device, PlacementKind::Host),
            PlacementPair::new(PlacementKind::Host, PlacementKind::Device),
        ] {
            let keys: Vec<_> = table
                .records()
                .filter(|(key, _)| key.placement == pair)
                .collect();
            assert_eq!(keys.len(), 3 * SIZE_LADDER.len(), "{pair:?}");
            for (_, entries) in keys {
                // the library is not device-aware, so only the staged copy competes
                assert_eq!(entries.keys().copied().collect::<Vec<_>>(), vec![StrategyId::DirectCopy]);
            }
        }
    }

    #[test]
    fn test_initial_table_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.json");
        let engine = engine();

        assert!(initial_table(&engine, false, 1, Some(&path)).unwrap().is_empty());
        assert!(!path.exists());

        let measured = initial_table(&engine, true, 1, Some(&path)).unwrap();
        assert!(path.exists());
        let cached = initial_table(&engine, false, 1, Some(&path)).unwrap();
        assert_eq!(cached, measured);
    }
}
