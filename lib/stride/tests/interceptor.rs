// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end transfers through the interceptor over the in-process library.

use dynamo_stride::config::environment_names as env;
use dynamo_stride::layout::classify;
use dynamo_stride::library::Order;
use dynamo_stride::selector::PerformanceKey;
use dynamo_stride::{
    Communicator, Datatype, Interceptor, LoopbackLibrary, LoopbackWorld, MessageLibrary,
    NamedType, PerformanceTable, PlacementPair, ShapeClass, SizeBucket, StrategyId,
    StrideConfig,
};
use std::sync::Arc;

const WORLD: Communicator = Communicator::WORLD;

fn config() -> StrideConfig {
    StrideConfig::builder().measure(false).build().unwrap()
}

fn wrap(world: &Arc<LoopbackWorld>, rank: i32, config: StrideConfig) -> (Arc<LoopbackLibrary>, Interceptor) {
    let lib = Arc::new(world.library(rank));
    let interceptor = Interceptor::new(lib.clone(), config);
    (lib, interceptor)
}

fn subarray(lib: &dyn MessageLibrary, sizes: &[usize], subsizes: &[usize], starts: &[usize]) -> Datatype {
    let double = lib.named_type(NamedType::Double);
    let ty = lib
        .type_create_subarray(sizes, subsizes, starts, Order::C, double)
        .unwrap();
    lib.type_commit(ty).unwrap();
    ty
}

/// A configuration whose cached table ranks the direct-copy kernel first for `copy`.
fn prefer_direct_copy(dir: &tempfile::TempDir, copy: dynamo_stride::Extent3) -> StrideConfig {
    let mut table = PerformanceTable::new();
    let key = PerformanceKey {
        class: ShapeClass::Vector1D,
        bucket: SizeBucket::of(copy.product()),
        placement: PlacementPair::HOST,
    };
    table.record(key, StrategyId::DirectCopy, 1e12).unwrap();
    table.record(key, StrategyId::Subarray, 1.0).unwrap();
    let cache = dir.path().join("perf.json");
    table.save(&cache).unwrap();

    StrideConfig::builder()
        .measure(false)
        .perf_cache_path(Some(cache))
        .build()
        .unwrap()
}

/// Send a 2x3x4 box of doubles from one array layout and receive it into another.
fn exchange(config: StrideConfig) -> (Vec<f64>, [Arc<LoopbackLibrary>; 2], [Interceptor; 2]) {
    let world = LoopbackWorld::new(2);
    let (lib0, sender) = wrap(&world, 0, config.clone());
    let (lib1, receiver) = wrap(&world, 1, config);

    let source: Vec<f64> = (0..4 * 6 * 10).map(|i| i as f64).collect();
    let mut dest = vec![-1.0f64; 3 * 5 * 8];

    std::thread::scope(|s| {
        s.spawn(|| {
            let ty = subarray(&sender, &[4, 6, 10], &[2, 3, 4], &[1, 2, 3]);
            unsafe { sender.send(source.as_ptr() as *const u8, 1, ty, 1, 11, WORLD) }.unwrap();
            sender.type_free(ty).unwrap();
        });
        s.spawn(|| {
            let ty = subarray(&receiver, &[3, 5, 8], &[2, 3, 4], &[1, 1, 2]);
            let status =
                unsafe { receiver.recv(dest.as_mut_ptr() as *mut u8, 1, ty, 0, 11, WORLD) }
                    .unwrap();
            assert_eq!(status.source, 0);
            assert_eq!(status.count_bytes, 24 * 8);
            receiver.type_free(ty).unwrap();
        });
    });

    for k in 0..2 {
        for j in 0..3 {
            for i in 0..4 {
                let got = dest[(k + 1) * 40 + (j + 1) * 8 + (i + 2)];
                let sent = source[(k + 1) * 60 + (j + 2) * 10 + (i + 3)];
                assert_eq!(got, sent, "element ({k},{j},{i})");
            }
        }
    }
    assert_eq!(dest.iter().filter(|v| **v < 0.0).count(), dest.len() - 24);

    (dest, [lib0, lib1], [sender, receiver])
}

#[test]
fn two_rank_subarray_exchange() {
    let (_, libs, interceptors) = exchange(config());
    for (lib, interceptor) in libs.iter().zip(&interceptors) {
        assert_eq!(interceptor.mode_name(), "active");
        assert_eq!(interceptor.stats().native, 1);
        assert_eq!(interceptor.stats().forwarded, 0);
        assert_eq!(lib.live_types(), 0);
    }
}

#[test]
fn bypass_forwards_calls_untouched() {
    let disabled = StrideConfig::builder().disable(true).build().unwrap();
    let (bypassed, libs, interceptors) = exchange(disabled);
    let (active, _, _) = exchange(config());
    assert_eq!(bypassed, active);

    for (lib, interceptor) in libs.iter().zip(&interceptors) {
        assert_eq!(interceptor.mode_name(), "bypass");
        assert_eq!(interceptor.stats().forwarded, 1);
        assert_eq!(interceptor.recorded_types(), 0);
        let stats = lib.stats();
        // exactly the application's own datatype, nothing substituted
        assert_eq!(stats.types_created, 1);
        assert_eq!(stats.types_freed, 1);
    }
    assert_eq!(libs[0].stats().bytes_sent, 24 * 8);
}

#[test]
fn native_handles_return_to_baseline() {
    let world = LoopbackWorld::new(1);
    let measuring = StrideConfig::builder()
        .measure(true)
        .measure_iterations(1usize)
        .build()
        .unwrap();
    let (lib, interceptor) = wrap(&world, 0, measuring);
    assert!(interceptor.is_active());
    // measurement built and released its own plans
    assert_eq!(lib.live_types(), 0);
    assert!(!interceptor.selector().unwrap().snapshot().is_empty());

    let byte = interceptor.named_type(NamedType::Byte);
    let row = interceptor.type_vector(6, 16, 64, byte).unwrap();
    let volume = interceptor.type_create_hvector(3, 1, 64 * 8, row).unwrap();
    interceptor.type_commit(volume).unwrap();

    let source: Vec<u8> = (0..64 * 8 * 3).map(|i| (i % 251) as u8).collect();
    for round in 0..3 {
        let mut dest = vec![0u8; source.len()];
        unsafe {
            interceptor.send(source.as_ptr(), 1, volume, 0, round, WORLD).unwrap();
            interceptor.recv(dest.as_mut_ptr(), 1, volume, 0, round, WORLD).unwrap();
        }
        for z in 0..3 {
            for y in 0..6 {
                let at = z * 512 + y * 64;
                assert_eq!(dest[at..at + 16], source[at..at + 16]);
            }
        }
    }

    interceptor.type_free(volume).unwrap();
    interceptor.type_free(row).unwrap();
    assert_eq!(lib.live_types(), 0);
    let stats = lib.stats();
    assert_eq!(stats.types_created, stats.types_freed);
}

#[test]
fn staged_irecv_completes_after_unpack() {
    // rows of 16 bytes out of 32, 64 of them
    let copy = dynamo_stride::Extent3::new(16, 64, 1);
    let alloc = dynamo_stride::Extent3::new(32, 64, 1);
    let class = classify(&copy, &alloc);
    assert_eq!(class, ShapeClass::Vector1D);

    let dir = tempfile::tempdir().unwrap();
    let staged = prefer_direct_copy(&dir, copy);
    let world = LoopbackWorld::new(1);
    let (lib, interceptor) = wrap(&world, 0, staged);

    let byte = interceptor.named_type(NamedType::Byte);
    let ty = interceptor.type_vector(64, 16, 32, byte).unwrap();
    interceptor.type_commit(ty).unwrap();

    let source: Vec<u8> = (0..alloc.product()).map(|i| (i * 3 % 256) as u8).collect();
    let mut dest = vec![0u8; alloc.product()];

    let mut recv = unsafe { interceptor.irecv(dest.as_mut_ptr(), 1, ty, 0, 5, WORLD) }.unwrap();
    assert_eq!(interceptor.pending_transfers(), 1);
    assert_eq!(interceptor.test(&mut recv).unwrap(), None);
    assert!(!recv.is_null());

    let mut send = unsafe { interceptor.isend(source.as_ptr(), 1, ty, 0, 5, WORLD) }.unwrap();
    assert_eq!(interceptor.pending_transfers(), 2);

    let status = loop {
        if let Some(status) = interceptor.test(&mut recv).unwrap() {
            break status;
        }
        std::thread::yield_now();
    };
    assert!(recv.is_null());
    assert_eq!(status.count_bytes, 1024);
    for y in 0..64 {
        let at = y * 32;
        assert_eq!(dest[at..at + 16], source[at..at + 16]);
        assert!(dest[at + 16..at + 32].iter().all(|b| *b == 0));
    }

    interceptor.wait(&mut send).unwrap();
    assert!(send.is_null());
    assert_eq!(interceptor.pending_transfers(), 0);

    let stats = interceptor.stats();
    assert_eq!(stats.staged, 2);
    assert_eq!(stats.native, 0);
    // staged plans carry no native datatype
    interceptor.type_free(ty).unwrap();
    assert_eq!(lib.live_types(), 0);
}

#[test]
fn truncated_staged_irecv_releases_staging() {
    let copy = dynamo_stride::Extent3::new(16, 64, 1);
    let dir = tempfile::tempdir().unwrap();
    let world = LoopbackWorld::new(1);
    let (lib, interceptor) = wrap(&world, 0, prefer_direct_copy(&dir, copy));

    let byte = interceptor.named_type(NamedType::Byte);
    let ty = interceptor.type_vector(64, 16, 32, byte).unwrap();
    interceptor.type_commit(ty).unwrap();

    let mut dest = vec![0u8; 32 * 64];
    let mut recv = unsafe { interceptor.irecv(dest.as_mut_ptr(), 1, ty, 0, 6, WORLD) }.unwrap();
    assert_eq!(interceptor.stats().staged, 1);

    let oversized = vec![1u8; 2048];
    unsafe { interceptor.send(oversized.as_ptr(), 2048, byte, 0, 6, WORLD) }.unwrap();

    let err = loop {
        match interceptor.test(&mut recv) {
            Ok(None) => std::thread::yield_now(),
            Ok(Some(status)) => panic!("oversized message completed: {status:?}"),
            Err(code) => break code,
        }
    };
    assert_eq!(err, dynamo_stride::ErrorCode::ERR_TRUNCATE);
    assert!(recv.is_null());
    assert_eq!(interceptor.pending_transfers(), 0);
    // nothing was scattered into the application buffer
    assert!(dest.iter().all(|b| *b == 0));

    interceptor.type_free(ty).unwrap();
    assert_eq!(lib.live_types(), 0);
}

#[cfg(not(feature = "cuda"))]
#[test]
fn device_contiguous_without_device_support_is_forwarded() {
    let world = LoopbackWorld::new(1);
    let lib = Arc::new(world.library(0));
    let topology = Arc::new(dynamo_stride::RegisteredTopology::new());
    let interceptor = Interceptor::new(lib.clone(), config()).with_topology(topology.clone());

    let source: Vec<u8> = (0..=255).collect();
    topology
        .register(source.as_ptr() as usize, source.len(), 0)
        .unwrap();
    let mut dest = vec![0u8; 256];
    let byte = interceptor.named_type(NamedType::Byte);
    unsafe {
        interceptor.send(source.as_ptr(), 256, byte, 0, 1, WORLD).unwrap();
        interceptor.recv(dest.as_mut_ptr(), 256, byte, 0, 1, WORLD).unwrap();
    }
    assert_eq!(dest, source);
    let stats = interceptor.stats();
    assert_eq!(stats.forwarded, 2);
    assert_eq!(stats.staged + stats.native, 0);
}

#[test]
fn multiple_instances_are_forwarded() {
    let world = LoopbackWorld::new(1);
    let (_lib, interceptor) = wrap(&world, 0, config());
    let int = interceptor.named_type(NamedType::Int);
    let ty = interceptor.type_vector(2, 1, 2, int).unwrap();
    interceptor.type_commit(ty).unwrap();

    let source = [1i32, 2, 3, 4, 5, 6, 7, 8];
    let mut dest = [0i32; 8];
    unsafe {
        interceptor.send(source.as_ptr() as *const u8, 2, ty, 0, 0, WORLD).unwrap();
        interceptor.recv(dest.as_mut_ptr() as *mut u8, 2, ty, 0, 0, WORLD).unwrap();
    }
    // vector(2,1,2) has extent 3 ints, so instances start at 0 and 3
    assert_eq!(dest, [1, 0, 3, 4, 0, 6, 0, 0]);
    assert_eq!(interceptor.stats().forwarded, 2);
}

#[test]
fn disable_from_environment() {
    temp_env::with_vars(
        vec![
            (env::DYN_STRIDE_DISABLE, Some("1")),
            (env::DYN_STRIDE_MEASURE, Some("0")),
        ],
        || {
            let lib = Arc::new(LoopbackWorld::new(1).library(0));
            let interceptor = Interceptor::from_settings(lib).unwrap();
            assert!(interceptor.config().disable);
            assert_eq!(interceptor.mode_name(), "bypass");
        },
    );
    temp_env::with_vars(
        vec![
            (env::DYN_STRIDE_DISABLE, Some("0")),
            (env::DYN_STRIDE_MEASURE, Some("0")),
        ],
        || {
            let lib = Arc::new(LoopbackWorld::new(1).library(0));
            let interceptor = Interceptor::from_settings(lib).unwrap();
            assert_eq!(interceptor.mode_name(), "active");
        },
    );
}
