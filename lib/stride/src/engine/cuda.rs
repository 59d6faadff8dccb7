// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device row-copy kernel: one asynchronous memcpy per row on a leased stream.

use super::host::Direction;
use super::notification::{CompletionSignal, CudaEventChecker};
use crate::layout::LayoutDescriptor;
use anyhow::Result;
use cudarc::driver::result as cuda_result;
use dynamo_memory::{StorageKind, StreamLease};

/// Copy rows between a device-resident region and a staging buffer.
///
/// `region` is a device address. `packed` may be host or device memory, as described by
/// `packed_kind`. Completion is signalled by an event recorded on the leased stream after
/// the last copy. If any copy fails to enqueue, the stream is drained before the error is
/// returned, so neither buffer is touched once this returns `Err`.
///
/// # Safety
/// Both sides must be valid for every row (and `limit` packed bytes) until the returned
/// signal completes.
pub(crate) unsafe fn run(
    direction: Direction,
    descriptor: &LayoutDescriptor,
    region: u64,
    packed: usize,
    packed_kind: StorageKind,
    limit: usize,
    lease: StreamLease,
) -> Result<CompletionSignal> {
    lease.context().bind_to_thread()?;

    let enqueued = unsafe {
        enqueue_rows(direction, descriptor, region, packed, packed_kind, limit, &lease)
    };
    let recorded = enqueued.and_then(|()| Ok(lease.record_event(None)?));
    match recorded {
        Ok(event) => Ok(CompletionSignal::from_checker(CudaEventChecker::new(
            event,
            Some(lease),
        ))),
        Err(e) => {
            // rows queued before the failure still read or write both buffers
            if let Err(sync) = lease.synchronize() {
                tracing::error!("failed to drain stream after a failed row copy: {sync:?}");
            }
            Err(e)
        }
    }
}

unsafe fn enqueue_rows(
    direction: Direction,
    descriptor: &LayoutDescriptor,
    region: u64,
    packed: usize,
    packed_kind: StorageKind,
    limit: usize,
    lease: &StreamLease,
) -> Result<()> {
    let limit = limit.min(descriptor.packed_len());
    let stream = lease.cu_stream();

    let mut packed_offset = 0usize;
    for row in descriptor.rows() {
        if packed_offset >= limit {
            break;
        }
        let len = row.len.min(limit - packed_offset);
        let device_row = region + row.offset as u64;
        let staged = packed + packed_offset;

        unsafe {
            match (direction, packed_kind.is_host()) {
                (Direction::Gather, true) => {
                    let dst = std::slice::from_raw_parts_mut(staged as *mut u8, len);
                    cuda_result::memcpy_dtoh_async(dst, device_row, stream)?;
                }
                (Direction::Scatter, true) => {
                    let src = std::slice::from_raw_parts(staged as *const u8, len);
                    cuda_result::memcpy_htod_async(device_row, src, stream)?;
                }
                (Direction::Gather, false) => {
                    cuda_result::memcpy_dtod_async(staged as u64, device_row, len, stream)?;
                }
                (Direction::Scatter, false) => {
                    cuda_result::memcpy_dtod_async(device_row, staged as u64, len, stream)?;
                }
            }
        }
        packed_offset += len;
    }
    Ok(())
}

#[cfg(all(test, feature = "testing-cuda"))]
mod tests {
    use super::*;
    use crate::extent::Extent3;
    use crate::layout::{self, StrategyId};
    use cudarc::driver::sys::{self, CUresult};
    use dynamo_memory::{MemoryDescription, StagingPool, StagingPoolConfig};

    #[test]
    fn test_failed_row_copy_drains_stream() {
        let pool = StagingPool::new(StagingPoolConfig::default()).unwrap();
        let device = pool.acquire(4096, StorageKind::Device(0)).unwrap();
        let mut host = vec![0u8; 2 * 4096];

        // the first plane is inside the allocation, the second one 4 GiB past it
        let descriptor = layout::build(
            StrategyId::DirectCopy,
            Extent3::new(4096, 1, 2),
            Extent3::new(4096, 1 << 20, 2),
            1,
        )
        .unwrap();

        let lease = pool.stream(0).unwrap();
        let stream = lease.cu_stream();
        let result = unsafe {
            run(
                Direction::Gather,
                &descriptor,
                device.addr() as u64,
                host.as_mut_ptr() as usize,
                StorageKind::System,
                descriptor.packed_len(),
                lease,
            )
        };
        assert!(result.is_err());

        // the stream is back on the free list with nothing in flight
        let again = pool.stream(0).unwrap();
        assert_eq!(again.cu_stream(), stream);
        assert_eq!(unsafe { sys::cuStreamQuery(stream) }, CUresult::CUDA_SUCCESS);
    }
}
