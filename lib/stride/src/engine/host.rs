// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host row-copy kernel.
//!
//! Rows are copied one `copy_nonoverlapping` each. Regions at or above the parallel
//! threshold are copied on the rayon pool and report completion through a oneshot channel;
//! smaller regions are copied inline.

use super::CompletionSignal;
use crate::layout::LayoutDescriptor;
use rayon::prelude::*;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Direction {
    /// Strided region to packed buffer.
    Gather,
    /// Packed buffer to strided region.
    Scatter,
}

/// Row length when every row has the same length.
fn uniform_row_len(descriptor: &LayoutDescriptor) -> Option<usize> {
    match descriptor {
        LayoutDescriptor::IndexedRows { rows, .. } => {
            let first = rows.first()?.len;
            rows.iter().all(|r| r.len == first).then_some(first)
        }
        _ => descriptor.row(0).map(|r| r.len),
    }
}

/// Copy row `index`, clipped to the first `limit` packed bytes.
///
/// # Safety
/// `region` and `packed` must be valid for the rows and packed bytes touched.
unsafe fn copy_row(
    direction: Direction,
    region: usize,
    packed: usize,
    region_offset: usize,
    packed_offset: usize,
    len: usize,
    limit: usize,
) {
    if packed_offset >= limit {
        return;
    }
    let len = len.min(limit - packed_offset);
    let region = (region + region_offset) as *mut u8;
    let packed = (packed + packed_offset) as *mut u8;
    unsafe {
        match direction {
            Direction::Gather => std::ptr::copy_nonoverlapping(region as *const u8, packed, len),
            Direction::Scatter => std::ptr::copy_nonoverlapping(packed as *const u8, region, len),
        }
    }
}

/// Copy rows between the strided region at `region` and the packed buffer at `packed`.
///
/// Only the first `limit` packed bytes take part; for a full transfer `limit` is the
/// descriptor's packed length.
///
/// # Safety
/// `region` must be valid over every row of the descriptor, `packed` for `limit` bytes, and
/// both must stay valid until the returned signal completes.
pub(crate) unsafe fn run(
    direction: Direction,
    descriptor: Arc<LayoutDescriptor>,
    region: usize,
    packed: usize,
    limit: usize,
    parallel_threshold: usize,
) -> CompletionSignal {
    let limit = limit.min(descriptor.packed_len());
    if limit == 0 {
        return CompletionSignal::completed();
    }

    match uniform_row_len(&descriptor) {
        Some(row_len) if limit >= parallel_threshold && descriptor.row_count() > 1 => {
            let (tx, rx) = oneshot::channel();
            rayon::spawn(move || {
                (0..descriptor.row_count()).into_par_iter().for_each(|i| {
                    if let Some(row) = descriptor.row(i) {
                        unsafe {
                            copy_row(direction, region, packed, row.offset, i * row_len, row.len, limit)
                        };
                    }
                });
                let _ = tx.send(Ok(()));
            });
            CompletionSignal::from_receiver(rx)
        }
        _ => {
            let mut packed_offset = 0;
            for row in descriptor.rows() {
                if packed_offset >= limit {
                    break;
                }
                unsafe {
                    copy_row(direction, region, packed, row.offset, packed_offset, row.len, limit)
                };
                packed_offset += row.len;
            }
            CompletionSignal::completed()
        }
    }
}
