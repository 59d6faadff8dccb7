// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Non-blocking transfers with work left after the library request completes.

use crate::engine::{CompletionSignal, MemoryHandle, PackEngine, PackedBuffer};
use crate::library::{ErrorCode, LibResult, MessageLibrary, RequestHandle, Status};
use crate::plan::PackPlan;
use dynamo_memory::{MemoryDescription, StagingBuffer};
use std::sync::Arc;

pub(crate) enum PendingKind {
    /// The library works on the application buffer or on `packed`; both must outlive it.
    Retained {
        _plan: Arc<PackPlan>,
        _packed: Option<PackedBuffer>,
    },
    /// Data lands in `staging` and is scattered into `region` afterwards.
    StagedRecv {
        plan: Arc<PackPlan>,
        staging: StagingBuffer,
        region: MemoryHandle,
        unpack: Option<CompletionSignal>,
    },
}

/// A request the interceptor still owns a piece of.
pub(crate) struct PendingTransfer {
    kind: PendingKind,
    received: Option<Status>,
}

impl PendingTransfer {
    pub(crate) fn new(kind: PendingKind) -> Self {
        Self {
            kind,
            received: None,
        }
    }

    /// Whether the library request has completed.
    pub(crate) fn request_done(&self) -> bool {
        self.received.is_some()
    }

    /// Advance the transfer. Returns the status once both the library request and any
    /// unpack are complete; `blocking` waits for both.
    ///
    /// The library sees a copy of the handle so the application's handle stays live until
    /// the unpack has finished.
    pub(crate) fn progress(
        &mut self,
        library: &dyn MessageLibrary,
        engine: &PackEngine,
        request: RequestHandle,
        blocking: bool,
    ) -> LibResult<Option<Status>> {
        let status = match self.received {
            Some(status) => status,
            None => {
                let mut handle = request;
                let status = if blocking {
                    library.wait(&mut handle)?
                } else {
                    match library.test(&mut handle)? {
                        Some(status) => status,
                        None => return Ok(None),
                    }
                };
                self.received = Some(status);
                status
            }
        };

        match &mut self.kind {
            PendingKind::Retained { .. } => Ok(Some(status)),
            PendingKind::StagedRecv {
                plan,
                staging,
                region,
                unpack,
            } => {
                if status.cancelled || !status.error.is_success() {
                    return Ok(Some(status));
                }
                if unpack.is_none() {
                    let packed = MemoryHandle {
                        addr: staging.addr(),
                        placement: staging.storage_kind().into(),
                    };
                    let signal = unsafe { engine.unpack(plan, packed, status.count_bytes, *region) }
                        .map_err(|e| {
                            tracing::error!("unpack of a received message failed: {e}");
                            e.error_code()
                        })?;
                    *unpack = Some(signal);
                }

                let done = if blocking {
                    match unpack.take() {
                        Some(signal) => signal.wait().map(|_| true),
                        None => Ok(true),
                    }
                } else {
                    match unpack.as_mut() {
                        Some(signal) => signal.is_complete(),
                        None => Ok(true),
                    }
                };
                let done = done.map_err(|e| {
                    tracing::error!("unpack of a received message failed: {e}");
                    ErrorCode::ERR_INTERN
                })?;
                Ok(done.then_some(status))
            }
        }
    }
}
