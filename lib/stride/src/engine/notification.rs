// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pack/unpack completion signals.

use anyhow::Result;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Polling-based completion check for asynchronous work.
pub trait CompletionChecker: Send {
    /// Returns true if the work is complete, false if still pending.
    fn is_complete(&self) -> Result<bool>;

    /// Block until the work is complete.
    fn wait(&self) -> Result<()> {
        while !self.is_complete()? {
            std::thread::yield_now();
        }
        Ok(())
    }
}

enum SignalState {
    Done,
    Channel(oneshot::Receiver<Result<()>>),
    Checker(Box<dyn CompletionChecker>),
}

/// Handle for an in-progress pack or unpack.
///
/// Synchronous work returns an already completed signal. Work running on the rayon pool
/// reports through a oneshot channel; device work is observed through a
/// [`CompletionChecker`] wrapping a recorded event.
pub struct CompletionSignal {
    state: SignalState,
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            SignalState::Done => "done",
            SignalState::Channel(_) => "channel",
            SignalState::Checker(_) => "checker",
        };
        f.debug_struct("CompletionSignal").field("state", &state).finish()
    }
}

impl CompletionSignal {
    /// A signal for work that already finished.
    pub fn completed() -> Self {
        Self {
            state: SignalState::Done,
        }
    }

    pub fn from_receiver(status: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            state: SignalState::Channel(status),
        }
    }

    pub fn from_checker(checker: impl CompletionChecker + 'static) -> Self {
        Self {
            state: SignalState::Checker(Box::new(checker)),
        }
    }

    /// Non-blocking completion check. Once this returns `Ok(true)` it keeps doing so.
    pub fn is_complete(&mut self) -> Result<bool> {
        let done = match &mut self.state {
            SignalState::Done => return Ok(true),
            SignalState::Channel(status) => match status.try_recv() {
                Ok(result) => {
                    result?;
                    true
                }
                Err(oneshot::error::TryRecvError::Empty) => false,
                Err(oneshot::error::TryRecvError::Closed) => {
                    anyhow::bail!("pack worker dropped before completion")
                }
            },
            SignalState::Checker(checker) => checker.is_complete()?,
        };
        if done {
            self.state = SignalState::Done;
        }
        Ok(done)
    }

    /// Wait for the work to complete (blocking).
    pub fn wait(self) -> Result<()> {
        match self.state {
            SignalState::Done => Ok(()),
            SignalState::Channel(status) => status
                .blocking_recv()
                .map_err(|_| anyhow::anyhow!("pack worker dropped before completion"))?,
            SignalState::Checker(checker) => checker.wait(),
        }
    }
}

impl std::future::Future for CompletionSignal {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            SignalState::Done => Poll::Ready(Ok(())),
            SignalState::Channel(status) => Pin::new(status).poll(cx).map(|result| {
                result
                    .map_err(|_| anyhow::anyhow!("pack worker dropped before completion"))
                    .and_then(|r| r)
            }),
            SignalState::Checker(_) => match self.is_complete() {
                Ok(true) => Poll::Ready(Ok(())),
                Ok(false) => {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }
}

/// Completion checker that polls a recorded CUDA event.
///
/// The stream lease that ordered the work is held until the checker is dropped, so the
/// stream is not reused while the event is outstanding.
#[cfg(feature = "cuda")]
pub struct CudaEventChecker {
    event: cudarc::driver::CudaEvent,
    _lease: Option<dynamo_memory::StreamLease>,
}

#[cfg(feature = "cuda")]
impl CudaEventChecker {
    pub fn new(event: cudarc::driver::CudaEvent, lease: Option<dynamo_memory::StreamLease>) -> Self {
        Self {
            event,
            _lease: lease,
        }
    }
}

#[cfg(feature = "cuda")]
impl CompletionChecker for CudaEventChecker {
    fn is_complete(&self) -> Result<bool> {
        use cudarc::driver::{DriverError, result as cuda_result, sys::CUresult};
        unsafe {
            match cuda_result::event::query(self.event.cu_event()) {
                Ok(()) => Ok(true),
                Err(DriverError(CUresult::CUDA_ERROR_NOT_READY)) => Ok(false),
                Err(e) => Err(anyhow::anyhow!("CUDA event query failed: {:?}", e)),
            }
        }
    }

    fn wait(&self) -> Result<()> {
        self.event.synchronize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Countdown(Arc<AtomicUsize>);

    impl CompletionChecker for Countdown {
        fn is_complete(&self) -> Result<bool> {
            let left = self.0.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(true);
            }
            self.0.store(left - 1, Ordering::SeqCst);
            Ok(false)
        }
    }

    #[test]
    fn test_completed_signal() {
        let mut signal = CompletionSignal::completed();
        assert!(signal.is_complete().unwrap());
        signal.wait().unwrap();
    }

    #[test]
    fn test_channel_signal() {
        let (tx, rx) = oneshot::channel();
        let mut signal = CompletionSignal::from_receiver(rx);
        assert!(!signal.is_complete().unwrap());
        tx.send(Ok(())).unwrap();
        assert!(signal.is_complete().unwrap());
        assert!(signal.is_complete().unwrap());
    }

    #[test]
    fn test_dropped_sender_is_an_error() {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        drop(tx);
        assert!(CompletionSignal::from_receiver(rx).wait().is_err());
    }

    #[test]
    fn test_checker_signal() {
        let mut signal = CompletionSignal::from_checker(Countdown(Arc::new(AtomicUsize::new(2))));
        assert!(!signal.is_complete().unwrap());
        assert!(!signal.is_complete().unwrap());
        assert!(signal.is_complete().unwrap());

        let signal = CompletionSignal::from_checker(Countdown(Arc::new(AtomicUsize::new(5))));
        signal.wait().unwrap();
    }
}
