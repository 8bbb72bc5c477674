//! Per-session read worker.
//!
//! The worker thread owns the session's [`EntropySource`] so a hung device
//! read never blocks the control surface. Requests travel over a channel of
//! capacity one; every request carries a ticket and its result is tagged with
//! the same ticket, so a caller that gave up on a slow read can recognize and
//! drop the late result.
//!
//! The source is released exactly once, by the worker, when it exits.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use log::{debug, warn};

use crate::source::{EntropySource, SourceError};

/// How often an idle worker checks for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How often a waiting caller re-checks whether it still wants the result.
pub const WAIT_SLICE: Duration = Duration::from_millis(10);

struct ReadRequest {
    ticket: u64,
    bits: usize,
}

struct ReadOutcome {
    ticket: u64,
    result: Result<Vec<u8>, SourceError>,
}

/// What came back while waiting for a ticket.
#[derive(Debug)]
pub enum WaitOutcome {
    Completed(Result<Vec<u8>, SourceError>),
    TimedOut,
    Disconnected,
    /// The caller stopped wanting the result before it arrived.
    Abandoned,
}

/// Why a request could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// A previous request is still queued.
    Busy,
    /// The worker has exited.
    Disconnected,
}

/// Cloneable request/response endpoints of a worker.
#[derive(Clone)]
pub struct ReadHandle {
    requests: Sender<ReadRequest>,
    results: Receiver<ReadOutcome>,
}

impl ReadHandle {
    /// Queue a read of `bits` bits tagged with `ticket`.
    pub fn submit(&self, ticket: u64, bits: usize) -> Result<(), SubmitError> {
        match self.requests.try_send(ReadRequest { ticket, bits }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SubmitError::Busy),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::Disconnected),
        }
    }

    /// Wait up to `timeout` for the result of `ticket`, dropping results for
    /// any other ticket. `still_wanted` is polled every [`WAIT_SLICE`]; once it
    /// returns `false` the wait ends with [`WaitOutcome::Abandoned`].
    pub fn wait(&self, ticket: u64, timeout: Duration, mut still_wanted: impl FnMut() -> bool) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if !still_wanted() {
                return WaitOutcome::Abandoned;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }
            match self.results.recv_timeout(remaining.min(WAIT_SLICE)) {
                Ok(outcome) if outcome.ticket == ticket => return WaitOutcome::Completed(outcome.result),
                Ok(outcome) => {
                    debug!("discarding stale read result (ticket {}, awaiting {ticket})", outcome.ticket);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return WaitOutcome::Disconnected,
            }
        }
    }
}

/// A running read worker.
pub struct ReadWorker {
    handle: ReadHandle,
    cancelled: Arc<AtomicBool>,
    released: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl ReadWorker {
    /// Move `source` onto a new worker thread.
    pub fn spawn(source: Box<dyn EntropySource>) -> std::io::Result<Self> {
        let (req_tx, req_rx) = bounded::<ReadRequest>(1);
        let (res_tx, res_rx) = unbounded::<ReadOutcome>();
        let (ack_tx, ack_rx) = bounded::<()>(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&cancelled);
        let thread = std::thread::Builder::new()
            .name(format!("rngcollect-read-{}", source.id()))
            .spawn(move || worker_loop(source, req_rx, res_tx, flag, ack_tx))?;

        Ok(Self {
            handle: ReadHandle {
                requests: req_tx,
                results: res_rx,
            },
            cancelled,
            released: ack_rx,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ReadHandle {
        self.handle.clone()
    }

    /// Cancel the worker and wait up to `grace` for it to release its source.
    ///
    /// Returns `false` when the worker is still stuck in a device read; it is
    /// then detached and releases the source whenever that read returns.
    pub fn shutdown(mut self, grace: Duration) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        match self.released.recv_timeout(grace) {
            Ok(()) => {
                if let Some(t) = self.thread.take() {
                    let _ = t.join();
                }
                true
            }
            Err(_) => {
                warn!("read worker did not exit within {grace:?}; detaching");
                self.thread.take();
                false
            }
        }
    }
}

impl Drop for ReadWorker {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn worker_loop(
    mut source: Box<dyn EntropySource>,
    requests: Receiver<ReadRequest>,
    results: Sender<ReadOutcome>,
    cancelled: Arc<AtomicBool>,
    released: Sender<()>,
) {
    let id = source.id();
    while !cancelled.load(Ordering::SeqCst) {
        let req = match requests.recv_timeout(POLL_INTERVAL) {
            Ok(req) => req,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let result = catch_unwind(AssertUnwindSafe(|| source.generate_exact_bits(req.bits)))
            .unwrap_or_else(|_| Err(SourceError::device(id, "read", "source panicked during read")));
        if cancelled.load(Ordering::SeqCst) {
            debug!("{id}: dropping read completed after cancellation");
            break;
        }
        if results
            .send(ReadOutcome {
                ticket: req.ticket,
                result,
            })
            .is_err()
        {
            break;
        }
    }

    match source.release() {
        Ok(()) => debug!("{id}: source released"),
        Err(e) => warn!("{e}"),
    }
    let _ = released.send(());
}
