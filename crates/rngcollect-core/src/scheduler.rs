//! Collection session state machine.
//!
//! A [`Collector`] owns one entropy source from [`start`](Collector::start)
//! until the session ends, issues one read per sampling period through the
//! session's [`ReadWorker`], applies the source's retry policy and folds each
//! result into [`RunningStats`].
//!
//! ```text
//! Idle ──start──▶ Running ◀──resume── Paused
//!                   │  └────pause─────▲
//!                   ├──stop──▶ Stopped
//!                   ├──elapsed ≥ duration──▶ Completed
//!                   └──permanent error / retries exhausted──▶ Failed
//! ```
//!
//! Pause and stop are observed between ticks, while a read is awaited and
//! again before a completed read is committed; every transition bumps a generation counter so a read
//! that straddles one is discarded.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::sample::Sample;
use crate::source::{EntropySource, RetryPolicy, SourceError, release_or_warn};
use crate::sources::SourceDescriptor;
use crate::stats::{RunningStats, StatsError, StatsSnapshot};
use crate::worker::{ReadHandle, ReadWorker, SubmitError, WaitOutcome};

/// A read still pending after this many sampling periods counts as a transient failure.
pub const READ_TIMEOUT_PERIODS: u32 = 3;

/// How long stop waits for the worker to release its source.
pub const RELEASE_GRACE: Duration = Duration::from_secs(2);

/// Sleep granularity of [`Collector::run`].
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builds a fresh source for each run.
pub type SourceFactory = Arc<dyn Fn() -> Result<Box<dyn EntropySource>, SourceError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Status and configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    /// The run is over; only `start` may follow (and not after `Failed`).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Sampling parameters for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Bits per sample. Positive multiple of 8.
    pub sample_size_bits: usize,
    /// Time between samples. Positive.
    pub frequency: Duration,
    /// Target running time. Zero runs until stopped.
    pub duration: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            sample_size_bits: 2048,
            frequency: Duration::from_secs(1),
            duration: Duration::from_secs(60),
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), CollectError> {
        if self.sample_size_bits == 0 || self.sample_size_bits % 8 != 0 {
            return Err(CollectError::InvalidConfig(format!(
                "sample size {} bits is not a positive multiple of 8",
                self.sample_size_bits
            )));
        }
        if self.frequency.is_zero() {
            return Err(CollectError::InvalidConfig("frequency must be positive".into()));
        }
        Ok(())
    }

    /// How long a single read may take before it counts as failed.
    pub fn read_timeout(&self) -> Duration {
        self.frequency * READ_TIMEOUT_PERIODS
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("cannot {operation} a session that is {from}")]
    InvalidTransition {
        operation: &'static str,
        from: SessionStatus,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Read-only view of a session for presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub source_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub sample_count: u64,
    pub sample_size_bits: usize,
    pub frequency_secs: f64,
    pub target_duration_secs: f64,
    pub last_error: Option<String>,
    pub stats: StatsSnapshot,
}

/// Result of one [`Collector::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A sample was committed.
    Sampled(Sample),
    /// Target duration reached; the session is now `Completed`.
    Completed,
    /// The session is now `Failed` with this error.
    Failed(SourceError),
    /// The session changed state while the read was in flight; result dropped.
    Discarded,
    /// Not running; nothing to do.
    NotRunning,
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

struct Inner {
    status: SessionStatus,
    started_at: Option<DateTime<Utc>>,
    /// Start of the current running stretch.
    run_started: Option<Instant>,
    /// Running time before the current stretch.
    accumulated: Duration,
    next_due: Option<Instant>,
    last_timestamp: Option<DateTime<Utc>>,
    next_ticket: u64,
    generation: u64,
    stats: RunningStats,
    last_error: Option<String>,
    worker: Option<ReadWorker>,
    source_id: Option<String>,
    retry: RetryPolicy,
    subscribers: Vec<Sender<Sample>>,
}

impl Inner {
    fn elapsed(&self, now: Instant) -> Duration {
        self.accumulated + self.run_started.map_or(Duration::ZERO, |t| now.saturating_duration_since(t))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.status == SessionStatus::Running && self.generation == generation
    }

    /// Enter a terminal state. The caller shuts the returned worker down
    /// after dropping the lock.
    fn finish(&mut self, status: SessionStatus, now: Instant) -> Option<ReadWorker> {
        self.accumulated = self.elapsed(now);
        self.run_started = None;
        self.next_due = None;
        self.status = status;
        self.generation += 1;
        self.subscribers.clear();
        self.worker.take()
    }
}

struct Shared {
    inner: Mutex<Inner>,
    config: CollectorConfig,
    clock: Arc<dyn Clock>,
    factory: SourceFactory,
}

/// Drives one collection session at a time. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Collector {
    shared: Arc<Shared>,
}

impl Collector {
    pub fn new(factory: SourceFactory, config: CollectorConfig) -> Result<Self, CollectError> {
        Self::with_clock(factory, config, Arc::new(SystemClock))
    }

    pub fn for_descriptor(descriptor: SourceDescriptor, config: CollectorConfig) -> Result<Self, CollectError> {
        descriptor.params.validate(descriptor.kind)?;
        Self::new(Arc::new(move || descriptor.build()), config)
    }

    pub fn with_clock(
        factory: SourceFactory,
        config: CollectorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CollectError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    status: SessionStatus::Idle,
                    started_at: None,
                    run_started: None,
                    accumulated: Duration::ZERO,
                    next_due: None,
                    last_timestamp: None,
                    next_ticket: 0,
                    generation: 0,
                    stats: RunningStats::new(),
                    last_error: None,
                    worker: None,
                    source_id: None,
                    retry: RetryPolicy::IMMEDIATE,
                    subscribers: Vec::new(),
                }),
                config,
                clock,
                factory,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.shared.config
    }

    /// Receive every sample committed from now until the run ends. The
    /// channel disconnects when the session reaches a terminal state.
    pub fn subscribe(&self) -> Receiver<Sample> {
        let (tx, rx) = unbounded();
        self.lock().subscribers.push(tx);
        rx
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn stats(&self) -> RunningStats {
        self.lock().stats.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn elapsed(&self) -> Duration {
        let now = self.shared.clock.now();
        self.lock().elapsed(now)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let now = self.shared.clock.now();
        let inner = self.lock();
        let cfg = &self.shared.config;
        SessionSnapshot {
            status: inner.status,
            source_id: inner.source_id.clone(),
            started_at: inner.started_at,
            elapsed_secs: inner.elapsed(now).as_secs_f64(),
            sample_count: inner.stats.sample_count(),
            sample_size_bits: cfg.sample_size_bits,
            frequency_secs: cfg.frequency.as_secs_f64(),
            target_duration_secs: cfg.duration.as_secs_f64(),
            last_error: inner.last_error.clone(),
            stats: inner.stats.snapshot(),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Build a fresh source and begin sampling.
    pub fn start(&self) -> Result<(), CollectError> {
        let mut inner = self.lock();
        match inner.status {
            SessionStatus::Idle | SessionStatus::Stopped | SessionStatus::Completed => {}
            from => return Err(CollectError::InvalidTransition { operation: "start", from }),
        }

        let mut source = (self.shared.factory)()?;
        let id = source.id();
        if !source.is_available() {
            let reason = source
                .unavailable_reason()
                .unwrap_or_else(|| "availability probe failed".to_string());
            release_or_warn(source.as_mut());
            return Err(SourceError::unavailable(id, "start", reason).into());
        }
        let retry = source.retry_policy();
        let worker = ReadWorker::spawn(source)?;

        let now = self.shared.clock.now();
        inner.status = SessionStatus::Running;
        inner.started_at = Some(self.shared.clock.wall());
        inner.run_started = Some(now);
        inner.accumulated = Duration::ZERO;
        inner.next_due = Some(now);
        inner.last_timestamp = None;
        inner.generation += 1;
        inner.stats = RunningStats::new();
        inner.last_error = None;
        inner.worker = Some(worker);
        inner.source_id = Some(id.to_string());
        inner.retry = retry;

        let cfg = &self.shared.config;
        info!(
            "session started: source={id} bits={} frequency={:?} duration={:?}",
            cfg.sample_size_bits, cfg.frequency, cfg.duration
        );
        Ok(())
    }

    pub fn pause(&self) -> Result<(), CollectError> {
        let now = self.shared.clock.now();
        let mut inner = self.lock();
        if inner.status != SessionStatus::Running {
            return Err(CollectError::InvalidTransition {
                operation: "pause",
                from: inner.status,
            });
        }
        inner.accumulated = inner.elapsed(now);
        inner.run_started = None;
        inner.next_due = None;
        inner.status = SessionStatus::Paused;
        inner.generation += 1;
        info!("session paused after {:?}", inner.accumulated);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), CollectError> {
        let now = self.shared.clock.now();
        let mut inner = self.lock();
        if inner.status != SessionStatus::Paused {
            return Err(CollectError::InvalidTransition {
                operation: "resume",
                from: inner.status,
            });
        }
        inner.run_started = Some(now);
        inner.next_due = Some(now);
        inner.status = SessionStatus::Running;
        inner.generation += 1;
        info!("session resumed");
        Ok(())
    }

    /// End the run and release the source.
    pub fn stop(&self) -> Result<(), CollectError> {
        let now = self.shared.clock.now();
        let worker = {
            let mut inner = self.lock();
            if inner.status.is_terminal() {
                return Err(CollectError::InvalidTransition {
                    operation: "stop",
                    from: inner.status,
                });
            }
            info!("session stopped after {} samples", inner.stats.sample_count());
            inner.finish(SessionStatus::Stopped, now)
        };
        if let Some(w) = worker {
            w.shutdown(RELEASE_GRACE);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sampling
    // -----------------------------------------------------------------------

    /// Move to `Completed` if the target duration has been reached.
    pub fn complete_if_due(&self) -> bool {
        let duration = self.shared.config.duration;
        if duration.is_zero() {
            return false;
        }
        let now = self.shared.clock.now();
        let worker = {
            let mut inner = self.lock();
            if inner.status != SessionStatus::Running || inner.elapsed(now) < duration {
                return false;
            }
            info!("session completed: {} samples", inner.stats.sample_count());
            inner.finish(SessionStatus::Completed, now)
        };
        if let Some(w) = worker {
            w.shutdown(RELEASE_GRACE);
        }
        true
    }

    /// Take one sample now: check completion, read, retry, commit.
    pub fn tick(&self) -> Result<TickOutcome, CollectError> {
        if self.complete_if_due() {
            return Ok(TickOutcome::Completed);
        }

        let (handle, generation, retry, source_id) = {
            let inner = self.lock();
            if inner.status != SessionStatus::Running {
                return Ok(TickOutcome::NotRunning);
            }
            let Some(worker) = inner.worker.as_ref() else {
                return Ok(TickOutcome::NotRunning);
            };
            (
                worker.handle(),
                inner.generation,
                inner.retry,
                inner.source_id.clone().unwrap_or_default(),
            )
        };

        let bits = self.shared.config.sample_size_bits;
        let timeout = self.shared.config.read_timeout();
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.read_once(&handle, generation, bits, timeout) {
                WaitOutcome::Completed(Ok(bytes)) => return self.commit(generation, &source_id, &bytes),
                WaitOutcome::Completed(Err(e)) => e,
                WaitOutcome::Abandoned => {
                    debug!("{source_id}: session changed during read; result abandoned");
                    return Ok(TickOutcome::Discarded);
                }
                WaitOutcome::TimedOut => {
                    warn!("{source_id}: read exceeded {timeout:?}");
                    SourceError::transient(&source_id, "read", format!("no data within {timeout:?}"))
                }
                WaitOutcome::Disconnected => SourceError::device(&source_id, "read", "read worker exited"),
            };

            if !self.lock().is_current(generation) {
                debug!("{source_id}: session changed during read; dropping error: {err}");
                return Ok(TickOutcome::Discarded);
            }
            if err.is_transient() && attempt < max_attempts {
                debug!("{source_id}: transient failure (attempt {attempt}/{max_attempts}): {err}");
                continue;
            }
            return Ok(self.fail(generation, err));
        }
    }

    fn read_once(&self, handle: &ReadHandle, generation: u64, bits: usize, timeout: Duration) -> WaitOutcome {
        let ticket = {
            let mut inner = self.lock();
            inner.next_ticket += 1;
            inner.next_ticket
        };
        match handle.submit(ticket, bits) {
            Ok(()) => handle.wait(ticket, timeout, || self.lock().is_current(generation)),
            Err(SubmitError::Busy) => WaitOutcome::Completed(Err(SourceError::transient(
                "worker",
                "read",
                "previous read still queued",
            ))),
            Err(SubmitError::Disconnected) => WaitOutcome::Disconnected,
        }
    }

    fn commit(&self, generation: u64, source_id: &str, bytes: &[u8]) -> Result<TickOutcome, CollectError> {
        let mut inner = self.lock();
        if !inner.is_current(generation) {
            debug!("{source_id}: discarding read completed while {}", inner.status);
            return Ok(TickOutcome::Discarded);
        }

        let mut timestamp = self.shared.clock.wall();
        if let Some(prev) = inner.last_timestamp {
            timestamp = timestamp.max(prev);
        }
        let sample = Sample::from_bytes(inner.stats.last_sequence() + 1, timestamp, source_id, bytes);
        if let Err(e) = inner.stats.update(&sample) {
            inner.last_error = Some(e.to_string());
            let worker = inner.finish(SessionStatus::Failed, self.shared.clock.now());
            drop(inner);
            if let Some(w) = worker {
                w.shutdown(RELEASE_GRACE);
            }
            return Err(e.into());
        }
        inner.last_timestamp = Some(timestamp);
        inner.subscribers.retain(|tx| tx.send(sample.clone()).is_ok());
        debug!(
            "{source_id}: sample {} ones={}/{}",
            sample.sequence_number, sample.ones_count, sample.bit_count
        );
        Ok(TickOutcome::Sampled(sample))
    }

    fn fail(&self, generation: u64, err: SourceError) -> TickOutcome {
        let now = self.shared.clock.now();
        let worker = {
            let mut inner = self.lock();
            if !inner.is_current(generation) {
                return TickOutcome::Discarded;
            }
            warn!("session failed: {err}");
            inner.last_error = Some(err.to_string());
            inner.finish(SessionStatus::Failed, now)
        };
        if let Some(w) = worker {
            w.shutdown(RELEASE_GRACE);
        }
        TickOutcome::Failed(err)
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    /// Sample every `frequency` until the session leaves `Running`/`Paused`.
    pub fn run(&self) {
        let frequency = self.shared.config.frequency;
        loop {
            let (status, due) = {
                let inner = self.lock();
                (inner.status, inner.next_due)
            };
            match status {
                SessionStatus::Running => {
                    if self.complete_if_due() {
                        break;
                    }
                    let now = self.shared.clock.now();
                    match due {
                        Some(due) if now >= due => {
                            if let Err(e) = self.tick() {
                                warn!("{e}");
                            }
                            let mut inner = self.lock();
                            if inner.next_due == Some(due) {
                                let after = self.shared.clock.now();
                                inner.next_due = Some((due + frequency).max(after));
                            }
                        }
                        Some(due) => std::thread::sleep((due - now).min(POLL_INTERVAL)),
                        None => std::thread::sleep(POLL_INTERVAL),
                    }
                }
                SessionStatus::Paused => std::thread::sleep(POLL_INTERVAL),
                _ => break,
            }
        }
    }

    /// Run the driver on a background thread.
    pub fn spawn(&self) -> Result<JoinHandle<()>, CollectError> {
        let this = self.clone();
        Ok(std::thread::Builder::new()
            .name("rngcollect-scheduler".into())
            .spawn(move || this.run())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::source::{SourceInfo, Transport};
    use std::sync::atomic::{AtomicU32, Ordering};

    static INFO: SourceInfo = SourceInfo {
        id: "fake",
        name: "Fake",
        description: "scripted test source",
        transport: Transport::Software,
        supports_fold: false,
    };

    #[derive(Default)]
    struct Counters {
        built: AtomicU32,
        reads: AtomicU32,
        releases: AtomicU32,
    }

    struct Fake {
        counters: Arc<Counters>,
        available: bool,
        fail_first: u32,
        transient: bool,
        retry: u32,
        delay: Duration,
    }

    impl EntropySource for Fake {
        fn info(&self) -> &SourceInfo {
            &INFO
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn collect(&mut self, n: usize) -> Result<Vec<u8>, SourceError> {
            let i = self.counters.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if i < self.fail_first {
                return Err(if self.transient {
                    SourceError::transient("fake", "read", "busy")
                } else {
                    SourceError::device("fake", "read", "unplugged")
                });
            }
            Ok(vec![0x0F; n])
        }
        fn release(&mut self) -> Result<(), SourceError> {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy {
                max_attempts: self.retry,
            }
        }
    }

    fn factory(counters: &Arc<Counters>, available: bool, fail_first: u32, transient: bool, retry: u32) -> SourceFactory {
        let counters = Arc::clone(counters);
        Arc::new(move || {
            counters.built.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Fake {
                counters: Arc::clone(&counters),
                available,
                fail_first,
                transient,
                retry,
                delay: Duration::ZERO,
            }) as Box<dyn EntropySource>)
        })
    }

    fn slow_factory(counters: &Arc<Counters>, delay: Duration, retry: u32) -> SourceFactory {
        let counters = Arc::clone(counters);
        Arc::new(move || {
            counters.built.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Fake {
                counters: Arc::clone(&counters),
                available: true,
                fail_first: 0,
                transient: false,
                retry,
                delay,
            }) as Box<dyn EntropySource>)
        })
    }

    fn config(duration_secs: u64) -> CollectorConfig {
        CollectorConfig {
            sample_size_bits: 64,
            frequency: Duration::from_secs(1),
            duration: Duration::from_secs(duration_secs),
        }
    }

    fn collector(f: SourceFactory, cfg: CollectorConfig) -> (Collector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let c = Collector::with_clock(f, cfg, clock.clone()).unwrap();
        (c, clock)
    }

    #[test]
    fn invalid_config_rejected() {
        let counters = Arc::new(Counters::default());
        let mut cfg = config(5);
        cfg.sample_size_bits = 12;
        assert!(matches!(
            Collector::new(factory(&counters, true, 0, false, 1), cfg),
            Err(CollectError::InvalidConfig(_))
        ));
        let mut cfg = config(5);
        cfg.frequency = Duration::ZERO;
        assert!(Collector::new(factory(&counters, true, 0, false, 1), cfg).is_err());
    }

    #[test]
    fn pause_resume_from_idle_rejected() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(factory(&counters, true, 0, false, 1), config(5));
        assert!(matches!(
            c.pause(),
            Err(CollectError::InvalidTransition {
                operation: "pause",
                from: SessionStatus::Idle
            })
        ));
        assert!(c.resume().is_err());
        assert_eq!(c.status(), SessionStatus::Idle);
    }

    #[test]
    fn start_twice_rejected() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(factory(&counters, true, 0, false, 1), config(5));
        c.start().unwrap();
        assert!(matches!(c.start(), Err(CollectError::InvalidTransition { .. })));
        c.stop().unwrap();
    }

    #[test]
    fn unavailable_source_refuses_start() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(factory(&counters, false, 0, false, 1), config(5));
        assert!(matches!(
            c.start(),
            Err(CollectError::Source(SourceError::DeviceUnavailable { .. }))
        ));
        assert_eq!(c.status(), SessionStatus::Idle);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_stop_releases_once() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(factory(&counters, true, 0, false, 1), config(5));
        c.start().unwrap();
        c.stop().unwrap();
        assert_eq!(c.status(), SessionStatus::Stopped);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert!(matches!(c.stop(), Err(CollectError::InvalidTransition { .. })));
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_from_idle_is_allowed() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(factory(&counters, true, 0, false, 1), config(5));
        c.stop().unwrap();
        assert_eq!(c.status(), SessionStatus::Stopped);
        assert_eq!(counters.built.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restart_builds_fresh_source_and_resets() {
        let counters = Arc::new(Counters::default());
        let (c, clock) = collector(factory(&counters, true, 0, false, 1), config(0));
        c.start().unwrap();
        assert!(matches!(c.tick().unwrap(), TickOutcome::Sampled(_)));
        clock.advance(Duration::from_secs(1));
        c.stop().unwrap();
        c.start().unwrap();
        assert_eq!(counters.built.load(Ordering::SeqCst), 2);
        let snap = c.snapshot();
        assert_eq!(snap.sample_count, 0);
        assert_eq!(snap.elapsed_secs, 0.0);
        match c.tick().unwrap() {
            TickOutcome::Sampled(s) => assert_eq!(s.sequence_number, 1),
            other => panic!("unexpected {other:?}"),
        }
        c.stop().unwrap();
    }

    #[test]
    fn pause_excludes_time_and_keeps_samples() {
        let counters = Arc::new(Counters::default());
        let (c, clock) = collector(factory(&counters, true, 0, false, 1), config(0));
        c.start().unwrap();
        c.tick().unwrap();
        clock.advance(Duration::from_secs(2));
        c.pause().unwrap();
        assert_eq!(c.tick().unwrap(), TickOutcome::NotRunning);
        clock.advance(Duration::from_secs(10));
        c.resume().unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(c.elapsed(), Duration::from_secs(3));
        assert_eq!(c.snapshot().sample_count, 1);
        match c.tick().unwrap() {
            TickOutcome::Sampled(s) => assert_eq!(s.sequence_number, 2),
            other => panic!("unexpected {other:?}"),
        }
        c.stop().unwrap();
    }

    #[test]
    fn completes_at_duration() {
        let counters = Arc::new(Counters::default());
        let (c, clock) = collector(factory(&counters, true, 0, false, 1), config(2));
        c.start().unwrap();
        assert!(matches!(c.tick().unwrap(), TickOutcome::Sampled(_)));
        clock.advance(Duration::from_secs(1));
        assert!(matches!(c.tick().unwrap(), TickOutcome::Sampled(_)));
        clock.advance(Duration::from_secs(1));
        assert_eq!(c.tick().unwrap(), TickOutcome::Completed);
        assert_eq!(c.status(), SessionStatus::Completed);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(c.snapshot().sample_count, 2);
    }

    #[test]
    fn transient_failures_retry_without_sequence_gap() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(factory(&counters, true, 2, true, 3), config(0));
        c.start().unwrap();
        match c.tick().unwrap() {
            TickOutcome::Sampled(s) => assert_eq!(s.sequence_number, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(counters.reads.load(Ordering::SeqCst), 3);
        assert_eq!(c.status(), SessionStatus::Running);
        c.stop().unwrap();
    }

    #[test]
    fn retry_budget_exhausted_fails() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(factory(&counters, true, 3, true, 3), config(0));
        c.start().unwrap();
        assert!(matches!(c.tick().unwrap(), TickOutcome::Failed(_)));
        assert_eq!(c.status(), SessionStatus::Failed);
        assert!(c.last_error().is_some());
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert!(matches!(c.start(), Err(CollectError::InvalidTransition { .. })));
    }

    #[test]
    fn permanent_error_fails_immediately() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(factory(&counters, true, 1, false, 3), config(0));
        c.start().unwrap();
        assert!(matches!(c.tick().unwrap(), TickOutcome::Failed(_)));
        assert_eq!(counters.reads.load(Ordering::SeqCst), 1);
        assert_eq!(c.status(), SessionStatus::Failed);
    }

    #[test]
    fn subscribers_see_samples_then_disconnect() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(factory(&counters, true, 0, false, 1), config(0));
        let rx = c.subscribe();
        c.start().unwrap();
        c.tick().unwrap();
        c.tick().unwrap();
        c.stop().unwrap();
        let seqs: Vec<u64> = rx.iter().map(|s| s.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let counters = Arc::new(Counters::default());
        let (c, clock) = collector(factory(&counters, true, 0, false, 1), config(0));
        c.start().unwrap();
        let mut last = None;
        for _ in 0..5 {
            if let TickOutcome::Sampled(s) = c.tick().unwrap() {
                if let Some(prev) = last {
                    assert!(s.timestamp >= prev);
                }
                last = Some(s.timestamp);
            }
            clock.advance(Duration::from_millis(300));
        }
        c.stop().unwrap();
    }

    #[test]
    fn stop_during_read_discards_result() {
        let counters = Arc::new(Counters::default());
        let (c, _) = collector(slow_factory(&counters, Duration::from_millis(300), 1), config(0));
        c.start().unwrap();
        let ticker = c.clone();
        let pending = std::thread::spawn(move || ticker.tick().unwrap());
        std::thread::sleep(Duration::from_millis(50));
        c.stop().unwrap();
        assert_eq!(pending.join().unwrap(), TickOutcome::Discarded);
        assert_eq!(c.snapshot().sample_count, 0);
        assert_eq!(c.status(), SessionStatus::Stopped);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_past_timeout_exhausts_retries_and_fails() {
        let counters = Arc::new(Counters::default());
        let cfg = CollectorConfig {
            sample_size_bits: 64,
            frequency: Duration::from_millis(10),
            duration: Duration::ZERO,
        };
        let (c, _) = collector(slow_factory(&counters, Duration::from_millis(200), 3), cfg);
        c.start().unwrap();
        match c.tick().unwrap() {
            TickOutcome::Failed(e) => assert!(e.is_transient()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.status(), SessionStatus::Failed);
        assert_eq!(c.snapshot().sample_count, 0);
        assert!(c.last_error().is_some());
    }

    #[test]
    fn hung_read_does_not_hold_driver_after_stop() {
        let counters = Arc::new(Counters::default());
        let cfg = CollectorConfig {
            sample_size_bits: 64,
            frequency: Duration::from_secs(2),
            duration: Duration::ZERO,
        };
        let delay = RELEASE_GRACE + Duration::from_secs(2);
        let c = Collector::new(slow_factory(&counters, delay, 1), cfg).unwrap();
        c.start().unwrap();
        let driver = c.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let begin = Instant::now();
        c.stop().unwrap();
        assert!(begin.elapsed() < RELEASE_GRACE + Duration::from_millis(500));
        let stopped = Instant::now();
        driver.join().unwrap();
        assert!(stopped.elapsed() < Duration::from_millis(200));
        assert_eq!(c.status(), SessionStatus::Stopped);
        assert_eq!(c.snapshot().sample_count, 0);
    }
}
