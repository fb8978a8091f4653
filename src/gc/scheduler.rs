//! Background scheduling of garbage-collection passes.
//!
//! One tokio task owns the [`Collector`] and runs passes strictly one at a
//! time. Callers talk to it over a channel:
//!
//! - [`GcScheduler::schedule_and_wait`] requests a pass and waits for its
//!   result. A request that arrives while a pass is running is answered by
//!   the *next* pass, so a caller always observes a pass that began after
//!   its request.
//! - [`GcScheduler::hook`] returns the mutation callback the metadata store
//!   invokes after each committed write. Mutations are counted and, once a
//!   threshold is crossed, a background pass is armed.
//!
//! Background passes are spaced so that collection time stays under
//! `pause_threshold` of wall time. Explicit requests ignore that spacing.
//! A failed pass is retried in the background with exponential backoff.

use crate::constants::{
    DEFAULT_GC_DELETION_THRESHOLD, DEFAULT_GC_MUTATION_THRESHOLD, DEFAULT_GC_PAUSE_THRESHOLD,
    DEFAULT_GC_SCHEDULE_DELAY, DEFAULT_GC_STARTUP_DELAY,
};
use crate::error::{Error, Result};
use crate::metadata::MutationHook;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info};

/// Delay before retrying after the first failed pass; doubles per failure.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Delay before retrying after `failures` consecutive failed passes.
fn retry_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    RETRY_DELAY.saturating_mul(1 << exponent).min(MAX_RETRY_DELAY)
}

// =============================================================================
// Collector
// =============================================================================

/// Summary of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Leases removed.
    pub leases: usize,
    /// Content records removed.
    pub content: usize,
    /// Snapshot records removed.
    pub snapshots: usize,
    /// Images removed.
    pub images: usize,
    /// Wall time of the pass.
    pub elapsed: Duration,
}

impl GcStats {
    /// Wall time of the pass.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Total number of records removed.
    pub fn removed(&self) -> usize {
        self.leases + self.content + self.snapshots + self.images
    }
}

/// Something that can run a full collection pass.
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Runs one mark-and-sweep pass.
    async fn garbage_collect(&self) -> Result<GcStats>;
}

// =============================================================================
// Configuration
// =============================================================================

/// Scheduling policy for background passes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Maximum fraction of wall time spent collecting. Values outside
    /// `(0, 1)` disable pass spacing.
    pub pause_threshold: f64,

    /// Deletions that force a pass. Zero schedules a pass after any deletion.
    pub deletion_threshold: u64,

    /// Mutations that schedule a pass. Zero disables mutation-driven passes.
    pub mutation_threshold: u64,

    /// Delay between a threshold being crossed and the pass starting.
    pub schedule_delay: Duration,

    /// Delay before the first pass after start. Zero skips the startup pass.
    pub startup_delay: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            pause_threshold: DEFAULT_GC_PAUSE_THRESHOLD,
            deletion_threshold: DEFAULT_GC_DELETION_THRESHOLD,
            mutation_threshold: DEFAULT_GC_MUTATION_THRESHOLD,
            schedule_delay: DEFAULT_GC_SCHEDULE_DELAY,
            startup_delay: DEFAULT_GC_STARTUP_DELAY,
        }
    }
}

impl GcConfig {
    /// Sets the pause threshold.
    #[must_use]
    pub fn with_pause_threshold(mut self, threshold: f64) -> Self {
        self.pause_threshold = threshold;
        self
    }

    /// Sets the deletion threshold.
    #[must_use]
    pub fn with_deletion_threshold(mut self, threshold: u64) -> Self {
        self.deletion_threshold = threshold;
        self
    }

    /// Sets the mutation threshold.
    #[must_use]
    pub fn with_mutation_threshold(mut self, threshold: u64) -> Self {
        self.mutation_threshold = threshold;
        self
    }

    /// Sets the schedule delay.
    #[must_use]
    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule_delay = delay;
        self
    }

    /// Sets the startup delay.
    #[must_use]
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Minimum gap after a pass that took `last`, keeping collection under
    /// `pause_threshold` of wall time.
    fn pause_interval(&self, last: Duration) -> Duration {
        if self.pause_threshold <= 0.0 || self.pause_threshold >= 1.0 {
            return Duration::ZERO;
        }
        last.div_f64(self.pause_threshold).saturating_sub(last)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

type Waiter = oneshot::Sender<Result<GcStats>>;

enum Request {
    Schedule(Option<Waiter>),
    Mutation { dirty: bool },
    Stop,
}

/// Handle to the background collection task.
pub struct GcScheduler {
    tx: mpsc::UnboundedSender<Request>,
    collections: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GcScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcScheduler")
            .field("collections", &self.collections())
            .finish_non_exhaustive()
    }
}

impl GcScheduler {
    /// Spawns the scheduler loop on the current tokio runtime.
    pub fn start(collector: Arc<dyn Collector>, config: GcConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let collections = Arc::new(AtomicU64::new(0));

        info!(
            pause_threshold = config.pause_threshold,
            deletion_threshold = config.deletion_threshold,
            mutation_threshold = config.mutation_threshold,
            "starting gc scheduler"
        );

        let state = LoopState {
            collector,
            config,
            collections: Arc::clone(&collections),
        };
        let handle = tokio::spawn(state.run(rx));

        Self {
            tx,
            collections,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Requests a pass and waits for its result.
    ///
    /// The pass that answers began after this call.
    pub async fn schedule_and_wait(&self) -> Result<GcStats> {
        let (waiter, result) = oneshot::channel();
        self.tx
            .send(Request::Schedule(Some(waiter)))
            .map_err(|_| Error::Unavailable("gc scheduler stopped".to_string()))?;
        result
            .await
            .map_err(|_| Error::Unavailable("gc scheduler stopped".to_string()))?
    }

    /// Requests a pass without waiting for it.
    pub fn schedule(&self) {
        let _ = self.tx.send(Request::Schedule(None));
    }

    /// Returns the mutation callback for the metadata store.
    pub fn hook(&self) -> MutationHook {
        let tx = self.tx.clone();
        Arc::new(move |dirty| {
            let _ = tx.send(Request::Mutation { dirty });
        })
    }

    /// Number of completed passes, successful or not.
    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    /// Stops the background task and waits for it to exit.
    ///
    /// Pending waiters receive `Unavailable`.
    pub async fn stop(&self) {
        let _ = self.tx.send(Request::Stop);
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for GcScheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Stop);
    }
}

struct LoopState {
    collector: Arc<dyn Collector>,
    config: GcConfig,
    collections: Arc<AtomicU64>,
}

impl LoopState {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Request>) {
        let mut next: Option<Instant> = None;
        let mut waiters: Vec<Waiter> = Vec::new();
        let mut triggered = false;
        let mut deletions: u64 = 0;
        let mut mutations: u64 = 0;
        let mut last: Option<(Instant, Duration)> = None;
        let mut failures: u32 = 0;

        if !self.config.startup_delay.is_zero() {
            next = Some(Instant::now() + self.config.startup_delay);
        }

        loop {
            let deadline = next;
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                () = timer => {}
                request = rx.recv() => {
                    match request {
                        None | Some(Request::Stop) => break,
                        Some(Request::Schedule(waiter)) => {
                            waiters.extend(waiter);
                            triggered = true;
                        }
                        Some(Request::Mutation { dirty }) => {
                            mutations += 1;
                            if dirty {
                                deletions += 1;
                            }
                        }
                    }

                    if self.should_schedule(triggered, deletions, mutations, next.is_some()) {
                        let delay = if triggered { Duration::ZERO } else { self.config.schedule_delay };
                        let at = Instant::now() + delay;
                        if next.is_none_or(|current| current > at) {
                            next = Some(at);
                        }
                    }
                    continue;
                }
            }

            // Background passes respect the pause threshold.
            if !triggered && let Some((finished, duration)) = last {
                let earliest = finished + self.config.pause_interval(duration);
                if Instant::now() < earliest {
                    debug!(delay = ?(earliest - Instant::now()), "deferring gc pass");
                    next = Some(earliest);
                    continue;
                }
            }

            next = None;
            triggered = false;
            deletions = 0;
            mutations = 0;
            let answering = std::mem::take(&mut waiters);

            let started = Instant::now();
            let result = self.collector.garbage_collect().await;
            let finished = Instant::now();
            self.collections.fetch_add(1, Ordering::Relaxed);
            last = Some((finished, finished - started));

            match result {
                Ok(stats) => {
                    failures = 0;
                    info!(
                        removed = stats.removed(),
                        leases = stats.leases,
                        content = stats.content,
                        snapshots = stats.snapshots,
                        images = stats.images,
                        elapsed = ?stats.elapsed(),
                        "garbage collected"
                    );
                    for waiter in answering {
                        let _ = waiter.send(Ok(stats.clone()));
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = retry_delay(failures);
                    error!(error = %e, failures, retry_in = ?delay, "garbage collection failed");
                    for waiter in answering {
                        let _ = waiter.send(Err(e.replicate()));
                    }
                    next = Some(finished + delay);
                }
            }
        }

        debug!("gc scheduler stopped");
    }

    fn should_schedule(&self, triggered: bool, deletions: u64, mutations: u64, armed: bool) -> bool {
        if triggered {
            return true;
        }
        let threshold = self.config.deletion_threshold;
        if threshold > 0 && deletions >= threshold {
            return true;
        }
        if armed {
            return false;
        }
        (threshold == 0 && deletions > 0)
            || (self.config.mutation_threshold > 0 && mutations >= self.config.mutation_threshold)
    }
}
