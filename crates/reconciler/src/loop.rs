//! Continuous reconciliation loop.
//!
//! Keys enter a work queue from watchers (through a [`LoopHandle`]) and from
//! the timeout handler. A fixed number of workers drain the queue. A key is
//! never handled by two workers at once: a key added while it is being
//! processed is queued again once the current pass ends.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use stepwise_core::{ControllerConfig, RunKey};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::timeout::TimeoutCallback;

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Deadline of a single pass.
    pub pass_timeout: Duration,
    /// Requeue delay after the first failed pass of a key.
    pub requeue_base_delay: Duration,
    /// Upper bound of the requeue delay.
    pub requeue_max_delay: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for LoopConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            workers: config.workers,
            pass_timeout: config.pass_timeout,
            requeue_base_delay: config.requeue_base_delay,
            requeue_max_delay: config.requeue_max_delay,
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<RunKey>,
    dirty: HashSet<RunKey>,
    processing: HashSet<RunKey>,
    failures: HashMap<RunKey, u32>,
}

/// Deduplicating work queue with per-key exclusion.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    /// Create a queue whose failure requeues grow from `base_delay` to `max_delay`.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Queue state survives a panicking holder; every update leaves it consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already waiting.
    pub fn add(&self, key: RunKey) {
        let mut state = self.lock();
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            debug!(key = %key, "key busy, deferring");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.ready.notify_one();
    }

    /// Queue `key` after `delay`.
    pub fn add_after(self: &Arc<Self>, key: RunKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue `key` after a delay that doubles with every consecutive failure.
    ///
    /// Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: RunKey) -> Duration {
        let failures = {
            let mut state = self.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            let current = *count;
            *count = count.saturating_add(1);
            current
        };
        let delay = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(failures))
            .min(self.max_delay);
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &RunKey) {
        self.lock().failures.remove(key);
    }

    /// Take the next key, marking it as being processed.
    pub fn try_next(&self) -> Option<RunKey> {
        let mut state = self.lock();
        let key = state.queue.pop_front()?;
        state.dirty.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    /// Wait for the next key.
    pub async fn next(&self) -> RunKey {
        loop {
            if let Some(key) = self.try_next() {
                return key;
            }
            self.ready.notified().await;
        }
    }

    /// Finish processing `key`, requeueing it if it was added meanwhile.
    pub fn done(&self, key: &RunKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.ready.notify_one();
        }
    }

    /// Number of keys waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Check whether no key is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cloneable handle for feeding keys into a loop.
#[derive(Clone)]
pub struct LoopHandle {
    queue: Arc<WorkQueue>,
}

impl LoopHandle {
    /// Queue a run for reconciliation.
    pub fn enqueue(&self, key: RunKey) {
        self.queue.add(key);
    }
}

/// Runs reconcile passes for queued keys on a pool of workers.
pub struct ReconciliationLoop {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    config: LoopConfig,
    fired: Option<mpsc::UnboundedReceiver<RunKey>>,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl ReconciliationLoop {
    /// Create a loop and route the reconciler's timers into its queue.
    pub fn new(reconciler: Arc<Reconciler>, config: LoopConfig) -> Self {
        let queue = Arc::new(WorkQueue::new(
            config.requeue_base_delay,
            config.requeue_max_delay,
        ));
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let callback = move |key: &RunKey| {
            let _ = fired_tx.send(key.clone());
        };
        let callback: Arc<dyn TimeoutCallback> = Arc::new(callback);
        reconciler.timeouts().set_callback(Some(callback));

        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            reconciler,
            queue,
            config,
            fired: Some(fired_rx),
            stop_rx,
            stop_tx,
        }
    }

    /// Handle for enqueueing keys.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Queue a run for reconciliation.
    pub fn enqueue(&self, key: RunKey) {
        self.queue.add(key);
    }

    /// Run until stopped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoopStopped`] if the loop was already run, or
    /// [`Error::InvalidConfig`] when configured with zero workers.
    pub async fn run(&mut self) -> Result<()> {
        if self.config.workers == 0 {
            return Err(Error::invalid_config("at least one worker is required"));
        }
        let mut fired = self.fired.take().ok_or(Error::LoopStopped)?;

        info!(
            workers = self.config.workers,
            pass_timeout = ?self.config.pass_timeout,
            "starting reconciliation loop"
        );

        let workers = (0..self.config.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    reconciler: Arc::clone(&self.reconciler),
                    queue: Arc::clone(&self.queue),
                    pass_timeout: self.config.pass_timeout,
                };
                tokio::spawn(worker.run(self.stop_rx.clone()))
            })
            .collect::<Vec<_>>();

        loop {
            tokio::select! {
                Some(key) = fired.recv() => {
                    debug!(key = %key, "timer fired");
                    self.queue.add(key);
                }
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.reconciler.timeouts().set_callback(None);
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        info!("reconciliation loop stopped");
        Ok(())
    }

    /// Run one pass for the next queued key, if any, without starting workers.
    pub async fn process_next(&self) -> Option<(RunKey, Result<ReconcileOutcome>)> {
        let key = self.queue.try_next()?;
        let worker = Worker {
            id: 0,
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
            pass_timeout: self.config.pass_timeout,
        };
        let result = worker.process(&key).await;
        Some((key, result))
    }

    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }
}

struct Worker {
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    pass_timeout: Duration,
}

impl Worker {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            let key = tokio::select! {
                key = self.queue.next() => key,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let _ = self.process(&key).await;
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn process(&self, key: &RunKey) -> Result<ReconcileOutcome> {
        let result = tokio::time::timeout(self.pass_timeout, self.reconciler.reconcile(key))
            .await
            .unwrap_or_else(|_| Err(Error::pass_timed_out(key.clone())));

        match &result {
            Ok(ReconcileOutcome::RetryAfter(after)) => {
                self.queue.forget(key);
                debug!(worker = self.id, key = %key, after = ?after, "requeue requested");
                self.queue.add_after(key.clone(), *after);
            }
            Ok(outcome) => {
                self.queue.forget(key);
                debug!(worker = self.id, key = %key, outcome = ?outcome, "pass complete");
            }
            Err(e) => {
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(worker = self.id, key = %key, error = %e, delay = ?delay, "pass failed");
            }
        }
        self.queue.done(key);
        result
    }
}

/// Handle to stop a reconciliation loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
