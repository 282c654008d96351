//! Per-run countdowns.
//!
//! Each armed run gets its own tokio task that sleeps until the deadline
//! and then invokes the callback that was registered when it was armed.
//! Tasks never touch the handler's state: cancellation reaches them through
//! a oneshot channel, firing leaves through the callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use stepwise_core::RunKey;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Largest backoff exponent; keeps `2^n` seconds well inside range.
const MAX_BACKOFF_EXPONENT: u32 = 16;
const MAX_JITTER_MILLIS: i64 = 1000;

/// Receives fired timers.
pub trait TimeoutCallback: Send + Sync {
    /// Called once when the timer for `key` fires.
    fn on_timeout(&self, key: &RunKey);
}

impl<F> TimeoutCallback for F
where
    F: Fn(&RunKey) + Send + Sync,
{
    fn on_timeout(&self, key: &RunKey) {
        self(key);
    }
}

/// Retry state of a run whose pod creation keeps being refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Attempts made so far.
    pub attempts: u32,
    /// Earliest time of the next attempt.
    pub next_attempt: DateTime<Utc>,
}

#[derive(Default)]
struct TimerState {
    callback: Option<Arc<dyn TimeoutCallback>>,
    timers: HashMap<RunKey, oneshot::Sender<()>>,
    backoff_timers: HashMap<RunKey, oneshot::Sender<()>>,
    backoffs: HashMap<RunKey, Backoff>,
}

/// Owns one countdown per active run, plus quota backoff timers.
#[derive(Default)]
pub struct TimeoutHandler {
    state: Mutex<TimerState>,
}

impl TimeoutHandler {
    /// Create a handler with no callback; timers armed before
    /// [`set_callback`](Self::set_callback) never fire anything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler with a callback.
    pub fn with_callback(callback: Arc<dyn TimeoutCallback>) -> Self {
        let handler = Self::new();
        handler.set_callback(Some(callback));
        handler
    }

    /// Replace the callback used by timers armed from now on.
    pub fn set_callback(&self, callback: Option<Arc<dyn TimeoutCallback>>) {
        if let Ok(mut state) = self.state.lock() {
            state.callback = callback;
        }
    }

    /// Arm (or re-arm) the timeout of `key` to fire after `after`.
    pub fn set_timeout(&self, key: &RunKey, after: Duration) {
        let Ok(mut state) = self.state.lock() else {
            warn!(key = %key, "timeout state poisoned, timer not armed");
            return;
        };
        let cancel = spawn_timer(key.clone(), after, state.callback.clone());
        state.timers.insert(key.clone(), cancel);
        debug!(key = %key, after = ?after, "timeout armed");
    }

    /// Check whether the timeout of `key` is armed and has not fired.
    pub fn is_armed(&self, key: &RunKey) -> bool {
        self.state
            .lock()
            .map(|state| state.timers.get(key).is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Disarm every timer of `key` and forget its backoff.
    pub fn cancel(&self, key: &RunKey) {
        if let Ok(mut state) = self.state.lock() {
            let had_timer = state.timers.remove(key).is_some_and(|tx| tx.send(()).is_ok());
            if let Some(tx) = state.backoff_timers.remove(key) {
                let _ = tx.send(());
            }
            state.backoffs.remove(key);
            if had_timer {
                debug!(key = %key, "timeout cancelled");
            }
        }
    }

    /// Compute the next backoff of `key`, capped at `deadline`.
    ///
    /// While the previous backoff has not elapsed it is returned unchanged.
    pub fn backoff(&self, key: &RunKey, deadline: Option<DateTime<Utc>>) -> Backoff {
        let now = Utc::now();
        let Ok(mut state) = self.state.lock() else {
            return Backoff {
                attempts: 0,
                next_attempt: now,
            };
        };
        let current = state.backoffs.get(key).copied();
        if let Some(current) = current.filter(|b| now < b.next_attempt) {
            return current;
        }

        let attempts = current.map_or(0, |b| b.attempts).saturating_add(1);
        let seconds = 2_i64.saturating_pow(attempts.min(MAX_BACKOFF_EXPONENT));
        let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MILLIS);
        let delay = TimeDelta::seconds(seconds)
            .checked_add(&TimeDelta::milliseconds(jitter))
            .unwrap_or(TimeDelta::MAX);
        let mut next_attempt = now.checked_add_signed(delay).unwrap_or(now);
        if let Some(deadline) = deadline {
            next_attempt = next_attempt.min(deadline);
        }

        let backoff = Backoff {
            attempts,
            next_attempt,
        };
        state.backoffs.insert(key.clone(), backoff);
        backoff
    }

    /// Arm a one-shot requeue of `key` after `after`, unless one is pending.
    ///
    /// Returns whether a timer was armed.
    pub fn set_backoff_timer(&self, key: &RunKey, after: Duration) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state
            .backoff_timers
            .get(key)
            .is_some_and(|tx| !tx.is_closed())
        {
            return false;
        }
        let cancel = spawn_timer(key.clone(), after, state.callback.clone());
        state.backoff_timers.insert(key.clone(), cancel);
        debug!(key = %key, after = ?after, "backoff timer armed");
        true
    }

    /// Number of armed, unfired timeouts.
    pub fn armed_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.timers.values().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Disarm everything.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            for (_, tx) in state.timers.drain() {
                let _ = tx.send(());
            }
            for (_, tx) in state.backoff_timers.drain() {
                let _ = tx.send(());
            }
            state.backoffs.clear();
        }
    }
}

fn spawn_timer(
    key: RunKey,
    after: Duration,
    callback: Option<Arc<dyn TimeoutCallback>>,
) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::select! {
            _ = rx => {}
            () = tokio::time::sleep(after) => {
                if let Some(callback) = callback {
                    debug!(key = %key, "timer fired");
                    callback.on_timeout(&key);
                }
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel_handler() -> (TimeoutHandler, mpsc::UnboundedReceiver<RunKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = TimeoutHandler::with_callback(Arc::new(move |key: &RunKey| {
            let _ = tx.send(key.clone());
        }));
        (handler, rx)
    }

    /// Given an armed timer
    /// When its duration elapses
    /// Then the callback receives the key exactly once
    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_once() {
        let (handler, mut rx) = channel_handler();
        let key = RunKey::new("foo", "bar");

        handler.set_timeout(&key, Duration::from_secs(10));
        assert!(handler.is_armed(&key));

        assert_eq!(rx.recv().await, Some(key.clone()));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(!handler.is_armed(&key));
    }

    /// Given an armed timer
    /// When it is cancelled before the deadline
    /// Then nothing fires
    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (handler, mut rx) = channel_handler();
        let key = RunKey::new("foo", "bar");

        handler.set_timeout(&key, Duration::from_secs(10));
        handler.cancel(&key);
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(rx.try_recv().is_err());
        assert!(!handler.is_armed(&key));
    }

    /// Given a timer armed twice
    /// When the second deadline elapses
    /// Then only the replacement fires
    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timer() {
        let (handler, mut rx) = channel_handler();
        let key = RunKey::new("foo", "bar");

        handler.set_timeout(&key, Duration::from_secs(5));
        handler.set_timeout(&key, Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.try_recv().ok(), Some(key));
        assert!(rx.try_recv().is_err());
    }

    /// Given a timer armed while no callback is set
    /// When a callback is set afterwards
    /// Then the earlier timer still fires nothing
    #[tokio::test(start_paused = true)]
    async fn callback_is_captured_at_arm_time() {
        let handler = TimeoutHandler::new();
        let key = RunKey::new("foo", "bar");
        handler.set_timeout(&key, Duration::from_secs(1));

        let (tx, mut rx) = mpsc::unbounded_channel();
        handler.set_callback(Some(Arc::new(move |key: &RunKey| {
            let _ = tx.send(key.clone());
        })));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn backoff_grows_and_respects_deadline() {
        let handler = TimeoutHandler::new();
        let key = RunKey::new("foo", "bar");

        let first = handler.backoff(&key, None);
        assert_eq!(first.attempts, 1);
        let delay = first.next_attempt.signed_duration_since(Utc::now());
        assert!(delay <= TimeDelta::seconds(3));

        let again = handler.backoff(&key, None);
        assert_eq!(again, first);

        let other = RunKey::new("foo", "capped");
        let deadline = Utc::now().checked_add_signed(TimeDelta::milliseconds(100));
        let capped = handler.backoff(&other, deadline);
        assert_eq!(Some(capped.next_attempt), deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_timer_is_not_doubled() {
        let (handler, mut rx) = channel_handler();
        let key = RunKey::new("foo", "bar");

        assert!(handler.set_backoff_timer(&key, Duration::from_secs(2)));
        assert!(!handler.set_backoff_timer(&key, Duration::from_secs(2)));

        assert_eq!(rx.recv().await, Some(key.clone()));
        tokio::task::yield_now().await;
        assert!(handler.set_backoff_timer(&key, Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn shutdown_disarms_everything() {
        let (handler, _rx) = channel_handler();
        handler.set_timeout(&RunKey::new("foo", "a"), Duration::from_secs(60));
        handler.set_timeout(&RunKey::new("foo", "b"), Duration::from_secs(60));
        assert_eq!(handler.armed_count(), 2);

        handler.shutdown();

        assert_eq!(handler.armed_count(), 0);
    }
}
