//! Reconnect scheduling.
//!
//! [`Reconnector`] owns at most one pending retry timer. The delay comes from
//! a [`ReconnectStrategy`]; the relay uses [`FixedDelay`] with unlimited
//! attempts, and [`ExponentialBackoff`] can be substituted without touching
//! the state machine.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::stream::state::ConnectionState;

/// Chooses the delay before the next reconnect attempt.
pub trait ReconnectStrategy: Debug + Send + Sync {
    /// `attempt` counts retries already scheduled since the last successful
    /// open, starting at zero. `None` stops reconnecting.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Constant delay, unlimited attempts, no jitter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FixedDelay {
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectStrategy for FixedDelay {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        Some(self.delay)
    }
}

/// Doubling delay with an upper bound, optional jitter and attempt cap.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
    /// Maximum number of retries; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            max_attempts: None,
        }
    }
}

impl ExponentialBackoff {
    fn base_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 0..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        Some(self.base_delay(attempt) + jitter_duration(self.jitter, attempt))
    }
}

/// Owns the single outstanding reconnect timer.
#[derive(Debug)]
pub struct Reconnector {
    strategy: Arc<dyn ReconnectStrategy>,
    pending: Option<JoinHandle<()>>,
    attempt: u32,
}

impl Reconnector {
    pub fn new(strategy: Arc<dyn ReconnectStrategy>) -> Self {
        Self {
            strategy,
            pending: None,
            attempt: 0,
        }
    }

    /// Schedules `on_due` after the strategy's next delay.
    ///
    /// No-op while a retry is pending or when `state` is anything but
    /// [`ConnectionState::Disconnected`]. Returns whether a timer was armed.
    pub fn schedule<F>(&mut self, state: ConnectionState, on_due: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if state != ConnectionState::Disconnected {
            debug!(event = "reconnect_suppressed", %state);
            return false;
        }
        if self.is_pending() {
            debug!(event = "reconnect_already_scheduled");
            return false;
        }

        let Some(delay) = self.strategy.next_delay(self.attempt) else {
            error!(
                event = "reconnect_attempts_exhausted",
                attempts = self.attempt
            );
            return false;
        };
        self.attempt = self.attempt.saturating_add(1);
        warn!(
            event = "reconnect_scheduled",
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64
        );

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_due();
        }));
        true
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Marks the pending timer as consumed after it fired.
    pub fn fired(&mut self) {
        self.pending = None;
    }

    /// Cancels the pending timer, if any. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }

    /// Resets the attempt counter after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn jitter_duration(max_jitter: Duration, attempt: u32) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ (u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
