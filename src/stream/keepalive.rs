//! Fixed-cadence keepalive probes for an open connection.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::stream::client::ConnectionHandle;
use crate::stream::proto::ControlFrame;

/// Sends `{"type":"ping"}` every `interval` while started.
///
/// A failed send is logged and the timer keeps running; only transport
/// callbacks change connection state.
#[derive(Debug)]
pub struct LivenessProber {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl LivenessProber {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Starts probing through `handle`, replacing any previous timer.
    ///
    /// The first probe goes out one interval after start.
    pub fn start(&mut self, handle: ConnectionHandle) {
        self.stop();

        let frame = match ControlFrame::Ping.to_text() {
            Ok(frame) => frame,
            Err(err) => {
                error!(event = "keepalive_frame_encode_failed", error = %err);
                return;
            }
        };
        let interval = self.interval;
        debug!(
            event = "keepalive_started",
            interval_ms = interval.as_millis() as u64
        );

        self.task = Some(tokio::spawn(async move {
            let first_tick = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !handle.send(frame.clone()) {
                    warn!(event = "keepalive_send_failed");
                }
            }
        }));
    }

    /// Cancels the timer. Safe to call when not running.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(event = "keepalive_stopped");
        }
    }
}

impl Drop for LivenessProber {
    fn drop(&mut self) {
        self.stop();
    }
}
