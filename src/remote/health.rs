//! Connection Health Module
//!
//! Tracks uptime, activity and failure counters for the single connection
//! owned by a `ConnectionManager`, and runs the keep-alive scheduler.
//! Keep-alive failures never force a reconnect by themselves; they only feed
//! `consecutive_failures`, which the manager reads when deciding whether a
//! session is still trustworthy.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::session::ProtocolSession;

/// Point-in-time view of connection health
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Seconds since the current session was established (0 when disconnected)
    pub uptime_secs: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_operation_at: Option<DateTime<Utc>>,
    pub last_keep_alive_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Timestamps {
    connected_at: Option<Instant>,
    last_activity: Option<Instant>,
    last_operation_at: Option<DateTime<Utc>>,
    last_keep_alive_at: Option<DateTime<Utc>>,
}

/// Connection health tracker
#[derive(Debug, Default)]
pub struct HealthMonitor {
    success_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU32,
    times: Mutex<Timestamps>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the uptime clock for a freshly established session
    pub fn mark_connected(&self) {
        let mut times = self.times.lock();
        let now = Instant::now();
        times.connected_at = Some(now);
        times.last_activity = Some(now);
    }

    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Record a failure; returns the new consecutive-failure count
    pub fn record_failure(&self) -> u32 {
        self.failure_count.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Update the last-activity timestamp
    pub fn touch(&self) {
        let mut times = self.times.lock();
        times.last_activity = Some(Instant::now());
        times.last_operation_at = Some(Utc::now());
    }

    fn record_keep_alive(&self) {
        self.times.lock().last_keep_alive_at = Some(Utc::now());
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Time since the last operation (or since connect, if none ran yet)
    pub fn idle_for(&self) -> Duration {
        self.times
            .lock()
            .last_activity
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Back to initial values
    pub fn reset(&self) {
        self.success_count.store(0, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.times.lock() = Timestamps::default();
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let times = self.times.lock();
        HealthSnapshot {
            uptime_secs: times
                .connected_at
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            success_count: self.success_count.load(Ordering::SeqCst),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_operation_at: times.last_operation_at,
            last_keep_alive_at: times.last_keep_alive_at,
        }
    }

    /// Pretend the last operation happened at `instant`
    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, instant: Instant) {
        self.times.lock().last_activity = Some(instant);
    }
}

/// Result of one keep-alive tick, handed to the manager's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveOutcome {
    Alive,
    Failed { consecutive_failures: u32 },
}

/// Spawn the keep-alive scheduler for `session`.
///
/// Every `interval` the session's no-op probe runs under `probe_timeout`;
/// the outcome updates `health` and is passed to `on_outcome`. The task runs
/// until its handle is aborted.
pub fn spawn_keep_alive<F>(
    session: Arc<dyn ProtocolSession>,
    health: Arc<HealthMonitor>,
    interval: Duration,
    probe_timeout: Duration,
    on_outcome: F,
) -> JoinHandle<()>
where
    F: Fn(KeepAliveOutcome) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!(
            "Keep-alive started (protocol={}, interval={}s)",
            session.protocol(),
            interval.as_secs()
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the session was just verified.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let result = tokio::time::timeout(probe_timeout, session.keep_alive()).await;
            health.record_keep_alive();

            let outcome = match result {
                Ok(Ok(())) => {
                    health.record_success();
                    debug!("Keep-alive OK");
                    KeepAliveOutcome::Alive
                }
                Ok(Err(e)) => {
                    let failures = health.record_failure();
                    warn!("Keep-alive failed ({} consecutive): {}", failures, e);
                    KeepAliveOutcome::Failed {
                        consecutive_failures: failures,
                    }
                }
                Err(_) => {
                    let failures = health.record_failure();
                    warn!(
                        "Keep-alive timed out after {:?} ({} consecutive)",
                        probe_timeout, failures
                    );
                    KeepAliveOutcome::Failed {
                        consecutive_failures: failures,
                    }
                }
            };
            on_outcome(outcome);
        }
    })
}
