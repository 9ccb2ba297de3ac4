//! Liveness and readiness of the background applier.
//!
//! The applier thread writes here; HTTP handlers read snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

/// Where the applier state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplierState {
    Connecting,
    Consuming,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No successful connection yet.
    Starting,
    Healthy,
    /// Too many consecutive failures; reads are served but may be stale.
    Degraded,
    Stopped,
}

/// Counters describing what the applier has done since start.
#[derive(Debug, Default)]
pub struct ApplierStats {
    applied: AtomicU64,
    duplicates: AtomicU64,
    poison: AtomicU64,
    store_failures: AtomicU64,
    broker_failures: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub duplicates: u64,
    pub poison: u64,
    pub store_failures: u64,
    pub broker_failures: u64,
    pub reconnects: u64,
}

impl ApplierStats {
    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poison(&self) {
        self.poison.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broker_failure(&self) {
        self.broker_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            broker_failures: self.broker_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ApplierState,
    status: HealthStatus,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Point-in-time view served by `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub state: ApplierState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stats: StatsSnapshot,
}

/// Shared health of one applier.
#[derive(Debug)]
pub struct HealthState {
    degraded_after: u32,
    inner: RwLock<Inner>,
    stats: ApplierStats,
}

impl HealthState {
    /// `degraded_after` consecutive failures flip the status to degraded.
    pub fn new(degraded_after: u32) -> Self {
        Self {
            degraded_after: degraded_after.max(1),
            inner: RwLock::new(Inner {
                state: ApplierState::Connecting,
                status: HealthStatus::Starting,
                consecutive_failures: 0,
                last_error: None,
            }),
            stats: ApplierStats::default(),
        }
    }

    pub fn stats(&self) -> &ApplierStats {
        &self.stats
    }

    pub fn set_state(&self, state: ApplierState) {
        self.write(|inner| inner.state = state);
    }

    /// A session was opened. The first one makes the applier healthy;
    /// later ones keep a degraded status until the session proves itself.
    pub fn record_connected(&self) {
        self.write(|inner| {
            inner.state = ApplierState::Consuming;
            if inner.status == HealthStatus::Starting {
                inner.status = HealthStatus::Healthy;
            }
        });
    }

    /// The log answered; the failure streak is over.
    pub fn record_progress(&self) {
        self.write(|inner| {
            inner.consecutive_failures = 0;
            inner.last_error = None;
            if inner.status != HealthStatus::Stopped {
                inner.status = HealthStatus::Healthy;
            }
        });
    }

    /// Returns true when this failure crossed the degraded threshold.
    pub fn record_failure(&self, error: &str) -> bool {
        let threshold = self.degraded_after;
        let mut crossed = false;
        self.write(|inner| {
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_error = Some(error.to_string());
            if inner.consecutive_failures >= threshold && inner.status != HealthStatus::Degraded {
                inner.status = HealthStatus::Degraded;
                crossed = true;
            }
        });
        crossed
    }

    pub fn record_stopped(&self) {
        self.write(|inner| {
            inner.state = ApplierState::Stopped;
            inner.status = HealthStatus::Stopped;
        });
    }

    /// Ready means the applier is consuming with no failure streak.
    pub fn is_ready(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.status == HealthStatus::Healthy && inner.state == ApplierState::Consuming
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        HealthSnapshot {
            status: inner.status.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_error: inner.last_error.clone(),
            stats: self.stats.snapshot(),
        }
    }

    fn write(&self, f: impl FnOnce(&mut Inner)) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unready_and_becomes_healthy_on_connect() {
        let health = HealthState::new(3);
        assert_eq!(health.snapshot().status, HealthStatus::Starting);
        assert!(!health.is_ready());

        health.record_connected();
        assert_eq!(health.snapshot().status, HealthStatus::Healthy);
        assert!(health.is_ready());
    }

    #[test]
    fn degrades_after_consecutive_failures_and_recovers_on_progress() {
        let health = HealthState::new(3);
        health.record_connected();

        assert!(!health.record_failure("down"));
        assert!(!health.record_failure("down"));
        assert!(health.record_failure("down"));
        assert!(!health.record_failure("still down"));

        let snap = health.snapshot();
        assert_eq!(snap.status, HealthStatus::Degraded);
        assert_eq!(snap.consecutive_failures, 4);
        assert_eq!(snap.last_error.as_deref(), Some("still down"));

        // Reconnecting alone does not clear degradation.
        health.record_connected();
        assert!(!health.is_ready());

        health.record_progress();
        let snap = health.snapshot();
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(health.is_ready());
    }

    #[test]
    fn stopped_is_terminal_for_readiness() {
        let health = HealthState::new(1);
        health.record_connected();
        health.record_stopped();
        health.record_progress();
        assert_eq!(health.snapshot().status, HealthStatus::Stopped);
        assert!(!health.is_ready());
    }

    #[test]
    fn snapshot_serializes_counters() {
        let health = HealthState::new(2);
        health.stats().record_applied();
        health.stats().record_applied();
        health.stats().record_poison();

        let json = serde_json::to_value(health.snapshot()).unwrap();
        assert_eq!(json["status"], "starting");
        assert_eq!(json["state"], "connecting");
        assert_eq!(json["stats"]["applied"], 2);
        assert_eq!(json["stats"]["poison"], 1);
        assert!(json.get("last_error").is_none());
    }
}
