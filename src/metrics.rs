//! Process-wide connection and delivery counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters, bumped by the registry and the broadcaster
#[derive(Debug, Default)]
pub struct Metrics {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    failed_connections: AtomicU64,
    total_alerts_sent: AtomicU64,
    failed_deliveries: AtomicU64,
    retried_deliveries: AtomicU64,
    dropped_alerts: AtomicU64,
    health_checks_passed: AtomicU64,
    health_checks_failed: AtomicU64,
    reconnection_attempts: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub failed_connections: u64,
    pub total_alerts_sent: u64,
    pub failed_deliveries: u64,
    pub retried_deliveries: u64,
    pub dropped_alerts: u64,
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    pub reconnection_attempts: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a stray close must never wrap the gauge
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connection_failed(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alerts_sent(&self, count: u64) {
        self.total_alerts_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn deliveries_failed(&self, count: u64) {
        self.failed_deliveries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn delivery_retried(&self) {
        self.retried_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_dropped(&self) {
        self.dropped_alerts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn health_check_passed(&self) {
        self.health_checks_passed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn health_check_failed(&self) {
        self.health_checks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnection_attempted(&self) {
        self.reconnection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            total_alerts_sent: self.total_alerts_sent.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
            retried_deliveries: self.retried_deliveries.load(Ordering::Relaxed),
            dropped_alerts: self.dropped_alerts.load(Ordering::Relaxed),
            health_checks_passed: self.health_checks_passed.load(Ordering::Relaxed),
            health_checks_failed: self.health_checks_failed.load(Ordering::Relaxed),
            reconnection_attempts: self.reconnection_attempts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_gauge_never_underflows() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.active_connections, 0);
    }
}
