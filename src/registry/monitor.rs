//! Periodic per-session tasks and the registry-wide retry sweep
//!
//! Tasks hold a `Weak` handle so a dropped registry is never kept alive
//! by its own timers. The first tick fires one full period after spawn.

use super::{DisconnectReason, HealthCheckOutcome, RegistryInner, SessionRegistry};
use crate::error::DeliveryError;
use crate::protocol::ServerMessage;
use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn upgrade(weak: &Weak<RegistryInner>) -> Option<SessionRegistry> {
    weak.upgrade().map(|inner| SessionRegistry { inner })
}

/// Ping the agent every `period`
pub(super) fn spawn_keep_alive(
    weak: Weak<RegistryInner>,
    session_id: Uuid,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(period);
        loop {
            ticker.tick().await;
            let Some(registry) = upgrade(&weak) else {
                break;
            };
            if !registry.keep_alive(session_id) {
                break;
            }
        }
        tracing::debug!("Keep-alive for session {} stopped", session_id);
    })
}

/// Run a health check every `period`
pub(super) fn spawn_health_check(
    weak: Weak<RegistryInner>,
    session_id: Uuid,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(period);
        loop {
            ticker.tick().await;
            let Some(registry) = upgrade(&weak) else {
                break;
            };
            match registry.perform_health_check(session_id) {
                HealthCheckOutcome::Passed | HealthCheckOutcome::Recovering { .. } => {}
                HealthCheckOutcome::Closed(_) | HealthCheckOutcome::UnknownSession => break,
            }
        }
        tracing::debug!("Health check for session {} stopped", session_id);
    })
}

/// Retry queued alerts every `period`
pub(super) fn spawn_retry_sweep(weak: Weak<RegistryInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(period);
        loop {
            ticker.tick().await;
            let Some(registry) = upgrade(&weak) else {
                break;
            };
            if registry.is_shut_down() {
                break;
            }
            registry.run_retry_sweep();
        }
    })
}

impl SessionRegistry {
    /// Write one keep-alive ping. Returns `false` once the session is gone.
    ///
    /// A full outbound buffer skips the tick; a closed transport ends the
    /// session.
    pub(super) fn keep_alive(&self, session_id: Uuid) -> bool {
        let transport = match self.sessions().get(&session_id) {
            Some(entry) => Arc::clone(&entry.transport),
            None => return false,
        };

        let now = Utc::now();
        match transport.send(ServerMessage::Ping {
            timestamp: now.timestamp_millis(),
        }) {
            Ok(()) => {
                match self.sessions().get_mut(&session_id) {
                    Some(entry) => entry.session.touch_activity(now),
                    None => return false,
                }
                true
            }
            Err(DeliveryError::Full) => {
                tracing::warn!("Session {} outbound buffer full, skipping ping", session_id);
                true
            }
            Err(e) => {
                tracing::warn!("Keep-alive to session {} failed: {}", session_id, e);
                self.handle_disconnection(session_id, DisconnectReason::TransportError);
                false
            }
        }
    }
}
