//! Session registry - lifecycle of agent push connections
//!
//! The registry owns every live [`Session`], keeps it registered with the
//! [`AlertBroadcaster`], and runs two monitors per session: a keep-alive
//! ping and a periodic health check that escalates from `unhealthy` through
//! bounded recovery attempts to a terminal disconnect.
//!
//! [`SessionRegistry::handle_disconnection`] is the only way a session goes
//! away. It is safe to call repeatedly and from several tasks at once; only
//! the first call does any work.

mod auth;
mod monitor;
mod session;

pub use auth::{authenticate_connection, parse_bearer};
pub use session::{
    ConnectionHealth, DisconnectReason, Session, SessionInfo, SessionMetadata, SessionStatus,
};

use crate::broadcast::{AlertBroadcaster, RetrySummary};
use crate::config::MonitorConfig;
use crate::error::{BroadcastError, ConnectionError, ValidationError};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::protocol::ServerMessage;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Result of one health evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    /// Heartbeat is fresh, session is active
    Passed,
    /// Heartbeat was stale, a recovery notice went out
    Recovering { attempt: u32 },
    /// The session was closed
    Closed(DisconnectReason),
    /// No such session
    UnknownSession,
}

struct SessionEntry {
    session: Session,
    transport: Arc<dyn Transport>,
    monitors: Vec<JoinHandle<()>>,
}

struct RegistryInner {
    config: MonitorConfig,
    broadcaster: Arc<AlertBroadcaster>,
    metrics: Arc<Metrics>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Ok(sweeper) = self.sweeper.get_mut() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        if let Ok(sessions) = self.sessions.get_mut() {
            for entry in sessions.values_mut() {
                for handle in entry.monitors.drain(..) {
                    handle.abort();
                }
            }
        }
    }
}

/// Service object owning all live sessions. Cheap to clone; clones share
/// the same state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create the registry and start the retry sweep.
    ///
    /// The sweep runs on the health-check cadence and needs a tokio runtime;
    /// without one the registry works but queued alerts are only retried
    /// through [`SessionRegistry::run_retry_sweep`].
    pub fn new(config: MonitorConfig, broadcaster: Arc<AlertBroadcaster>) -> Self {
        let metrics = Arc::clone(broadcaster.metrics());
        let registry = Self {
            inner: Arc::new(RegistryInner {
                config,
                broadcaster,
                metrics,
                sessions: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                let handle = monitor::spawn_retry_sweep(
                    Arc::downgrade(&registry.inner),
                    registry.inner.config.health_check_interval(),
                );
                *registry.sweeper() = Some(handle);
            }
            Err(_) => tracing::warn!("No tokio runtime, retry sweep not started"),
        }

        registry
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweeper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn broadcaster(&self) -> &Arc<AlertBroadcaster> {
        &self.inner.broadcaster
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Open a session for `card_token` on `transport`.
    ///
    /// Pushes a `ConnectionEstablished` message, then registers with the
    /// broadcaster and starts the session's monitors. Any failure rolls
    /// back what was already set up.
    pub fn create_connection(
        &self,
        transport: Arc<dyn Transport>,
        card_token: &str,
        metadata: SessionMetadata,
    ) -> Result<SessionInfo, ConnectionError> {
        if self.is_shut_down() {
            return Err(ConnectionError::ShutDown);
        }
        if card_token.trim().is_empty() {
            self.inner.metrics.connection_failed();
            return Err(ValidationError::EmptyCardToken.into());
        }

        let session = Session::new(card_token, metadata);
        let session_id = session.id;
        let info = session.info();
        let agent = session
            .metadata
            .agent_id
            .clone()
            .unwrap_or_else(|| "-".to_string());

        self.sessions().insert(
            session_id,
            SessionEntry {
                session,
                transport: Arc::clone(&transport),
                monitors: Vec::new(),
            },
        );

        // The agent must see its session before any alert for the card
        if let Err(source) = transport.send(ServerMessage::ConnectionEstablished {
            session: info.clone(),
        }) {
            self.sessions().remove(&session_id);
            self.inner.metrics.connection_failed();
            tracing::warn!("New session {} unreachable: {}", session_id, source);
            return Err(ConnectionError::Transport { session_id, source });
        }

        if !self
            .inner
            .broadcaster
            .register_connection(session_id, card_token, Arc::clone(&transport))
        {
            self.sessions().remove(&session_id);
            self.inner.metrics.connection_failed();
            tracing::error!("Failed to register session {} with broadcaster", session_id);
            return Err(ConnectionError::Registration {
                session_id,
                card_token: card_token.to_string(),
            });
        }

        // Torn down while registering; do not leave it indexed
        if !self.sessions().contains_key(&session_id) {
            self.inner.broadcaster.remove_connection(session_id);
            return Err(ConnectionError::Registration {
                session_id,
                card_token: card_token.to_string(),
            });
        }

        self.inner.metrics.connection_opened();
        self.monitor_connection(session_id);

        tracing::info!(
            "Session {} established for card {} (agent: {})",
            session_id,
            card_token,
            agent
        );

        Ok(info)
    }

    /// Whether `credential` has the `Bearer <token>` shape. Never mutates.
    pub fn authenticate_connection(&self, credential: Option<&str>) -> bool {
        authenticate_connection(credential)
    }

    /// Start the keep-alive and health-check tasks for a session.
    ///
    /// Returns `false` if the session is unknown. Any monitors already
    /// running for the session are replaced.
    pub fn monitor_connection(&self, session_id: Uuid) -> bool {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("No tokio runtime, session {} is not monitored", session_id);
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let keep_alive =
            monitor::spawn_keep_alive(weak.clone(), session_id, self.inner.config.keep_alive_interval());
        let health =
            monitor::spawn_health_check(weak, session_id, self.inner.config.health_check_interval());

        let mut sessions = self.sessions();
        match sessions.get_mut(&session_id) {
            Some(entry) => {
                for old in entry.monitors.drain(..) {
                    old.abort();
                }
                entry.monitors = vec![keep_alive, health];
                true
            }
            None => {
                keep_alive.abort();
                health.abort();
                false
            }
        }
    }

    /// Evaluate a session's staleness now
    pub fn perform_health_check(&self, session_id: Uuid) -> HealthCheckOutcome {
        self.evaluate_health(session_id, Utc::now())
    }

    /// Evaluate a session's staleness as of `now`.
    ///
    /// Idle past the connection timeout closes the session. A stale
    /// heartbeat marks it unhealthy and either attempts recovery or, once
    /// the attempts are used up, closes it. Otherwise the check passes.
    pub fn evaluate_health(&self, session_id: Uuid, now: DateTime<Utc>) -> HealthCheckOutcome {
        let config = &self.inner.config;
        let mut sessions = self.sessions();
        let Some(entry) = sessions.get_mut(&session_id) else {
            return HealthCheckOutcome::UnknownSession;
        };
        let session = &mut entry.session;

        if now - session.last_activity > config.connection_timeout() {
            drop(sessions);
            tracing::info!("Session {} idle past timeout", session_id);
            self.handle_disconnection(session_id, DisconnectReason::Timeout);
            return HealthCheckOutcome::Closed(DisconnectReason::Timeout);
        }

        if now - session.last_heartbeat > config.heartbeat_timeout() {
            session.health_checks_failed += 1;
            session.status = SessionStatus::Unhealthy;
            let attempts = session.reconnect_attempts;
            drop(sessions);

            self.inner.metrics.health_check_failed();
            tracing::warn!(
                "Session {} missed heartbeat (recovery attempts so far: {})",
                session_id,
                attempts
            );

            if attempts < config.max_reconnect_attempts {
                return self.attempt_recovery(session_id);
            }

            self.handle_disconnection(session_id, DisconnectReason::HealthCheckFailed);
            return HealthCheckOutcome::Closed(DisconnectReason::HealthCheckFailed);
        }

        session.health_checks_passed += 1;
        session.status = SessionStatus::Active;
        drop(sessions);

        self.inner.metrics.health_check_passed();
        HealthCheckOutcome::Passed
    }

    /// Nudge an unhealthy session back with a recovery notice.
    ///
    /// Timestamps are reset optimistically; the next health check decides
    /// whether the agent really came back.
    pub fn attempt_recovery(&self, session_id: Uuid) -> HealthCheckOutcome {
        let (transport, attempt) = {
            let mut sessions = self.sessions();
            let Some(entry) = sessions.get_mut(&session_id) else {
                return HealthCheckOutcome::UnknownSession;
            };
            entry.session.reconnect_attempts += 1;
            (Arc::clone(&entry.transport), entry.session.reconnect_attempts)
        };
        self.inner.metrics.reconnection_attempted();

        if let Err(e) = transport.send(ServerMessage::Recovery {
            session_id,
            attempt,
        }) {
            tracing::warn!("Recovery notice to session {} failed: {}", session_id, e);
            self.handle_disconnection(session_id, DisconnectReason::RecoveryFailed);
            return HealthCheckOutcome::Closed(DisconnectReason::RecoveryFailed);
        }

        if let Some(entry) = self.sessions().get_mut(&session_id) {
            let now = Utc::now();
            entry.session.last_activity = now;
            entry.session.last_heartbeat = now;
            entry.session.status = SessionStatus::Recovering;
        }

        tracing::info!("Session {} recovery attempt {}", session_id, attempt);
        HealthCheckOutcome::Recovering { attempt }
    }

    /// Tear a session down. Returns `true` only for the call that actually
    /// removed it; later calls for the same id are no-ops.
    pub fn handle_disconnection(&self, session_id: Uuid, reason: DisconnectReason) -> bool {
        // Whoever takes the entry out of the map owns the teardown
        let removed = self.sessions().remove(&session_id);
        let Some(mut entry) = removed else {
            tracing::debug!("Session {} already closed ({})", session_id, reason);
            return false;
        };

        entry.session.status = SessionStatus::Closed;
        for handle in entry.monitors.drain(..) {
            handle.abort();
        }

        if let Err(e) = entry.transport.send(ServerMessage::Disconnected {
            session_id,
            reason: reason.clone(),
        }) {
            tracing::debug!("Disconnect notice to {} not delivered: {}", session_id, e);
        }
        entry.transport.close();
        self.inner.broadcaster.remove_connection(session_id);

        self.inner.metrics.connection_closed();
        if reason.is_failure() {
            self.inner.metrics.connection_failed();
        }

        tracing::info!(
            "Session {} for card {} closed: {}",
            session_id,
            entry.session.card_token,
            reason
        );
        true
    }

    /// The agent signalled liveness
    pub fn record_heartbeat(&self, session_id: Uuid) -> bool {
        match self.sessions().get_mut(&session_id) {
            Some(entry) => {
                entry.session.touch_heartbeat(Utc::now());
                true
            }
            None => false,
        }
    }

    /// The agent sent traffic other than a heartbeat
    pub fn record_activity(&self, session_id: Uuid) -> bool {
        match self.sessions().get_mut(&session_id) {
            Some(entry) => {
                entry.session.touch_activity(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Watch an additional card on a live session
    pub fn subscribe(&self, session_id: Uuid, card_token: &str) -> Result<(), BroadcastError> {
        if !self.sessions().contains_key(&session_id) {
            return Err(ValidationError::UnknownSession(session_id).into());
        }
        self.inner.broadcaster.subscribe(session_id, card_token)
    }

    /// Stop watching a card on a live session
    pub fn unsubscribe(&self, session_id: Uuid, card_token: &str) -> bool {
        self.inner.broadcaster.unsubscribe(session_id, card_token)
    }

    /// Health view of one session, `None` if unknown
    pub fn get_connection_health(&self, session_id: Uuid) -> Option<ConnectionHealth> {
        let session = self.sessions().get(&session_id)?.session.clone();
        let queued = self.inner.broadcaster.queue_len(session_id).unwrap_or(0);
        Some(session.health(queued))
    }

    /// Health view of every live session, oldest first
    pub fn get_all_connections(&self) -> Vec<ConnectionHealth> {
        let mut sessions: Vec<Session> = self
            .sessions()
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| {
            a.established_at
                .cmp(&b.established_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        sessions
            .iter()
            .map(|s| s.health(self.inner.broadcaster.queue_len(s.id).unwrap_or(0)))
            .collect()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Retry queued alerts for every session now
    pub fn run_retry_sweep(&self) -> RetrySummary {
        self.inner.broadcaster.retry_queued_messages()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop all monitors and the retry sweep, close every session and
    /// clear the broadcaster. New connections are refused afterwards.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.sweeper().take() {
            handle.abort();
        }

        let ids: Vec<Uuid> = self.sessions().keys().copied().collect();
        let closed = ids
            .into_iter()
            .filter(|id| self.handle_disconnection(*id, DisconnectReason::Shutdown))
            .count();

        self.inner.broadcaster.clear();
        tracing::info!("Session registry shut down, {} sessions closed", closed);
    }
}
