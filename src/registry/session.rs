//! Session records and the read models handed out by the registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a session.
///
/// `Closed` is terminal: a closed session is gone from the registry and
/// never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Recovering,
    Unhealthy,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Recovering => "recovering",
            SessionStatus::Unhealthy => "unhealthy",
            SessionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session was torn down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The agent hung up
    ClientClosed,
    /// No activity within the connection timeout
    Timeout,
    /// Heartbeats stayed stale after every recovery attempt
    HealthCheckFailed,
    /// The recovery notice could not be written
    RecoveryFailed,
    /// A keep-alive write found the transport gone
    TransportError,
    /// The registry is shutting down
    Shutdown,
    /// Operator-requested, with free-form reason
    Admin(String),
}

impl DisconnectReason {
    /// Whether this teardown counts as a failed connection
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Timeout
                | DisconnectReason::HealthCheckFailed
                | DisconnectReason::RecoveryFailed
                | DisconnectReason::TransportError
        )
    }
}

impl From<&str> for DisconnectReason {
    fn from(reason: &str) -> Self {
        match reason {
            "client_closed" => DisconnectReason::ClientClosed,
            "timeout" => DisconnectReason::Timeout,
            "health_check_failed" => DisconnectReason::HealthCheckFailed,
            "recovery_failed" => DisconnectReason::RecoveryFailed,
            "transport_error" => DisconnectReason::TransportError,
            "shutdown" => DisconnectReason::Shutdown,
            other => DisconnectReason::Admin(other.to_string()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientClosed => f.write_str("client_closed"),
            DisconnectReason::Timeout => f.write_str("timeout"),
            DisconnectReason::HealthCheckFailed => f.write_str("health_check_failed"),
            DisconnectReason::RecoveryFailed => f.write_str("recovery_failed"),
            DisconnectReason::TransportError => f.write_str("transport_error"),
            DisconnectReason::Shutdown => f.write_str("shutdown"),
            DisconnectReason::Admin(reason) => f.write_str(reason),
        }
    }
}

/// Caller annotations carried on a session; never interpreted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    pub agent_id: Option<String>,
    pub request_id: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl SessionMetadata {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Default::default()
        }
    }
}

/// Returned from `create_connection`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub card_token: String,
    pub status: SessionStatus,
    pub established_at: DateTime<Utc>,
}

/// Health view of one session for admin surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub session_id: Uuid,
    pub card_token: String,
    pub status: SessionStatus,
    pub established_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    pub reconnect_attempts: u32,
    pub queued_alerts: usize,
    pub metadata: SessionMetadata,
}

/// Live state of a monitored push connection
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub card_token: String,
    pub established_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: SessionStatus,
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    pub reconnect_attempts: u32,
    pub metadata: SessionMetadata,
}

impl Session {
    /// Create a new active session
    pub fn new(card_token: impl Into<String>, metadata: SessionMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            card_token: card_token.into(),
            established_at: now,
            last_activity: now,
            last_heartbeat: now,
            status: SessionStatus::Active,
            health_checks_passed: 0,
            health_checks_failed: 0,
            reconnect_attempts: 0,
            metadata,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            card_token: self.card_token.clone(),
            status: self.status,
            established_at: self.established_at,
        }
    }

    pub fn health(&self, queued_alerts: usize) -> ConnectionHealth {
        ConnectionHealth {
            session_id: self.id,
            card_token: self.card_token.clone(),
            status: self.status,
            established_at: self.established_at,
            last_activity: self.last_activity,
            last_heartbeat: self.last_heartbeat,
            health_checks_passed: self.health_checks_passed,
            health_checks_failed: self.health_checks_failed,
            reconnect_attempts: self.reconnect_attempts,
            queued_alerts,
            metadata: self.metadata.clone(),
        }
    }

    /// Agent signalled it is alive
    pub fn touch_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.last_activity = now;
    }

    pub fn touch_activity(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }
}
