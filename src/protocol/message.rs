//! Message types exchanged between agents, admin tools and the server

use crate::alert::{Alert, RawTransaction};
use crate::broadcast::BroadcastReport;
use crate::metrics::MetricsSnapshot;
use crate::registry::{ConnectionHealth, DisconnectReason, SessionInfo, SessionMetadata};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from a client (agent, admin CLI, ingestion hook) to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake with protocol version
    Hello { protocol_version: u32 },

    /// Open a monitoring session for a card
    Connect {
        credential: Option<String>,
        card_token: String,
        metadata: SessionMetadata,
    },

    /// Agent liveness signal for the session opened on this connection
    Heartbeat,

    /// Watch an additional card on the current session
    Subscribe { card_token: String },

    /// Stop watching a card on the current session
    Unsubscribe { card_token: String },

    /// Push a transaction event to every session watching the card
    PublishTransaction {
        card_token: String,
        event: RawTransaction,
    },

    GetMetrics,

    ListConnections,

    GetHealth { session_id: Uuid },

    /// Force a session closed
    Disconnect { session_id: Uuid, reason: String },

    /// Close the session held by this connection and leave
    Detach,
}

/// Messages sent from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake response
    Welcome {
        server_id: Uuid,
        protocol_version: u32,
    },

    /// Session is live and subscribed
    ConnectionEstablished { session: SessionInfo },

    /// Keep-alive, carries the server clock in unix millis
    Ping { timestamp: i64 },

    /// Server lost track of the agent and is trying to get it back
    Recovery { session_id: Uuid, attempt: u32 },

    /// Session is being torn down
    Disconnected {
        session_id: Uuid,
        reason: DisconnectReason,
    },

    /// A transaction on a watched card
    Alert(Alert),

    /// Outcome of a `PublishTransaction`
    BroadcastResult(BroadcastReport),

    Metrics(MetricsSnapshot),

    Connections { connections: Vec<ConnectionHealth> },

    Health { health: Option<ConnectionHealth> },

    /// Error response
    Error { message: String },

    /// Acknowledgment (for commands that need confirmation)
    Ack { for_command: String },
}

impl ServerMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::ConnectionEstablished { .. } => "connection_established",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Recovery { .. } => "recovery",
            ServerMessage::Disconnected { .. } => "disconnected",
            ServerMessage::Alert(_) => "alert",
            ServerMessage::BroadcastResult(_) => "broadcast_result",
            ServerMessage::Metrics(_) => "metrics",
            ServerMessage::Connections { .. } => "connections",
            ServerMessage::Health { .. } => "health",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Ack { .. } => "ack",
        }
    }
}
