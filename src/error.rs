//! Error taxonomy shared by the registry and the broadcaster

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Malformed caller input (card tokens, subscription requests)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Card token must not be empty")]
    EmptyCardToken,

    #[error("Unknown session: {0}")]
    UnknownSession(Uuid),
}

/// Rejected credential. Only surfaced through `parse_bearer`; the
/// registry's `authenticate_connection` reports it as `false`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("Missing credential")]
    Missing,

    #[error("Credential is not a bearer token")]
    NotBearer,

    #[error("Bearer token is empty")]
    EmptyToken,
}

/// A single transport write that did not go through
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DeliveryError {
    #[error("Transport is closed")]
    Closed,

    #[error("Transport buffer is full")]
    Full,

    #[error("Transport write failed: {0}")]
    Io(String),
}

/// Failure to set up a new session
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to register session {session_id} for card {card_token}")]
    Registration { session_id: Uuid, card_token: String },

    #[error("Failed to reach new session {session_id}: {source}")]
    Transport {
        session_id: Uuid,
        #[source]
        source: DeliveryError,
    },

    #[error("Registry is shut down")]
    ShutDown,
}

/// Broadcaster-internal faults. Per-session delivery failures never
/// surface here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("Subscription index is corrupt: session {session_id} is subscribed to {card_token} but has no transport")]
    CorruptIndex { card_token: String, session_id: Uuid },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Broadcaster state lock poisoned")]
    Poisoned,
}
