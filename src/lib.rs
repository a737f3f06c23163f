//! cardwatch - real-time card transaction alerts for monitoring agents
//!
//! This crate provides the core functionality for cardwatch, including:
//! - Session registry (agent connection lifecycle, health monitoring, recovery)
//! - Alert broadcaster (card subscriptions, fan-out delivery, bounded retry)
//! - Client-server protocol and the Unix socket server
//! - Configuration management
//!
//! # Architecture
//!
//! cardwatch uses a client-server model where:
//! - The server (`cardwatch-server`) owns one [`registry::SessionRegistry`]
//!   and one [`broadcast::AlertBroadcaster`]
//! - Agents connect, open a session for a card and receive alerts
//! - Ingestion hooks publish raw transaction events which are formatted and
//!   fanned out to every session watching the card
//! - Communication happens over Unix domain sockets
//!
//! Delivery is best effort: failed writes are queued and retried a bounded
//! number of times, and order across alerts is not guaranteed.

pub mod alert;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

pub use alert::{format_transaction_alert, Alert, RawTransaction};
pub use broadcast::{AlertBroadcaster, BroadcastReport, DeliveryOutcome};
pub use error::{
    AuthenticationError, BroadcastError, ConnectionError, DeliveryError, ValidationError,
};
pub use registry::{SessionRegistry, SessionStatus};
