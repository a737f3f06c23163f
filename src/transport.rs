//! Outbound sinks for session traffic
//!
//! The core never owns the socket behind a session. It only pushes
//! [`ServerMessage`]s through a [`Transport`] and closes it on teardown.

use crate::error::DeliveryError;
use crate::protocol::ServerMessage;
use std::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

/// A writable push connection.
///
/// `send` must not block: implementations hand the message off and report
/// immediately whether it was accepted.
pub trait Transport: Send + Sync {
    /// Push one message to the agent
    fn send(&self, msg: ServerMessage) -> Result<(), DeliveryError>;

    /// Stop accepting messages. Calling it more than once is harmless.
    fn close(&self);

    /// Whether `close` has been called or the peer went away
    fn is_closed(&self) -> bool;
}

/// Transport backed by a bounded mpsc channel drained by a writer task
pub struct ChannelTransport {
    sender: Mutex<Option<mpsc::Sender<ServerMessage>>>,
}

impl ChannelTransport {
    /// Create a new transport around the sending half of a writer channel
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Create a transport together with the receiver its writer should drain
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| DeliveryError::Io("transport lock poisoned".to_string()))?;
        let sender = guard.as_ref().ok_or(DeliveryError::Closed)?;

        sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            // Dropping the sender lets the writer task drain and exit
            guard.take();
        }
    }

    fn is_closed(&self) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard.as_ref().map_or(true, |s| s.is_closed()),
            Err(_) => true,
        }
    }
}
