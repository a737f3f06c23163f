//! Per-socket handling: writer task and request dispatch

use crate::alert::RawTransaction;
use crate::protocol::{
    check_version_compatibility, deserialize, read_frame, send_message, ClientMessage,
    ProtocolError, ServerMessage, PROTOCOL_VERSION,
};
use crate::registry::{DisconnectReason, SessionMetadata, SessionRegistry};
use crate::transport::{ChannelTransport, Transport};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use uuid::Uuid;

/// How long a closing connection gets to flush queued messages
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Task to write outgoing messages to the client
pub async fn client_writer_task(
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = receiver.recv().await {
        if let Err(e) = send_message(&mut writer, &msg).await {
            // Oversized frames are refused before any byte hits the socket
            if let Some(ProtocolError::MessageTooLarge { size, .. }) =
                e.downcast_ref::<ProtocolError>()
            {
                tracing::warn!("Dropping {} of {} bytes for client", msg.kind(), size);
                continue;
            }
            tracing::error!("Failed to write {} to client: {}", msg.kind(), e);
            break;
        }
    }

    tracing::debug!("Client writer task finished");
}

/// One accepted socket and the session it may hold
pub struct ClientConnection {
    id: Uuid,
    transport: Arc<ChannelTransport>,
    session_id: Option<Uuid>,
    registry: SessionRegistry,
}

impl ClientConnection {
    pub fn new(transport: Arc<ChannelTransport>, registry: SessionRegistry) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            session_id: None,
            registry,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Session opened on this connection, if any
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    fn reply(&self, msg: ServerMessage) -> bool {
        match self.transport.send(msg) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to reply to client {}: {}", self.id, e);
                false
            }
        }
    }

    /// Handle one request. Returns `false` when the connection should end.
    pub fn process_message(&mut self, msg: ClientMessage) -> bool {
        // The registry closed our session (timeout, failed health checks)
        if self.session_id.is_some() && self.transport.is_closed() {
            self.session_id = None;
            return false;
        }

        if let Some(session_id) = self.session_id {
            self.registry.record_activity(session_id);
        }

        let response = match msg {
            ClientMessage::Hello { protocol_version } => {
                match check_version_compatibility(protocol_version, PROTOCOL_VERSION) {
                    Ok(()) => ack("Hello"),
                    Err(e) => error(e.to_string()),
                }
            }

            ClientMessage::Connect {
                credential,
                card_token,
                metadata,
            } => self.connect(credential.as_deref(), &card_token, metadata),

            ClientMessage::Heartbeat => match self.session_id {
                Some(session_id) if self.registry.record_heartbeat(session_id) => ack("Heartbeat"),
                _ => error("No active session".to_string()),
            },

            ClientMessage::Subscribe { card_token } => match self.session_id {
                Some(session_id) => match self.registry.subscribe(session_id, &card_token) {
                    Ok(()) => ack("Subscribe"),
                    Err(e) => error(format!("Failed to subscribe: {}", e)),
                },
                None => error("No active session".to_string()),
            },

            ClientMessage::Unsubscribe { card_token } => match self.session_id {
                Some(session_id) if self.registry.unsubscribe(session_id, &card_token) => {
                    ack("Unsubscribe")
                }
                Some(_) => error(format!("Not subscribed to {}", card_token)),
                None => error("No active session".to_string()),
            },

            ClientMessage::PublishTransaction { card_token, event } => {
                self.publish(&card_token, &event)
            }

            ClientMessage::GetMetrics => Some(ServerMessage::Metrics(self.registry.get_metrics())),

            ClientMessage::ListConnections => Some(ServerMessage::Connections {
                connections: self.registry.get_all_connections(),
            }),

            ClientMessage::GetHealth { session_id } => Some(ServerMessage::Health {
                health: self.registry.get_connection_health(session_id),
            }),

            ClientMessage::Disconnect { session_id, reason } => {
                let reason = DisconnectReason::from(reason.as_str());
                if self.registry.handle_disconnection(session_id, reason) {
                    if self.session_id == Some(session_id) {
                        self.session_id = None;
                    }
                    ack("Disconnect")
                } else {
                    error(format!("Unknown session: {}", session_id))
                }
            }

            ClientMessage::Detach => {
                tracing::info!("Client {} requested detach", self.id);
                self.reply(ServerMessage::Ack {
                    for_command: "Detach".to_string(),
                });
                if let Some(session_id) = self.session_id.take() {
                    self.registry
                        .handle_disconnection(session_id, DisconnectReason::ClientClosed);
                }
                return false;
            }
        };

        if let Some(msg) = response {
            self.reply(msg);
        }
        true
    }

    fn connect(
        &mut self,
        credential: Option<&str>,
        card_token: &str,
        metadata: SessionMetadata,
    ) -> Option<ServerMessage> {
        if !self.registry.authenticate_connection(credential) {
            tracing::warn!("Client {} failed authentication", self.id);
            return error("Authentication failed".to_string());
        }
        if let Some(existing) = self.session_id {
            return error(format!("Session {} already open on this connection", existing));
        }

        let transport: Arc<dyn Transport> = self.transport.clone();
        match self.registry.create_connection(transport, card_token, metadata) {
            // ConnectionEstablished was already pushed by the registry
            Ok(info) => {
                self.session_id = Some(info.session_id);
                None
            }
            Err(e) => error(format!("Failed to open session: {}", e)),
        }
    }

    fn publish(&self, card_token: &str, event: &RawTransaction) -> Option<ServerMessage> {
        match self.registry.broadcaster().broadcast_alert(card_token, event) {
            Ok(report) => Some(ServerMessage::BroadcastResult(report)),
            Err(e) => {
                tracing::error!("Broadcast for card {} failed: {}", card_token, e);
                error(format!("Broadcast failed: {}", e))
            }
        }
    }

    /// Release whatever this connection still holds
    pub fn close(&mut self, reason: DisconnectReason) {
        if let Some(session_id) = self.session_id.take() {
            self.registry.handle_disconnection(session_id, reason);
        }
        self.transport.close();
    }
}

fn ack(command: &str) -> Option<ServerMessage> {
    Some(ServerMessage::Ack {
        for_command: command.to_string(),
    })
}

fn error(message: String) -> Option<ServerMessage> {
    Some(ServerMessage::Error { message })
}

/// Serve one accepted socket until it closes
pub async fn handle_client(
    stream: UnixStream,
    registry: SessionRegistry,
    outbound_buffer: usize,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();

    let (transport, rx) = ChannelTransport::pair(outbound_buffer);
    let transport = Arc::new(transport);
    let mut writer_handle = tokio::spawn(client_writer_task(writer, rx));

    let mut connection = ClientConnection::new(Arc::clone(&transport), registry);
    let client_id = connection.id();
    tracing::info!("Client connected: {}", client_id);

    connection.reply(ServerMessage::Welcome {
        server_id: client_id,
        protocol_version: PROTOCOL_VERSION,
    });

    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(Some(bytes)) => match deserialize::<ClientMessage>(&bytes) {
                Ok(msg) => {
                    if !connection.process_message(msg) {
                        break DisconnectReason::ClientClosed;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to parse message: {}", e);
                    connection.reply(ServerMessage::Error {
                        message: format!("Invalid message: {}", e),
                    });
                }
            },
            Ok(None) => {
                tracing::info!("Client disconnected: {}", client_id);
                break DisconnectReason::ClientClosed;
            }
            Err(e) => {
                tracing::error!("Error reading from client: {}", e);
                break DisconnectReason::TransportError;
            }
        }
    };

    connection.close(reason);

    // Closing the transport lets the writer flush what is buffered and stop
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer_handle)
        .await
        .is_err()
    {
        tracing::warn!("Writer for client {} did not drain in time", client_id);
        writer_handle.abort();
    }

    tracing::info!("Client handler finished: {}", client_id);
    Ok(())
}
