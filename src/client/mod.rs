//! Client - agent watcher and admin commands over the server socket

use crate::alert::RawTransaction;
use crate::protocol::{recv_message, send_message, ClientMessage, ServerMessage, PROTOCOL_VERSION};
use crate::registry::SessionMetadata;
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A connection to `cardwatch-server`
pub struct Client {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    server_id: Uuid,
}

impl Client {
    /// Connect and complete the handshake
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to {:?}", socket_path))?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            reader,
            writer,
            server_id: Uuid::nil(),
        };

        match client.recv().await? {
            ServerMessage::Welcome {
                server_id,
                protocol_version,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    bail!(
                        "Protocol version mismatch: server={}, client={}",
                        protocol_version,
                        PROTOCOL_VERSION
                    );
                }
                client.server_id = server_id;
            }
            other => bail!("Expected Welcome, got {}", other.kind()),
        }

        client
            .send(&ClientMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;
        client.expect_ack("Hello").await?;

        Ok(client)
    }

    /// Split back into the raw socket halves
    pub fn into_parts(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        (self.reader, self.writer)
    }

    /// Id the server assigned to this socket
    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        send_message(&mut self.writer, msg).await
    }

    /// Next message from the server; an error if the server hung up
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        recv_message(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow!("Server closed the connection"))
    }

    /// Send a request and return the first reply that is not session traffic
    pub async fn request(&mut self, msg: &ClientMessage) -> Result<ServerMessage> {
        self.send(msg).await?;
        loop {
            match self.recv().await? {
                ServerMessage::Ping { .. } | ServerMessage::Alert(_) => continue,
                ServerMessage::Error { message } => bail!(message),
                reply => return Ok(reply),
            }
        }
    }

    async fn expect_ack(&mut self, command: &str) -> Result<()> {
        match self.recv().await? {
            ServerMessage::Ack { for_command } if for_command == command => Ok(()),
            ServerMessage::Error { message } => bail!(message),
            other => bail!("Expected Ack for {}, got {}", command, other.kind()),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Open a session for `card_token` and print every alert as JSON until
/// the server closes the session.
pub async fn watch(
    socket_path: &Path,
    credential: &str,
    card_token: &str,
    metadata: SessionMetadata,
    heartbeat_every: Duration,
) -> Result<()> {
    let mut client = Client::connect(socket_path).await?;
    client
        .send(&ClientMessage::Connect {
            credential: Some(credential.to_string()),
            card_token: card_token.to_string(),
            metadata,
        })
        .await?;

    match client.recv().await? {
        ServerMessage::ConnectionEstablished { session } => {
            tracing::info!("Watching card {} as session {}", session.card_token, session.session_id);
        }
        ServerMessage::Error { message } => bail!(message),
        other => bail!("Expected ConnectionEstablished, got {}", other.kind()),
    }

    // Frame reads are not cancel safe, so they get their own task
    let (mut reader, mut writer) = client.into_parts();
    let (incoming_tx, mut incoming) = mpsc::channel::<ServerMessage>(64);
    let reader_task = tokio::spawn(async move {
        while let Ok(Some(msg)) = recv_message::<_, ServerMessage>(&mut reader).await {
            if incoming_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut heartbeat = tokio::time::interval(heartbeat_every);
    heartbeat.tick().await;

    let result = loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                send_message(&mut writer, &ClientMessage::Heartbeat).await?;
            }

            msg = incoming.recv() => match msg {
                Some(ServerMessage::Alert(alert)) => print_json(&alert)?,
                Some(ServerMessage::Recovery { attempt, .. }) => {
                    tracing::warn!("Server requested recovery (attempt {})", attempt);
                    send_message(&mut writer, &ClientMessage::Heartbeat).await?;
                }
                Some(ServerMessage::Disconnected { reason, .. }) => {
                    tracing::info!("Session closed by server: {}", reason);
                    break Ok(());
                }
                Some(ServerMessage::Error { message }) => {
                    tracing::warn!("Server error: {}", message);
                }
                Some(_) => {}
                None => break Err(anyhow!("Server closed the connection")),
            },

            _ = tokio::signal::ctrl_c() => {
                send_message(&mut writer, &ClientMessage::Detach).await?;
                break Ok(());
            }
        }
    };

    reader_task.abort();
    result
}

/// Publish a transaction event and print the broadcast report
pub async fn publish(socket_path: &Path, card_token: &str, event: RawTransaction) -> Result<()> {
    let mut client = Client::connect(socket_path).await?;
    let reply = client
        .request(&ClientMessage::PublishTransaction {
            card_token: card_token.to_string(),
            event,
        })
        .await?;

    match reply {
        ServerMessage::BroadcastResult(report) => print_json(&report),
        other => bail!("Unexpected reply: {}", other.kind()),
    }
}

/// Print server metrics
pub async fn metrics(socket_path: &Path) -> Result<()> {
    let mut client = Client::connect(socket_path).await?;
    match client.request(&ClientMessage::GetMetrics).await? {
        ServerMessage::Metrics(snapshot) => print_json(&snapshot),
        other => bail!("Unexpected reply: {}", other.kind()),
    }
}

/// Print every live session
pub async fn connections(socket_path: &Path) -> Result<()> {
    let mut client = Client::connect(socket_path).await?;
    match client.request(&ClientMessage::ListConnections).await? {
        ServerMessage::Connections { connections } => print_json(&connections),
        other => bail!("Unexpected reply: {}", other.kind()),
    }
}

/// Print one session's health
pub async fn health(socket_path: &Path, session_id: Uuid) -> Result<()> {
    let mut client = Client::connect(socket_path).await?;
    match client.request(&ClientMessage::GetHealth { session_id }).await? {
        ServerMessage::Health { health: Some(health) } => print_json(&health),
        ServerMessage::Health { health: None } => bail!("Unknown session: {}", session_id),
        other => bail!("Unexpected reply: {}", other.kind()),
    }
}

/// Force a session closed
pub async fn disconnect(socket_path: &Path, session_id: Uuid, reason: &str) -> Result<()> {
    let mut client = Client::connect(socket_path).await?;
    client
        .request(&ClientMessage::Disconnect {
            session_id,
            reason: reason.to_string(),
        })
        .await?;
    println!("cardwatch: session {} disconnected", session_id);
    Ok(())
}
