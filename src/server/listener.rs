//! Unix socket listener and server main loop

use super::connection::handle_client;
use crate::broadcast::AlertBroadcaster;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::registry::SessionRegistry;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

/// Unix socket server for agents, admin tools and event publishers
pub struct ServerListener {
    socket_path: PathBuf,
    config: Config,
    registry: SessionRegistry,
}

impl ServerListener {
    /// Build the broadcaster and registry from `config`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config, socket_path: PathBuf) -> Self {
        let metrics = Arc::new(Metrics::new());
        let broadcaster = Arc::new(AlertBroadcaster::new(config.delivery.clone(), metrics));
        let registry = SessionRegistry::new(config.monitor.clone(), broadcaster);

        Self {
            socket_path,
            config,
            registry,
        }
    }

    /// Registry shared by every connection
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Check if socket already exists (another server running)
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run the server until `shutdown_rx` fires
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.socket_path.exists() {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => {
                    return Err(anyhow!(
                        "Server already listening on {:?}",
                        self.socket_path
                    ));
                }
                Err(_) => {
                    tracing::info!("Removing stale socket: {:?}", self.socket_path);
                    std::fs::remove_file(&self.socket_path)?;
                }
            }
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Server listening on {:?}", self.socket_path);

        let outbound_buffer = self.config.delivery.outbound_buffer;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let registry = self.registry.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, registry, outbound_buffer).await {
                                    tracing::error!("Client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        self.cleanup();

        Ok(())
    }

    /// Close every session and remove the socket file
    fn cleanup(&self) {
        tracing::info!("Cleaning up server resources");

        self.registry.shutdown();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::error!("Failed to remove socket file: {}", e);
            }
        }
    }
}
