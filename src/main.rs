//! cardwatch - watch cards and administer a running cardwatch server

use anyhow::{Context, Result};
use cardwatch::alert::RawTransaction;
use cardwatch::client;
use cardwatch::config::Config;
use cardwatch::registry::SessionMetadata;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "cardwatch")]
#[command(about = "Real-time card transaction alerts for monitoring agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server socket override
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session for a card and print alerts as they arrive
    Watch {
        /// Card token to monitor
        card_token: String,

        /// Credential, e.g. "Bearer <token>"
        #[arg(long)]
        credential: String,

        /// Agent identifier attached to the session
        #[arg(long)]
        agent_id: Option<String>,

        /// Seconds between heartbeats
        #[arg(long, default_value_t = 20)]
        heartbeat: u64,
    },
    /// Publish a transaction event read from a JSON file ("-" for stdin)
    Publish {
        /// Card token to publish for
        card_token: String,

        /// JSON file holding the raw transaction
        file: PathBuf,
    },
    /// Show server metrics
    Metrics,
    /// List live sessions
    Connections,
    /// Show one session's health
    Health {
        session_id: Uuid,
    },
    /// Force a session closed
    Disconnect {
        session_id: Uuid,

        /// Reason recorded for the disconnect
        #[arg(long, default_value = "admin")]
        reason: String,
    },
}

fn read_event(file: &PathBuf) -> Result<RawTransaction> {
    let content = if file.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?
    };
    Ok(serde_json::from_str(&content)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let socket_path = cli.socket.unwrap_or_else(|| config.socket_path());

    match cli.command {
        Commands::Watch {
            card_token,
            credential,
            agent_id,
            heartbeat,
        } => {
            let metadata = SessionMetadata {
                agent_id,
                ..Default::default()
            };
            client::watch(
                &socket_path,
                &credential,
                &card_token,
                metadata,
                Duration::from_secs(heartbeat.max(1)),
            )
            .await
        }
        Commands::Publish { card_token, file } => {
            let event = read_event(&file)?;
            client::publish(&socket_path, &card_token, event).await
        }
        Commands::Metrics => client::metrics(&socket_path).await,
        Commands::Connections => client::connections(&socket_path).await,
        Commands::Health { session_id } => client::health(&socket_path, session_id).await,
        Commands::Disconnect { session_id, reason } => {
            client::disconnect(&socket_path, session_id, &reason).await
        }
    }
}
