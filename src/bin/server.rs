//! cardwatch-server - owns the session registry and alert broadcaster

use anyhow::Result;
use cardwatch::config::Config;
use cardwatch::server::ServerListener;
use clap::Parser;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "cardwatch-server")]
#[command(about = "cardwatch alert server")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Socket path override
    #[arg(long)]
    socket: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let socket_path = cli.socket.unwrap_or_else(|| config.socket_path());

    tracing::info!(
        "Starting cardwatch server (keep-alive {}s, health check {}s)",
        config.monitor.keep_alive_interval_secs,
        config.monitor.health_check_interval_secs
    );

    let server = ServerListener::new(config, socket_path);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    server.run(shutdown_rx).await
}
