//! callrec - one-to-one call signaling server with recording

use anyhow::{Context, Result};
use callrec::config::Config;
use callrec::media::{KurentoClient, MediaBackend};
use callrec::server::{Dispatcher, SignalingServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "callrec")]
#[command(about = "One-to-one call signaling server with composite recording and playback")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Media server WebSocket URI (overrides config)
    #[arg(short, long)]
    media_uri: Option<String>,

    /// Log at debug level by default
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(media_uri) = cli.media_uri {
        config.media.ws_uri = media_uri;
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let kurento = KurentoClient::connect(
        &config.media.ws_uri,
        config.media.request_timeout(),
        event_tx,
    )
    .await
    .context("Failed to connect to the media server")?
    .with_media_profile(config.recording.media_profile.clone());
    let backend: Arc<dyn MediaBackend> = Arc::new(kurento);

    let dispatcher = Arc::new(Dispatcher::new(backend, config.recording.clone()));
    let server = SignalingServer::new(config.server.clone(), dispatcher, event_rx);

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    tracing::info!("Starting callrec, media server at {}", config.media.ws_uri);
    server.run(shutdown_rx).await
}
