//! sockhub - a WebSocket connection hub server.
//!
//! Accepts WebSocket clients, negotiates a subprotocol per connection, and
//! relays each inbound text message to the sender's key group. Connection
//! state is observable over plain HTTP (`/healthz`, `/stats`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sockhub::{
    api,
    config::{ConfigError, FileConfig},
    hub::{ConnectionHub, HubConfig, SubProtocol, DEFAULT_KEEP_ALIVE, DEFAULT_RECEIVE_BUFFER_SIZE},
    relay::RelayEvents,
};

/// sockhub - a WebSocket connection hub server.
#[derive(Parser, Debug)]
#[command(name = "sockhub", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the hub server
    Serve {
        /// Address to bind the HTTP/WebSocket listener
        #[arg(long, env = "SOCKHUB_BIND")]
        bind: Option<SocketAddr>,

        /// Path to a TOML config file
        #[arg(long, env = "SOCKHUB_CONFIG")]
        config: Option<PathBuf>,

        /// Maximum size of a single received frame, in bytes
        #[arg(long)]
        receive_buffer_size: Option<usize>,

        /// Seconds between transport keep-alive pings
        #[arg(long)]
        keep_alive_secs: Option<u64>,

        /// Subprotocol to offer, in preference order (repeatable)
        #[arg(long = "subprotocol")]
        subprotocols: Vec<String>,
    },
}

#[derive(Error, Debug)]
enum ServeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> Result<(), ServeError> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve {
            bind,
            config,
            receive_buffer_size,
            keep_alive_secs,
            subprotocols,
        }) => run_serve(bind, config, receive_buffer_size, keep_alive_secs, subprotocols).await,
        None => run_serve(None, None, None, None, Vec::new()).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sockhub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_serve(
    bind: Option<SocketAddr>,
    config_path: Option<PathBuf>,
    receive_buffer_size: Option<usize>,
    keep_alive_secs: Option<u64>,
    subprotocols: Vec<String>,
) -> Result<(), ServeError> {
    tracing::info!("sockhub starting");

    let file = match &config_path {
        Some(path) => FileConfig::load(path)?.unwrap_or_default(),
        None => FileConfig::default(),
    };

    // Flags override file values; built-in defaults fill the rest.
    let bind = bind
        .or(file.bind)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));
    let hub_config = HubConfig {
        receive_buffer_size: receive_buffer_size
            .or(file.receive_buffer_size)
            .unwrap_or(DEFAULT_RECEIVE_BUFFER_SIZE),
        keep_alive_interval: keep_alive_secs
            .or(file.keep_alive_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_KEEP_ALIVE),
    };
    let supported: Vec<SubProtocol> = if subprotocols.is_empty() {
        file.subprotocols
    } else {
        subprotocols
    }
    .into_iter()
    .map(SubProtocol::new)
    .collect();

    if !supported.is_empty() {
        tracing::info!(
            protocols = ?supported.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "subprotocol negotiation enabled"
        );
    }

    let shutdown = CancellationToken::new();
    let hub = ConnectionHub::with_config(hub_config);
    let state = api::AppState {
        hub: hub.clone(),
        events: Arc::new(RelayEvents::new(hub, shutdown.clone())),
        supported: Arc::new(supported),
        shutdown: shutdown.clone(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(?e, "failed to listen for Ctrl+C");
    } else {
        tracing::info!("received Ctrl+C");
    }

    // Cancel in-flight receive loops so handlers flush close frames, then
    // let the listener drain.
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.await??;
    tracing::info!("sockhub exiting");
    Ok(())
}
