//! relay-server: real-time WebSocket connection multiplexer.
//!
//! # Usage
//!
//! ```text
//! relay-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>            TOML config file [default: relay-server.toml]
//!   --bind <ADDR>              Override server.bind_address
//!   --port <PORT>              Override server.port
//!   --max-connections <N>      Override server.max_connections
//!   --require-auth             Force auth.required = true
//!   --auth-token <TOKEN>       Override auth.token
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable               | Option              |
//! |------------------------|---------------------|
//! | `RELAY_CONFIG`         | `--config`          |
//! | `RELAY_BIND`           | `--bind`            |
//! | `RELAY_PORT`           | `--port`            |
//! | `RELAY_MAX_CONNECTIONS`| `--max-connections` |
//! | `RELAY_AUTH_TOKEN`     | `--auth-token`      |
//!
//! `RUST_LOG` takes precedence over `logging.level`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use relay_server::application::{Hub, ServerEvent, StorageBinding};
use relay_server::domain::{load_config, ServerConfig};
use relay_server::infrastructure::{run_server, MemoryStore};

/// Error text returned to client `request` frames; this binary registers no
/// request endpoints.
const NO_ENDPOINT_ERROR: &str = "no handler for endpoint";

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "relay-server",
    about = "Real-time WebSocket connection multiplexer",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "relay-server.toml", env = "RELAY_CONFIG")]
    config: PathBuf,

    /// IP address to bind to.
    #[arg(long, env = "RELAY_BIND")]
    bind: Option<String>,

    /// TCP port to listen on.
    #[arg(long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Live connections beyond this are refused.
    #[arg(long, env = "RELAY_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Require token authentication.
    #[arg(long)]
    require_auth: bool,

    /// Shared auth token.
    #[arg(long, env = "RELAY_AUTH_TOKEN")]
    auth_token: Option<String>,
}

impl Cli {
    /// Loads the config file and applies command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// fails validation.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        self.apply_overrides(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn apply_overrides(self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(max) = self.max_connections {
            config.server.max_connections = max;
        }
        if self.require_auth {
            config.auth.required = true;
        }
        if let Some(token) = self.auth_token {
            config.auth.token = Some(token);
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_server_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(
        "relay-server {} starting on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.server.bind_address,
        config.server.port
    );

    let storage = config.storage.enabled.then(|| {
        if !config.storage.encrypted_fields.is_empty() {
            warn!("storage.encrypted_fields is set but no field encryptor is installed; fields are stored as-is");
        }
        StorageBinding::new(Arc::new(MemoryStore::new()))
    });

    let (hub, events) = Hub::new(config, storage);
    tokio::spawn(consume_events(events));

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let result = run_server(Arc::clone(&hub), running).await;
    hub.shutdown();
    result?;

    info!("relay-server stopped");
    Ok(())
}

/// Logs hub events.  Client requests are answered with a failure since this
/// binary has no endpoints of its own.
async fn consume_events(mut events: mpsc::Receiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::ClientConnected { session } => {
                debug!(
                    "event: {} connected (user agent {:?})",
                    session.connection_id, session.user_agent
                );
            }
            ServerEvent::ClientDisconnected {
                connection_id,
                stats,
            } => {
                debug!(
                    "event: {connection_id} disconnected after {:?}",
                    stats.duration
                );
            }
            ServerEvent::RequestReceived {
                connection_id,
                endpoint,
                responder,
                ..
            } => {
                debug!("event: request {endpoint} from {connection_id} has no handler");
                responder.fail(NO_ENDPOINT_ERROR);
            }
            other => debug!("event: {}", other.name()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
