//! relay-proxy
//!
//! Local SOCKS5/HTTP proxy that tunnels every client connection through a
//! WebSocket relay worker.
//!
//! This binary:
//! - Merges `config.json` and command line options
//! - Accepts client connections on one listener (SOCKS5 or HTTP)
//! - Opens one relay tunnel per client, retrying with backoff until it opens

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_proxy::config::{Cli, Config, FileConfig};
use relay_proxy::proxy::{Listener, ListenerConfig, WebSocketConnector};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A broken config file is reported once logging is up, then ignored.
    let (file, file_error) = match FileConfig::read(&cli.config) {
        Ok(file) => (file.unwrap_or_default(), None),
        Err(e) => (FileConfig::default(), Some(e)),
    };
    let config = Config::resolve(cli, file)?;

    init_tracing(&config);

    if let Some(e) = file_error {
        warn!(
            error = %format!("{e:#}"),
            "Failed to read config file, continuing with defaults and CLI args"
        );
    }

    // tokio-tungstenite uses rustls for wss:// relays.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(
        kind = %config.kind,
        workers = config.workers.len(),
        strategy = %config.strategy,
        retry_enabled = config.retry.enabled,
        max_retries = config.retry.max_retries,
        "Configuration loaded"
    );

    let connector = Arc::new(WebSocketConnector::new(config.authorization.clone()));
    let listener = Listener::bind(
        ListenerConfig::new(config.bind_addr),
        Arc::new(config.tunnel_config()),
        connector,
    )
    .await
    .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    let listener = Arc::new(listener);
    info!(
        "{} proxy server listening on {}",
        config.kind,
        listener.local_addr()?
    );

    listener.run().await.context("Listener failed")
}

/// `RUST_LOG` wins; otherwise `debug` when verbose, `info` when not.
fn init_tracing(config: &Config) {
    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());

    let json = config.log_json.then(|| tracing_subscriber::fmt::layer().json());
    let text = (!config.log_json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}
