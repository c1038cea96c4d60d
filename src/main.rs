//! wsio-monitor
//!
//! Keeps one WebSocket channel alive and logs every connection state change.
//!
//! Usage:
//!   wsio-monitor --endpoint wss://api.example.com --path /ws --query token=abc
//!
//! Environment:
//!   WSIO_ENDPOINT - Endpoint URL (scheme + host)
//!   WSIO_PATH - Channel path (default: /)
//!   WSIO_* - Manager tuning, see `ManagerConfig::from_env`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use wsio_client::{
    ConnectionManager, ConnectionParams, ManagerConfig, StaticResolver, WsChannelFactory,
};

#[derive(Parser, Debug)]
#[command(name = "wsio-monitor")]
#[command(about = "Keep a WebSocket channel connected and report its state")]
struct Args {
    /// Endpoint URL, e.g. wss://api.example.com
    #[arg(long, env = "WSIO_ENDPOINT")]
    endpoint: String,

    /// Channel path on the endpoint
    #[arg(long, env = "WSIO_PATH", default_value = "/")]
    path: String,

    /// Query parameter as key=value (repeatable)
    #[arg(long = "query", value_parser = parse_query_pair)]
    query: Vec<(String, String)>,

    /// Identity tag for log records
    #[arg(long)]
    id: Option<String>,

    /// First retry delay in milliseconds
    #[arg(long)]
    initial_reconnect_ms: Option<u64>,

    /// Retry delay ceiling in milliseconds
    #[arg(long)]
    max_reconnect_ms: Option<u64>,

    /// Verbose diagnostics
    #[arg(long)]
    local: bool,

    /// Seconds between status lines (0 disables)
    #[arg(long, env = "WSIO_STATUS_SECS", default_value = "30")]
    status_secs: u64,
}

fn parse_query_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("tokio_tungstenite=warn".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = ManagerConfig::from_env();
    if let Some(id) = args.id {
        config.id = id;
    }
    if let Some(ms) = args.initial_reconnect_ms {
        config.initial_reconnect_period_ms = ms;
    }
    if let Some(ms) = args.max_reconnect_ms {
        config.max_reconnect_period_ms = ms;
    }
    config.local |= args.local;

    let mut params = ConnectionParams::new(args.endpoint, args.path);
    for (key, value) in args.query {
        params = params.with_query(key, value);
    }

    info!("Starting wsio-monitor");
    info!("  Channel: {}", params.url()?);
    info!(
        "  Reconnect: {}ms initial, +{}ms, {}ms max",
        config.initial_reconnect_period_ms,
        config.reconnect_increment_ms,
        config.max_reconnect_period_ms
    );

    let (factory, mut messages) = WsChannelFactory::with_message_sink();
    let manager = ConnectionManager::spawn(
        config,
        Arc::new(StaticResolver::new(params)),
        Arc::new(factory),
    )?;

    let mut states = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match states.recv().await {
                Ok(state) => info!(%state, "connection_state"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "state_signal_lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            info!(bytes = message.len(), "message");
        }
    });

    manager.connect().await;

    let mut status = tokio::time::interval(Duration::from_secs(args.status_secs.max(1)));
    status.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            _ = status.tick(), if args.status_secs > 0 => {
                if let Some(snapshot) = manager.snapshot().await {
                    info!(
                        state = %snapshot.state,
                        delay_ms = snapshot.current_delay.as_millis() as u64,
                        disconnected_since = ?snapshot.audit_since(),
                        metrics = %manager.metrics().summary(),
                        "status"
                    );
                }
            }
        }
    }

    manager.close().await;
    info!(metrics = %manager.metrics().summary(), "wsio-monitor stopped");
    Ok(())
}
