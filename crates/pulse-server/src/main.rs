//! # pulse-server
//!
//! Pulse gateway binary — loads configuration, wires the broker core, and
//! starts the HTTP/WebSocket server.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use pulse_broker::dispatcher::{EventHandler, HandlerError, HandlerRegistration};
use pulse_server::config::GatewayConfig;
use pulse_server::metrics;
use pulse_server::server::GatewayServer;

/// Pulse real-time event gateway.
#[derive(Parser, Debug)]
#[command(name = "pulse-server", about = "Pulse real-time event gateway")]
struct Cli {
    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides config; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum concurrent connections (overrides config).
    #[arg(long)]
    max_connections: Option<usize>,
}

impl Cli {
    fn default_config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".pulse").join("gateway.json")
    }
}

/// Global handler that traces every domain event flowing through the
/// dispatcher.
struct AuditHandler;

#[async_trait]
impl EventHandler for AuditHandler {
    async fn handle(&self, payload: &Value) -> std::result::Result<Value, HandlerError> {
        tracing::debug!(payload = %payload, "event dispatched");
        Ok(Value::Null)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = args.config.unwrap_or_else(Cli::default_config_path);
    let mut config =
        GatewayConfig::load_from_path(&config_path).context("Failed to load config")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }

    let metrics_handle = metrics::install_recorder();

    let server = GatewayServer::new(config).with_metrics_handle(metrics_handle);
    let _ = server
        .dispatcher()
        .registry()
        .register_global(HandlerRegistration::new("audit", AuditHandler).with_priority(i32::MIN));

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Pulse gateway listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_defaults_to_no_overrides() {
        let cli = Cli::parse_from(["pulse-server"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.config.is_none());
        assert!(cli.max_connections.is_none());
    }

    #[test]
    fn cli_custom_host_and_port() {
        let cli = Cli::parse_from(["pulse-server", "--host", "0.0.0.0", "--port", "9200"]);
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.port, Some(9200));
    }

    #[test]
    fn cli_config_path() {
        let cli = Cli::parse_from(["pulse-server", "--config", "/tmp/gateway.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/gateway.json")));
    }

    #[test]
    fn cli_max_connections() {
        let cli = Cli::parse_from(["pulse-server", "--max-connections", "500"]);
        assert_eq!(cli.max_connections, Some(500));
    }

    #[test]
    fn default_config_path_under_pulse_dir() {
        let path = Cli::default_config_path();
        assert!(path.to_string_lossy().contains(".pulse"));
        assert!(path.to_string_lossy().ends_with("gateway.json"));
    }

    #[tokio::test]
    async fn audit_handler_accepts_any_payload() {
        let result = AuditHandler.handle(&serde_json::json!({"x": 1})).await;
        assert!(result.is_ok());
    }
}
