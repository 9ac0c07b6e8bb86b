//! Reference MCP tool node built on `tether-session`.
//!
//! Connects to an MCP peer over WebSocket, keeps the session alive, and
//! serves a handful of demo tools:
//!
//! - `echo` — return the `msg` argument
//! - `add`  — sum two numbers
//! - `time` — current UTC time (RFC 3339)
//!
//! Usage:
//!   TETHER_TOKEN=secret tether-node --endpoint ws://localhost:8080/mcp
//!   tether-node --config node.toml --log-json
//!
//! Env vars:
//!   TETHER_TOKEN     — bearer token (required)
//!   TETHER_ENDPOINT  — overrides `session.endpoint` from the config file
//!   TETHER_CONFIG    — config path when `--config` is not given

mod tools;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tether_session::{SessionBuilder, SessionConfig, SessionEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Persistent MCP tool node.
#[derive(Debug, Parser)]
#[command(name = "tether-node", version, about)]
struct Cli {
    /// TOML file with a `[session]` table.
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,
    /// WebSocket endpoint (overrides the config file).
    #[arg(long, env = "TETHER_ENDPOINT")]
    endpoint: Option<String>,
    /// Bearer token appended as the `token` query parameter.
    #[arg(long, env = "TETHER_TOKEN", hide_env_values = true)]
    token: String,
    /// Emit structured JSON logs instead of human-readable lines.
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Default, Deserialize)]
struct NodeFile {
    #[serde(default)]
    session: SessionConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SessionConfig::default(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }

    let session = tools::register_all(SessionBuilder::from_config(config).token(cli.token))
        .build()
        .context("building session")?;

    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!(endpoint = %session.config().endpoint, "connecting");
    session.connect().await.context("initial connect")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    session.disconnect().await;

    let stats = session.stats();
    tracing::info!(
        connects = stats.connects,
        tool_calls = stats.tools.total_calls,
        failed = stats.tools.failed_calls,
        "session closed"
    );
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<SessionConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse_config(raw: &str) -> anyhow::Result<SessionConfig> {
    let file: NodeFile = toml::from_str(raw)?;
    Ok(file.session)
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connected { url } => tracing::info!(%url, "connected"),
        SessionEvent::Disconnected { reason } => tracing::warn!(%reason, "disconnected"),
        SessionEvent::Error { kind, message } => tracing::error!(%kind, %message, "session error"),
        SessionEvent::Reconnecting { attempt, delay_ms } => {
            tracing::info!(attempt, delay_ms, "reconnecting")
        }
        SessionEvent::ReconnectGaveUp { attempts, elapsed_ms } => {
            tracing::error!(attempts, elapsed_ms, "giving up on reconnect")
        }
        SessionEvent::ToolCalled { name, duration_ms, is_error } => {
            tracing::debug!(%name, duration_ms, is_error, "tool called")
        }
        other => tracing::debug!(event = ?other, "session event"),
    }
}
