//! Session configuration and credentials.
//!
//! `SessionConfig` deserializes from the `[session]` table of a TOML file
//! with every field optional; durations are milliseconds.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_protocol::Implementation;
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::error::SessionError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    #[serde(default = "d_endpoint")]
    pub endpoint: String,
    /// Name reported as `serverInfo.name` / `clientInfo.name`.
    #[serde(default = "d_server_name")]
    pub server_name: String,
    #[serde(default = "d_server_version")]
    pub server_version: String,
    #[serde(default = "d_true")]
    pub auto_reconnect: bool,
    #[serde(default = "d_1000")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "d_30000")]
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed attempts before giving up.  `0` means unlimited.
    #[serde(default = "d_10")]
    pub max_reconnect_attempts: u32,
    /// `0` disables the heartbeat.
    #[serde(default = "d_30000")]
    pub heartbeat_interval_ms: u64,
    /// Per-request timeout; also bounds connection establishment.
    #[serde(default = "d_30000")]
    pub request_timeout_ms: u64,
    /// Maximum silence since the last liveness acknowledgment.
    #[serde(default = "d_90000")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "d_max_tools")]
    pub max_concurrent_tools: usize,
    /// Inbound frames larger than this are dropped before parsing.
    #[serde(default = "d_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: d_endpoint(),
            server_name: d_server_name(),
            server_version: d_server_version(),
            auto_reconnect: true,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            request_timeout_ms: 30_000,
            liveness_timeout_ms: 90_000,
            max_concurrent_tools: d_max_tools(),
            max_frame_bytes: d_max_frame_bytes(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| SessionError::Config(format!("endpoint {:?}: {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SessionError::Config(format!(
                "endpoint must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        if self.server_name.trim().is_empty() {
            return Err(SessionError::Config("server_name must not be empty".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(SessionError::Config("request_timeout_ms must be positive".into()));
        }
        if self.max_concurrent_tools == 0 {
            return Err(SessionError::Config("max_concurrent_tools must be positive".into()));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(SessionError::Config(
                "reconnect_base_delay_ms exceeds reconnect_max_delay_ms".into(),
            ));
        }
        if self.heartbeat_interval_ms > 0 && self.liveness_timeout_ms == 0 {
            return Err(SessionError::Config(
                "liveness_timeout_ms must be positive when the heartbeat is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// `None` when the heartbeat is disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn server_info(&self) -> Implementation {
        Implementation {
            name: self.server_name.clone(),
            version: self.server_version.clone(),
        }
    }

    /// Endpoint with the bearer token appended as the `token` query parameter.
    pub fn connection_url(&self, credential: &Credential) -> Result<Url, SessionError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| SessionError::Config(format!("endpoint {:?}: {e}", self.endpoint)))?;
        url.query_pairs_mut().append_pair("token", credential.expose());
        Ok(url)
    }
}

/// Opaque bearer token.  Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Result<Self, SessionError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(SessionError::InvalidCredential);
        }
        Ok(Self(token))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// The URL with any `token` query value masked, for logging.
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    if pairs.is_empty() {
        return redacted.to_string();
    }
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

// ── serde default helpers ───────────────────────────────────────────

fn d_endpoint() -> String {
    "ws://localhost:8080/mcp".into()
}
fn d_server_name() -> String {
    "tether".into()
}
fn d_server_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}
fn d_true() -> bool {
    true
}
fn d_10() -> u32 {
    10
}
fn d_1000() -> u64 {
    1_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_90000() -> u64 {
    90_000
}
fn d_max_tools() -> usize {
    10
}
fn d_max_frame_bytes() -> usize {
    4 * 1024 * 1024
}
