//! Session orchestrator. Owns the connection state machine and wires the
//! transport, router, tool registry and reconnection controller together.
//!
//! ```text
//! disconnected → connecting → connected → reconnecting → connecting …
//!                     │            │
//!                     └── error ◄──┘
//! ```
//!
//! Each connection gets a generation number and a cancellation token.  All
//! per-connection tasks (event loop, heartbeat) stop when the token is
//! cancelled, and teardown for a stale generation is a no-op, so a late
//! close notification can never tear down its successor.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tether_protocol::{methods, InitializeParams, InitializeResult, RequestId, PROTOCOL_VERSION};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{redact_url, Credential, SessionConfig};
use crate::error::SessionError;
use crate::events::{ConnectionState, EventBus, SessionEvent};
use crate::reconnect::{ReconnectController, ReconnectTarget};
use crate::router::{register_builtin_handlers, InitializeHandler, MessageRouter, MethodHandler, RouterStats};
use crate::tools::{ToolHandler, ToolInfo, ToolRegistry, ToolStats};
use crate::transport::{Connector, Transport, TransportEvent, WsConnector, CLOSE_ABNORMAL, CLOSE_NORMAL};

/// Close reason marking a caller-initiated disconnect.  Closures with this
/// reason never trigger auto-reconnect.
pub const MANUAL_DISCONNECT: &str = "manual disconnect";

/// Close code used when the heartbeat declares the peer dead.
const CLOSE_LIVENESS: u16 = 4000;

/// Window in which repeated unexpected closures collapse into one
/// reconnect scheduling call.
const RECONNECT_DEBOUNCE: Duration = Duration::from_millis(100);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stats
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: ConnectionState,
    pub connects: u64,
    pub disconnects: u64,
    pub reconnect_attempts: u32,
    pub heartbeats_sent: u64,
    pub liveness_failures: u64,
    /// Uptime of all finished connections.
    pub total_uptime_ms: u64,
    /// Uptime of the current connection, if any.
    pub current_uptime_ms: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnect_reason: Option<String>,
    pub router: RouterStats,
    pub tools: ToolStats,
}

#[derive(Default)]
struct Counters {
    connects: u64,
    disconnects: u64,
    heartbeats_sent: u64,
    liveness_failures: u64,
    total_uptime: Duration,
    last_connected_at: Option<DateTime<Utc>>,
    last_disconnect_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection bookkeeping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct Link {
    generation: u64,
    transport: Option<Arc<dyn Transport>>,
    cancel: CancellationToken,
    /// Child of `cancel`; replaced when the heartbeat restarts.
    heartbeat: Option<CancellationToken>,
    /// Set once the handshake completed on this connection.
    established: bool,
    connected_at: Option<Instant>,
    manual: bool,
    /// Bumped by every manual disconnect.  A connect that started under an
    /// older value gives up instead of installing its transport.
    disconnect_epoch: u64,
    debounce: Option<JoinHandle<()>>,
}

struct Teardown {
    transport: Arc<dyn Transport>,
    established: bool,
    manual: bool,
    uptime: Option<Duration>,
}

/// Undoes a connect whose future was dropped before it finished.
struct ConnectGuard<'a> {
    inner: &'a SessionInner,
    epoch: u64,
    generation: Option<u64>,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!("connect abandoned before completion");
        if let Some(td) = self.generation.and_then(|g| self.inner.teardown(g)) {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    td.transport.close(CLOSE_NORMAL, "connect abandoned").await;
                });
            }
        }
        // A manual disconnect already settled the state.
        if !self.inner.disconnected_since(self.epoch) {
            self.inner.leave_connecting(ConnectionState::Disconnected);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A persistent MCP session.  Cheap to clone; clones share one connection.
///
/// Create via [`SessionBuilder`](crate::builder::SessionBuilder) or
/// [`McpSession::new`].
#[derive(Clone)]
pub struct McpSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    me: Weak<SessionInner>,
    config: RwLock<SessionConfig>,
    credential: RwLock<Credential>,
    connector: Arc<dyn Connector>,
    router: Arc<MessageRouter>,
    tools: Arc<ToolRegistry>,
    reconnect: Arc<ReconnectController>,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    last_ack: Mutex<Instant>,
    peer_info: RwLock<Option<InitializeResult>>,
    counters: Mutex<Counters>,
}

impl McpSession {
    /// Session using the WebSocket connector.
    pub fn new(config: SessionConfig, credential: Credential) -> Result<Self, SessionError> {
        Self::with_connector(config, credential, Arc::new(WsConnector), EventBus::default())
    }

    /// Session using a custom [`Connector`].
    pub fn with_connector(
        config: SessionConfig,
        credential: Credential,
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let router = Arc::new(MessageRouter::new(config.request_timeout(), events.clone()));
        let tools = Arc::new(ToolRegistry::new(config.max_concurrent_tools, events.clone()));
        register_builtin_handlers(&router, config.server_info(), tools.clone());
        let reconnect = Arc::new(ReconnectController::new(
            config.reconnect_policy(),
            config.auto_reconnect,
            events.clone(),
        ));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new_cyclic(|me| SessionInner {
            me: me.clone(),
            config: RwLock::new(config),
            credential: RwLock::new(credential),
            connector,
            router,
            tools,
            reconnect,
            events,
            state,
            link: Mutex::new(Link::default()),
            last_ack: Mutex::new(Instant::now()),
            peer_info: RwLock::new(None),
            counters: Mutex::new(Counters::default()),
        });
        Ok(Self { inner })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Open the connection and perform the `initialize` handshake.
    ///
    /// Fails with `AlreadyConnected` while connecting or connected.  A
    /// failure here never starts auto-reconnect.
    pub async fn connect(&self) -> Result<(), SessionError> {
        // A reconnect attempt in progress owns the connecting state.
        if matches!(
            self.connection_state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Err(SessionError::AlreadyConnected);
        }
        self.inner.reconnect.cancel();
        self.inner.connect().await
    }

    /// Close the connection.  Never triggers auto-reconnect.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Connection state observer.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Apply a new configuration.  Timeouts, reconnect policy and the tool
    /// concurrency ceiling apply immediately and a live heartbeat restarts
    /// with the new interval; endpoint and frame limits apply on the next
    /// connect.
    pub fn reconfigure(&self, config: SessionConfig) -> Result<(), SessionError> {
        config.validate()?;
        let inner = &self.inner;
        inner.router.set_request_timeout(config.request_timeout());
        inner.router.register_handler(
            methods::INITIALIZE,
            Arc::new(InitializeHandler {
                server_info: config.server_info(),
            }),
        );
        inner.tools.set_max_concurrent(config.max_concurrent_tools);
        inner.reconnect.set_policy(config.reconnect_policy());
        inner.reconnect.set_enabled(config.auto_reconnect);
        {
            let mut link = inner.link.lock();
            if link.established {
                inner.start_heartbeat(&mut link, &config);
            }
        }
        *inner.config.write() = config;
        tracing::info!("session reconfigured");
        Ok(())
    }

    /// Replace the bearer credential used by the next connect.
    pub fn set_credential(&self, credential: Credential) {
        *self.inner.credential.write() = credential;
    }

    pub fn config(&self) -> SessionConfig {
        self.inner.config.read().clone()
    }

    /// What the peer reported in its `initialize` result.
    pub fn peer_info(&self) -> Option<InitializeResult> {
        self.inner.peer_info.read().clone()
    }

    pub fn stats(&self) -> SessionStats {
        let inner = &self.inner;
        let current = inner
            .link
            .lock()
            .connected_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let c = inner.counters.lock();
        SessionStats {
            state: self.connection_state(),
            connects: c.connects,
            disconnects: c.disconnects,
            reconnect_attempts: inner.reconnect.attempts(),
            heartbeats_sent: c.heartbeats_sent,
            liveness_failures: c.liveness_failures,
            total_uptime_ms: c.total_uptime.as_millis() as u64,
            current_uptime_ms: current.as_millis() as u64,
            last_connected_at: c.last_connected_at,
            last_disconnect_reason: c.last_disconnect_reason.clone(),
            router: inner.router.stats(),
            tools: inner.tools.stats(),
        }
    }

    // ── Tools ────────────────────────────────────────────────────────

    pub fn register_tool<T: ToolHandler>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: T,
    ) -> Result<(), SessionError> {
        self.inner.tools.register_tool(name, description, input_schema, handler)
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.inner.tools.unregister_tool(name)
    }

    pub fn set_tool_enabled(&self, name: &str, enabled: bool) -> bool {
        self.inner.tools.set_enabled(name, enabled)
    }

    pub fn tool_info(&self, name: &str) -> Option<ToolInfo> {
        self.inner.tools.info(name)
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.inner.tools
    }

    // ── Messaging ────────────────────────────────────────────────────

    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value, SessionError> {
        self.inner.router.send_request(method, params, None).await
    }

    /// Like [`send_request`](Self::send_request) with a caller-chosen id.
    pub async fn send_request_with_id(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, SessionError> {
        self.inner.router.send_request(method, params, Some(id)).await
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        self.inner.router.send_notification(method, params).await
    }

    /// Install a handler for an inbound method, replacing any built-in.
    pub fn register_handler(&self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.inner.router.register_handler(method, handler)
    }

    pub fn unregister_handler(&self, method: &str) -> bool {
        self.inner.router.unregister_handler(method)
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.inner.router
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl SessionInner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = %next, "connection state changed");
            self.events.emit(SessionEvent::StatusChange { state: next });
        }
    }

    /// Atomically move to `connecting`, refusing if already busy.
    fn begin_connect(&self) -> Result<(), SessionError> {
        let mut busy = false;
        let changed = self.state.send_if_modified(|state| match *state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                busy = true;
                false
            }
            _ => {
                *state = ConnectionState::Connecting;
                true
            }
        });
        if busy {
            return Err(SessionError::AlreadyConnected);
        }
        if changed {
            self.events.emit(SessionEvent::StatusChange {
                state: ConnectionState::Connecting,
            });
        }
        Ok(())
    }

    /// Move from `connecting` to `next`; no-op from any other state.
    fn leave_connecting(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(state = %next, "connection state changed");
            self.events.emit(SessionEvent::StatusChange { state: next });
        }
    }

    fn disconnected_since(&self, epoch: u64) -> bool {
        self.link.lock().disconnect_epoch != epoch
    }

    /// Report a connect failure, unless a manual disconnect overtook it.
    fn fail_connect(&self, epoch: u64, err: SessionError) -> SessionError {
        if self.disconnected_since(epoch) {
            tracing::debug!(error = %err, "connect overtaken by disconnect");
            return SessionError::ConnectionClosed;
        }
        self.fail(err)
    }

    fn fail(&self, err: SessionError) -> SessionError {
        tracing::warn!(error = %err, "connect failed");
        self.set_state(ConnectionState::Error);
        self.events.emit(SessionEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        err
    }

    async fn connect(&self) -> Result<(), SessionError> {
        let epoch = {
            let link = self.link.lock();
            self.begin_connect()?;
            link.disconnect_epoch
        };
        let mut guard = ConnectGuard {
            inner: self,
            epoch,
            generation: None,
            armed: true,
        };
        let result = self.establish(&mut guard).await;
        guard.armed = false;
        result
    }

    async fn establish(&self, guard: &mut ConnectGuard<'_>) -> Result<(), SessionError> {
        let epoch = guard.epoch;
        let config = self.config.read().clone();
        let url = match config.connection_url(&self.credential.read()) {
            Ok(url) => url,
            Err(e) => return Err(self.fail_connect(epoch, e)),
        };
        let display_url = redact_url(&url);
        tracing::info!(url = %display_url, "connecting");

        let conn = match self
            .connector
            .connect(&url, config.request_timeout(), config.max_frame_bytes)
            .await
        {
            Ok(conn) => conn,
            Err(e) => return Err(self.fail_connect(epoch, e)),
        };

        let cancel = CancellationToken::new();
        let generation = {
            let mut link = self.link.lock();
            if link.disconnect_epoch != epoch {
                None
            } else {
                link.cancel.cancel();
                link.generation += 1;
                link.transport = Some(conn.transport.clone());
                link.cancel = cancel.clone();
                link.established = false;
                link.connected_at = None;
                link.manual = false;
                self.router.attach(conn.transport.clone());
                *self.last_ack.lock() = Instant::now();
                self.start_heartbeat(&mut link, &config);
                Some(link.generation)
            }
        };
        let Some(generation) = generation else {
            tracing::debug!("disconnected while connecting, dropping new transport");
            conn.transport.close(CLOSE_NORMAL, MANUAL_DISCONNECT).await;
            return Err(SessionError::ConnectionClosed);
        };
        guard.generation = Some(generation);

        tokio::spawn(run_event_loop(self.me.clone(), generation, conn.events, cancel));

        if let Err(e) = self.handshake(&config).await {
            if let Some(td) = self.teardown(generation) {
                td.transport.close(CLOSE_NORMAL, "handshake failed").await;
            }
            return Err(self.fail_connect(epoch, e));
        }

        {
            let mut link = self.link.lock();
            if link.generation != generation || link.transport.is_none() {
                drop(link);
                return Err(self.fail_connect(epoch, SessionError::ConnectionClosed));
            }
            link.established = true;
            link.connected_at = Some(Instant::now());
        }
        {
            let mut c = self.counters.lock();
            c.connects += 1;
            c.last_connected_at = Some(Utc::now());
        }
        self.set_state(ConnectionState::Connected);
        tracing::info!(url = %display_url, "session connected");
        self.events.emit(SessionEvent::Connected { url: display_url });
        Ok(())
    }

    /// (Re)start the heartbeat for the current connection.
    fn start_heartbeat(&self, link: &mut Link, config: &SessionConfig) {
        if let Some(previous) = link.heartbeat.take() {
            previous.cancel();
        }
        let Some(interval) = config.heartbeat_interval() else {
            tracing::debug!("heartbeat disabled");
            return;
        };
        let token = link.cancel.child_token();
        link.heartbeat = Some(token.clone());
        tokio::spawn(run_heartbeat(
            self.me.clone(),
            link.generation,
            interval,
            config.liveness_timeout(),
            token,
        ));
    }

    async fn handshake(&self, config: &SessionConfig) -> Result<(), SessionError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({ "tools": {} }),
            client_info: config.server_info(),
        };
        let params = serde_json::to_value(params).map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        let result = self
            .router
            .send_request(methods::INITIALIZE, Some(params), None)
            .await
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        let info: InitializeResult = serde_json::from_value(result)
            .map_err(|e| SessionError::HandshakeFailed(format!("bad initialize result: {e}")))?;
        tracing::info!(
            peer = %info.server_info.name,
            peer_version = %info.server_info.version,
            protocol = %info.protocol_version,
            "handshake complete"
        );
        *self.peer_info.write() = Some(info);
        Ok(())
    }

    async fn disconnect(&self) {
        self.reconnect.cancel();
        let (transport, generation) = {
            let mut link = self.link.lock();
            if let Some(debounce) = link.debounce.take() {
                debounce.abort();
            }
            link.manual = true;
            link.disconnect_epoch += 1;
            (link.transport.clone(), link.generation)
        };
        if let Some(transport) = transport {
            transport.close(CLOSE_NORMAL, MANUAL_DISCONNECT).await;
            self.on_closed(generation, CLOSE_NORMAL, MANUAL_DISCONNECT.to_string());
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Detach the connection of `generation`.  `None` if it is stale or
    /// already torn down.
    fn teardown(&self, generation: u64) -> Option<Teardown> {
        let mut link = self.link.lock();
        if link.generation != generation {
            return None;
        }
        let transport = link.transport.take()?;
        link.cancel.cancel();
        link.heartbeat = None;
        self.router.detach();
        self.router.cancel_all_requests();
        Some(Teardown {
            transport,
            established: std::mem::take(&mut link.established),
            manual: link.manual,
            uptime: link.connected_at.take().map(|t| t.elapsed()),
        })
    }

    /// Shared disconnection path for manual and unexpected closures.
    fn on_closed(&self, generation: u64, code: u16, reason: String) {
        let Some(td) = self.teardown(generation) else {
            return;
        };
        let manual = td.manual || reason == MANUAL_DISCONNECT;
        {
            let mut c = self.counters.lock();
            c.disconnects += 1;
            c.total_uptime += td.uptime.unwrap_or_default();
            c.last_disconnect_reason = Some(reason.clone());
        }
        drop(td.transport);

        if !td.established {
            // Still handshaking: connect() reports the failure.
            tracing::debug!(code, %reason, "connection closed during handshake");
            return;
        }

        if manual {
            tracing::info!(code, %reason, "disconnected");
        } else {
            tracing::warn!(code, %reason, "connection lost");
        }
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(SessionEvent::Disconnected { reason });

        if !manual && self.reconnect.is_enabled() {
            self.schedule_reconnect_debounced();
        }
    }

    fn schedule_reconnect_debounced(&self) {
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DEBOUNCE).await;
            if let Some(inner) = me.upgrade() {
                let target: Weak<dyn ReconnectTarget> = me;
                inner.reconnect.schedule_reconnect(target, false);
            }
        });
        if let Some(previous) = self.link.lock().debounce.replace(task) {
            previous.abort();
        }
    }

    fn handle_transport_event(&self, generation: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Opened => tracing::debug!("transport open"),
            TransportEvent::Frame(text) => {
                if let Err(e) = self.router.handle_frame(&text) {
                    tracing::debug!(error = %e, "inbound frame rejected");
                }
            }
            TransportEvent::LivenessProbe { at } => tracing::trace!(%at, "peer ping"),
            TransportEvent::LivenessAck { at } => {
                tracing::trace!(%at, "pong");
                *self.last_ack.lock() = Instant::now();
            }
            TransportEvent::Error(message) => {
                let err = SessionError::ConnectionError(message);
                tracing::warn!(error = %err, "transport error");
                self.events.emit(SessionEvent::Error {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                });
            }
            TransportEvent::Closed { code, reason } => {
                self.on_closed(generation, code, reason);
                return false;
            }
        }
        true
    }

    /// One heartbeat tick.  Returns `false` once the connection is gone.
    async fn heartbeat_tick(&self, generation: u64, liveness_timeout: Duration) -> bool {
        let transport = {
            let link = self.link.lock();
            if link.generation != generation {
                return false;
            }
            match (&link.transport, link.established) {
                (Some(t), true) => t.clone(),
                (Some(_), false) => return true,
                (None, _) => return false,
            }
        };

        self.router.cleanup();

        let silent_for = self.last_ack.lock().elapsed();
        if silent_for > liveness_timeout {
            self.counters.lock().liveness_failures += 1;
            tracing::warn!(
                silent_ms = silent_for.as_millis() as u64,
                "no liveness acknowledgment, dropping connection"
            );
            self.events.emit(SessionEvent::Error {
                kind: "liveness_timeout".into(),
                message: format!("no acknowledgment for {silent_for:?}"),
            });
            transport.close(CLOSE_LIVENESS, "liveness timeout").await;
            self.on_closed(generation, CLOSE_LIVENESS, "liveness timeout".into());
            return false;
        }

        self.counters.lock().heartbeats_sent += 1;
        if let Err(e) = transport.ping().await {
            tracing::debug!(error = %e, "transport ping failed");
        }
        let me = self.me.clone();
        tokio::spawn(async move {
            let Some(inner) = me.upgrade() else { return };
            let router = inner.router.clone();
            drop(inner);
            match router.send_request(methods::PING, None, None).await {
                Ok(_) => {
                    if let Some(inner) = me.upgrade() {
                        *inner.last_ack.lock() = Instant::now();
                    }
                }
                Err(e) => tracing::debug!(error = %e, "heartbeat ping failed"),
            }
        });
        true
    }
}

#[async_trait]
impl ReconnectTarget for SessionInner {
    async fn reconnect(&self) -> Result<(), SessionError> {
        if *self.state.borrow() == ConnectionState::Connected {
            return Ok(());
        }
        self.connect().await
    }

    fn reconnect_scheduled(&self, _attempt: u32, _delay: Duration) {
        self.set_state(ConnectionState::Reconnecting);
    }

    fn reconnect_abandoned(&self, attempts: u32) {
        tracing::error!(attempts, "reconnect abandoned");
        self.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.reconnect.cancel();
        let link = self.link.get_mut();
        link.cancel.cancel();
        if let Some(debounce) = link.debounce.take() {
            debounce.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-connection tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_event_loop(
    session: Weak<SessionInner>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(inner) = session.upgrade() else { return };
        match event {
            Some(event) => {
                if !inner.handle_transport_event(generation, event) {
                    return;
                }
            }
            None => {
                inner.on_closed(generation, CLOSE_ABNORMAL, "transport event stream ended".into());
                return;
            }
        }
    }
}

async fn run_heartbeat(
    session: Weak<SessionInner>,
    generation: u64,
    interval: Duration,
    liveness_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = session.upgrade() else { return };
        if !inner.heartbeat_tick(generation, liveness_timeout).await {
            return;
        }
    }
}
