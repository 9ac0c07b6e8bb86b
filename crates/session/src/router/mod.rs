//! Message router: JSON-RPC framing, request/response correlation and
//! inbound dispatch.
//!
//! Outbound requests park a oneshot sender in the pending map keyed by
//! request id; the inbound side completes it when the matching response
//! arrives.  The caller owns the timeout: when it fires, the entry is
//! removed so a late response can no longer complete it.
//!
//! Inbound requests and notifications are dispatched to a [`MethodHandler`]
//! registered under the exact method name.  A single dispatcher task runs
//! handlers one at a time in frame arrival order, off the read loop, so
//! responses keep being correlated while a handler is busy.

pub mod handlers;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tether_protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Message, RequestId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};
use crate::transport::Transport;

pub use handlers::{
    register_builtin_handlers, InitializeHandler, PingHandler, ToolsCallHandler, ToolsListHandler,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handles one inbound method.
///
/// Requests are answered through [`RequestContext::respond`].  Returning an
/// error from a request makes the router reply with `-32603`; errors from
/// notifications are only logged.
///
/// Handlers run one after another in arrival order.  Anything slow should
/// claim what it needs up front and move the rest onto its own task, the
/// way the built-in `tools/call` handler does.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: RequestContext, params: Option<Value>) -> Result<(), SessionError>;
}

/// Context handed to a [`MethodHandler`] for one inbound message.
pub struct RequestContext {
    router: Arc<MessageRouter>,
    /// `None` for notifications.
    pub id: Option<RequestId>,
    pub method: String,
}

impl RequestContext {
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Reply with a success result.  No-op for notifications.
    pub async fn respond(&self, result: Value) -> Result<(), SessionError> {
        match &self.id {
            Some(id) => self.router.send_response(id.clone(), result).await,
            None => Ok(()),
        }
    }

    /// Reply with an error.  No-op for notifications.
    pub async fn respond_error(&self, error: JsonRpcError) -> Result<(), SessionError> {
        match &self.id {
            Some(id) => self.router.send_error(id.clone(), error).await,
            None => Ok(()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending request tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, SessionError>>,
    created_at: Instant,
}

/// Protocol counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub requests_sent: u64,
    pub notifications_sent: u64,
    pub responses_received: u64,
    pub requests_received: u64,
    pub notifications_received: u64,
    pub invalid_messages: u64,
    pub timeouts: u64,
    /// Responses that matched no pending request.
    pub unmatched_responses: u64,
    pub pending: usize,
}

/// An inbound request or notification waiting for its handler.
struct Inbound {
    id: Option<RequestId>,
    method: String,
    params: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MessageRouter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MessageRouter {
    transport: RwLock<Option<Arc<dyn Transport>>>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
    /// Feeds the dispatcher task; started on the first inbound message.
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    request_timeout: RwLock<Duration>,
    stats: Mutex<RouterStats>,
    events: EventBus,
}

impl MessageRouter {
    pub fn new(request_timeout: Duration, events: EventBus) -> Self {
        Self {
            transport: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            inbound: Mutex::new(None),
            request_timeout: RwLock::new(request_timeout),
            stats: Mutex::new(RouterStats::default()),
            events,
        }
    }

    // ── Transport ────────────────────────────────────────────────────

    pub fn attach(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    pub fn detach(&self) -> Option<Arc<dyn Transport>> {
        self.transport.write().take()
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, SessionError> {
        self.transport.read().clone().ok_or(SessionError::NotConnected)
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        *self.request_timeout.write() = timeout;
    }

    pub fn request_timeout(&self) -> Duration {
        *self.request_timeout.read()
    }

    // ── Handlers ─────────────────────────────────────────────────────

    /// Register (or replace) the handler for `method`.
    pub fn register_handler(&self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        let method = method.into();
        if self.handlers.write().insert(method.clone(), handler).is_some() {
            tracing::debug!(%method, "replaced method handler");
        }
    }

    pub fn unregister_handler(&self, method: &str) -> bool {
        self.handlers.write().remove(method).is_some()
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.read().contains_key(method)
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Send a request and wait for its response.
    ///
    /// A fresh UUID is used unless `explicit_id` is given; an explicit id
    /// that is already pending is refused.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        explicit_id: Option<RequestId>,
    ) -> Result<Value, SessionError> {
        let transport = self.transport()?;
        let id = explicit_id.unwrap_or_else(|| RequestId::from(uuid::Uuid::new_v4().to_string()));

        let frame = encode(&JsonRpcRequest::request(id.clone(), method, params))?;

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(SessionError::DuplicateRequestId(id));
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    tx,
                    created_at: Instant::now(),
                },
            );
        }

        if let Err(e) = transport.send_frame(frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        self.stats.lock().requests_sent += 1;
        tracing::debug!(%id, %method, "request sent");

        let timeout = self.request_timeout();
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SessionError::ConnectionClosed),
            Err(_) => {
                if self.pending.lock().remove(&id).is_some() {
                    self.stats.lock().timeouts += 1;
                    tracing::warn!(%id, %method, ?timeout, "request timed out");
                    Err(SessionError::RequestTimeout {
                        method: method.to_string(),
                        timeout,
                    })
                } else {
                    // Completed between the timer firing and the removal.
                    rx.await.unwrap_or(Err(SessionError::ConnectionClosed))
                }
            }
        }
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        let transport = self.transport()?;
        let frame = encode(&JsonRpcRequest::notification(method, params))?;
        transport.send_frame(frame).await?;
        self.stats.lock().notifications_sent += 1;
        tracing::debug!(%method, "notification sent");
        Ok(())
    }

    pub async fn send_response(&self, id: RequestId, result: Value) -> Result<(), SessionError> {
        let frame = encode(&JsonRpcResponse::success(id, result))?;
        self.transport()?.send_frame(frame).await
    }

    pub async fn send_error(&self, id: RequestId, error: JsonRpcError) -> Result<(), SessionError> {
        tracing::debug!(%id, code = error.code, message = %error.message, "sending error response");
        let frame = encode(&JsonRpcResponse::failure(id, error))?;
        self.transport()?.send_frame(frame).await
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Process one inbound text frame.
    ///
    /// Responses are correlated synchronously; requests and notifications
    /// are queued for the dispatcher task in arrival order.  Malformed frames are
    /// counted, surfaced as an `error` event and returned as `Err`.
    pub fn handle_frame(self: &Arc<Self>, frame: &str) -> Result<(), SessionError> {
        let value: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => return Err(self.reject(SessionError::InvalidJson(e.to_string()))),
        };
        let message = match Message::from_value(value) {
            Ok(m) => m,
            Err(e) => return Err(self.reject(SessionError::InvalidJsonRpc(e.to_string()))),
        };

        match message {
            Message::Response { id, outcome } => {
                self.complete(id, outcome);
            }
            Message::Request { id, method, params } => {
                self.stats.lock().requests_received += 1;
                self.dispatch(Some(id), method, params);
            }
            Message::Notification { method, params } => {
                self.stats.lock().notifications_received += 1;
                self.dispatch(None, method, params);
            }
        }
        Ok(())
    }

    fn reject(&self, err: SessionError) -> SessionError {
        self.stats.lock().invalid_messages += 1;
        tracing::warn!(error = %err, "dropping malformed frame");
        self.events.emit(SessionEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        err
    }

    fn complete(&self, id: Option<RequestId>, outcome: Result<Value, JsonRpcError>) {
        let entry = id.as_ref().and_then(|id| self.pending.lock().remove(id));
        let Some(entry) = entry else {
            self.stats.lock().unmatched_responses += 1;
            tracing::debug!(id = ?id, "response for unknown request id, dropping");
            return;
        };
        self.stats.lock().responses_received += 1;
        tracing::debug!(
            id = ?id,
            method = %entry.method,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "response received"
        );
        let _ = entry.tx.send(outcome.map_err(SessionError::Rpc));
    }

    fn dispatch(self: &Arc<Self>, id: Option<RequestId>, method: String, params: Option<Value>) {
        let mut inbound = self.inbound.lock();
        let tx = inbound.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_dispatcher(Arc::downgrade(self), rx));
            tx
        });
        if let Err(e) = tx.send(Inbound { id, method, params }) {
            tracing::warn!(method = %e.0.method, "dispatcher stopped, dropping inbound message");
            *inbound = None;
        }
    }

    async fn run_handler(self: &Arc<Self>, msg: Inbound) {
        let Inbound { id, method, params } = msg;
        let handler = self.handlers.read().get(&method).cloned();

        let Some(handler) = handler else {
            match id {
                Some(id) => {
                    tracing::debug!(%method, "method not found");
                    let err = JsonRpcError::method_not_found(&method);
                    if let Err(e) = self.send_error(id, err).await {
                        tracing::warn!(error = %e, "failed to send method-not-found reply");
                    }
                }
                None => tracing::debug!(%method, "ignoring notification without handler"),
            }
            return;
        };

        let ctx = RequestContext {
            router: self.clone(),
            id: id.clone(),
            method: method.clone(),
        };
        let failure = match AssertUnwindSafe(handler.handle(ctx, params)).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("handler for {method} panicked"),
        };
        tracing::warn!(%method, error = %failure, "method handler failed");
        if let Some(id) = id {
            if let Err(e) = self.send_error(id, JsonRpcError::internal(failure)).await {
                tracing::warn!(error = %e, "failed to send internal-error reply");
            }
        }
    }

    // ── Housekeeping ─────────────────────────────────────────────────

    /// Fail pending requests older than the request timeout.  Returns how
    /// many were swept.
    pub fn cleanup(&self) -> usize {
        let timeout = self.request_timeout();
        let expired: Vec<(RequestId, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let stale: Vec<RequestId> = pending
                .iter()
                .filter(|(_, p)| p.created_at.elapsed() >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            tracing::warn!(%id, method = %entry.method, "sweeping stale request");
            let _ = entry.tx.send(Err(SessionError::RequestTimeout {
                method: entry.method,
                timeout,
            }));
        }
        if count > 0 {
            self.stats.lock().timeouts += count as u64;
        }
        count
    }

    /// Fail every pending request with `ConnectionClosed`.
    pub fn cancel_all_requests(&self) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(SessionError::ConnectionClosed));
        }
        if count > 0 {
            tracing::debug!(count, "cancelled pending requests");
        }
        count
    }

    /// Cancel everything, drop the transport, clear all handlers and stop
    /// the dispatcher.
    pub fn destroy(&self) {
        self.cancel_all_requests();
        self.detach();
        self.handlers.write().clear();
        self.inbound.lock().take();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> RouterStats {
        let mut stats = self.stats.lock().clone();
        stats.pending = self.pending_count();
        stats
    }
}

/// Runs inbound handlers in arrival order until the router goes away.
async fn run_dispatcher(router: Weak<MessageRouter>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(msg) = rx.recv().await {
        let Some(router) = router.upgrade() else { return };
        router.run_handler(msg).await;
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<String, SessionError> {
    serde_json::to_string(msg).map_err(|e| SessionError::InvalidJson(e.to_string()))
}
