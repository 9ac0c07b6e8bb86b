//! Session transport: owns the WebSocket, turns it into a stream of
//! [`TransportEvent`]s and accepts outbound text frames.
//!
//! No protocol semantics live here.  The reader and writer halves each run
//! in their own task; outbound writes report their outcome back to the
//! caller so `send_frame` fails when the socket write fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::SessionError;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Abnormal closure (no close frame received).
pub const CLOSE_ABNORMAL: u16 = 1006;

/// How long `close()` waits for the close frame to reach the socket.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Events raised by a transport, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Closed { code: u16, reason: String },
    Error(String),
    /// The peer pinged us.
    LivenessProbe { at: DateTime<Utc> },
    /// The peer answered one of our pings.
    LivenessAck { at: DateTime<Utc> },
}

/// An open duplex connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one text frame.  Fails with `SendFailed` if the socket is not
    /// open or the write fails.
    async fn send_frame(&self, frame: String) -> Result<(), SessionError>;

    /// Send a transport-level ping.
    async fn ping(&self) -> Result<(), SessionError>;

    /// Best-effort graceful close.  A `Closed` event always follows.
    async fn close(&self, code: u16, reason: &str);

    fn is_open(&self) -> bool;
}

/// A freshly opened connection and its event stream.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens connections.  The session depends on this seam rather than on
/// tokio-tungstenite directly.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &Url,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Connection, SessionError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebSocket implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &Url,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Connection, SessionError> {
        let ws = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(SessionError::ConnectionError(e.to_string())),
            Err(_) => return Err(SessionError::ConnectionTimeout(timeout)),
        };
        let (mut sink, mut stream) = ws.split();

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(256);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);
        let open = Arc::new(AtomicBool::new(true));
        let latch = Arc::new(CloseLatch {
            emitted: AtomicBool::new(false),
            open: open.clone(),
            events: event_tx.clone(),
        });

        let _ = event_tx.try_send(TransportEvent::Opened);

        // Writer task: serializes all writes to the socket.  It drains any
        // queued command, including a close, before exiting.
        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(cmd) = outbound_rx.recv().await {
                match cmd {
                    Outbound::Frame(text, done) => {
                        let result = sink
                            .send(Message::Text(text))
                            .await
                            .map_err(|e| SessionError::SendFailed(e.to_string()));
                        if result.is_err() {
                            writer_open.store(false, Ordering::SeqCst);
                        }
                        let _ = done.send(result);
                    }
                    Outbound::Ping(done) => {
                        let payload = Utc::now().timestamp_millis().to_be_bytes().to_vec();
                        let result = sink
                            .send(Message::Ping(payload))
                            .await
                            .map_err(|e| SessionError::SendFailed(e.to_string()));
                        let _ = done.send(result);
                    }
                    Outbound::Close { code, reason, done } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            tracing::debug!(error = %e, "close frame not delivered");
                        }
                        let _ = done.send(());
                        break;
                    }
                }
            }
        });

        // Reader task: turns socket messages into events.
        let reader_latch = latch.clone();
        let reader_tx = event_tx;
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => {
                        if text.len() > max_frame_bytes {
                            tracing::warn!(
                                bytes = text.len(),
                                max = max_frame_bytes,
                                "inbound frame exceeds max_frame_bytes, dropping"
                            );
                            continue;
                        }
                        TransportEvent::Frame(text)
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) if text.len() <= max_frame_bytes => TransportEvent::Frame(text),
                        Ok(text) => {
                            tracing::warn!(bytes = text.len(), "oversized binary frame, dropping");
                            continue;
                        }
                        Err(_) => TransportEvent::Error("binary frame is not valid UTF-8".into()),
                    },
                    Ok(Message::Ping(_)) => TransportEvent::LivenessProbe { at: Utc::now() },
                    Ok(Message::Pong(_)) => TransportEvent::LivenessAck { at: Utc::now() },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((1005, String::new()));
                        reader_latch.close(code, reason).await;
                        return;
                    }
                    Ok(Message::Frame(_)) => continue,
                    Err(e) => {
                        let _ = reader_tx.send(TransportEvent::Error(e.to_string())).await;
                        reader_latch.close(CLOSE_ABNORMAL, e.to_string()).await;
                        return;
                    }
                };
                if reader_tx.send(event).await.is_err() {
                    // Nobody is listening any more.
                    return;
                }
            }
            reader_latch
                .close(CLOSE_ABNORMAL, "connection dropped".into())
                .await;
        });

        let transport = WsTransport {
            outbound: outbound_tx,
            open,
            latch,
            reader,
        };
        Ok(Connection {
            transport: Arc::new(transport),
            events: event_rx,
        })
    }
}

enum Outbound {
    Frame(String, oneshot::Sender<Result<(), SessionError>>),
    Ping(oneshot::Sender<Result<(), SessionError>>),
    Close {
        code: u16,
        reason: String,
        done: oneshot::Sender<()>,
    },
}

/// Guarantees exactly one `Closed` event per connection, whichever side
/// closes first.
struct CloseLatch {
    emitted: AtomicBool,
    open: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
}

impl CloseLatch {
    async fn close(&self, code: u16, reason: String) {
        self.open.store(false, Ordering::SeqCst);
        if self
            .emitted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.events.send(TransportEvent::Closed { code, reason }).await;
        }
    }
}

struct WsTransport {
    outbound: mpsc::Sender<Outbound>,
    open: Arc<AtomicBool>,
    latch: Arc<CloseLatch>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    async fn round_trip(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Outbound,
    ) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::SendFailed("socket is not open".into()));
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.outbound
            .send(make(done_tx))
            .await
            .map_err(|_| SessionError::SendFailed("writer task has stopped".into()))?;
        done_rx
            .await
            .map_err(|_| SessionError::SendFailed("writer task has stopped".into()))?
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_frame(&self, frame: String) -> Result<(), SessionError> {
        self.round_trip(|done| Outbound::Frame(frame, done)).await
    }

    async fn ping(&self) -> Result<(), SessionError> {
        self.round_trip(Outbound::Ping).await
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let (done_tx, done_rx) = oneshot::channel();
            let queued = self
                .outbound
                .send(Outbound::Close {
                    code,
                    reason: reason.to_string(),
                    done: done_tx,
                })
                .await;
            if queued.is_ok() && tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, done_rx).await.is_err() {
                tracing::debug!(code, "close frame not flushed in time");
            }
        }
        // The close is ours; don't wait for the peer's echo.
        self.reader.abort();
        self.latch.close(code, reason.to_string()).await;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        // The writer stops by itself once `outbound` is dropped.
        self.reader.abort();
    }
}
