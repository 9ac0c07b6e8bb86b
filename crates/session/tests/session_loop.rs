//! Integration test: boots an in-process WebSocket server that plays the
//! remote MCP peer, connects a real [`McpSession`], and drives the
//! handshake, tool calls and the reconnect paths over a real socket.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tether_session::{
    sync_tool, ConnectionState, McpSession, SessionBuilder, SessionError, SessionEvent, ToolError,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

// ── Mini peer: in-process WS server ─────────────────────────────────────

enum PeerCmd {
    Send(Value),
    Close,
}

/// One accepted connection, after the session's `initialize` was answered.
struct PeerConn {
    uri: String,
    cmd: mpsc::Sender<PeerCmd>,
    recv: mpsc::Receiver<Value>,
    /// Close code the peer received, `None` if the socket just dropped.
    closed: oneshot::Receiver<Option<u16>>,
}

impl PeerConn {
    async fn send(&self, msg: Value) {
        self.cmd.send(PeerCmd::Send(msg)).await.unwrap();
    }

    async fn next(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.recv.recv())
            .await
            .expect("peer timed out waiting for a frame")
            .expect("connection closed")
    }

    /// Send a request and return the session's reply.
    async fn call(&mut self, msg: Value) -> Value {
        self.send(msg).await;
        self.next().await
    }
}

async fn start_mini_peer() -> (SocketAddr, mpsc::Receiver<PeerConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::channel(4);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let conn_tx = conn_tx.clone();
            tokio::spawn(async move {
                let mut uri = String::new();
                let capture_uri = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    uri = req.uri().to_string();
                    Ok(resp)
                };
                let ws = tokio_tungstenite::accept_hdr_async(stream, capture_uri)
                    .await
                    .unwrap();
                let (mut sink, mut stream) = ws.split();

                // Answer the session's initialize.
                let init = loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => {
                            let v: Value = serde_json::from_str(&text).unwrap();
                            if v["method"] == "initialize" {
                                break v;
                            }
                        }
                        Some(Ok(_)) => continue,
                        _ => return,
                    }
                };
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": init["id"],
                    "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": {},
                        "serverInfo": {"name": "mini-peer", "version": "0.0.0-test"}
                    }
                });
                if sink.send(Message::Text(reply.to_string())).await.is_err() {
                    return;
                }

                let (cmd_tx, mut cmd_rx) = mpsc::channel::<PeerCmd>(16);
                let (frame_tx, frame_rx) = mpsc::channel::<Value>(16);
                let (closed_tx, closed_rx) = oneshot::channel();
                let _ = conn_tx
                    .send(PeerConn {
                        uri,
                        cmd: cmd_tx,
                        recv: frame_rx,
                        closed: closed_rx,
                    })
                    .await;

                let read_task = tokio::spawn(async move {
                    let mut close_code = None;
                    while let Some(Ok(msg)) = stream.next().await {
                        match msg {
                            Message::Text(text) => {
                                if let Ok(v) = serde_json::from_str::<Value>(&text) {
                                    let _ = frame_tx.send(v).await;
                                }
                            }
                            Message::Close(frame) => {
                                close_code = frame.map(|f| u16::from(f.code));
                                break;
                            }
                            _ => {}
                        }
                    }
                    let _ = closed_tx.send(close_code);
                });

                while let Some(cmd) = cmd_rx.recv().await {
                    match cmd {
                        PeerCmd::Send(v) => {
                            if sink.send(Message::Text(v.to_string())).await.is_err() {
                                break;
                            }
                        }
                        PeerCmd::Close => {
                            let frame = CloseFrame {
                                code: CloseCode::Away,
                                reason: "peer going away".into(),
                            };
                            let _ = sink.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    }
                }
                let _ = read_task.await;
            });
        }
    });

    (addr, conn_rx)
}

async fn accept(conns: &mut mpsc::Receiver<PeerConn>) -> PeerConn {
    tokio::time::timeout(WAIT, conns.recv())
        .await
        .expect("no connection accepted")
        .expect("peer stopped")
}

fn session_for(addr: SocketAddr) -> McpSession {
    SessionBuilder::new()
        .endpoint(format!("ws://{addr}/mcp"))
        .token("secret")
        .server_name("tether-test")
        .heartbeat_interval(Duration::ZERO)
        .request_timeout(Duration::from_secs(2))
        .reconnect_policy(tether_session::ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_attempts: 5,
        })
        .tool(
            "echo",
            "Echo a message",
            json!({
                "type": "object",
                "properties": { "msg": { "type": "string" } },
                "required": ["msg"]
            }),
            sync_tool(|args| Ok(args["msg"].clone())),
        )
        .tool(
            "explode",
            "Always fails",
            Value::Null,
            sync_tool(|_| Err(ToolError::Failed("kaboom".into()))),
        )
        .build()
        .unwrap()
}

async fn wait_for_event<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let ev = rx.recv().await.unwrap();
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("event not observed")
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_and_tool_cycle() {
    let (addr, mut conns) = start_mini_peer().await;
    let session = session_for(addr);

    session.connect().await.unwrap();
    let mut peer = accept(&mut conns).await;

    assert!(peer.uri.contains("token=secret"), "uri was {}", peer.uri);
    assert!(session.is_connected());
    assert_eq!(session.peer_info().unwrap().server_info.name, "mini-peer");

    // Peer-initiated initialize: reply, then notifications/initialized.
    let reply = peer
        .call(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "mini-peer", "version": "0"}
            }
        }))
        .await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(reply["result"]["serverInfo"]["name"], "tether-test");
    let note = peer.next().await;
    assert_eq!(note["method"], "notifications/initialized");

    let reply = peer
        .call(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    let names: Vec<&str> = reply["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["echo", "explode"]);

    let reply = peer
        .call(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                     "params": {"name": "echo", "arguments": {"msg": "hi"}}}))
        .await;
    assert_eq!(reply["result"]["isError"], false);
    assert_eq!(reply["result"]["content"][0]["text"], "hi");

    let reply = peer
        .call(json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call",
                     "params": {"name": "echo", "arguments": {}}}))
        .await;
    assert_eq!(reply["result"]["isError"], true);

    let reply = peer
        .call(json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call",
                     "params": {"name": "explode", "arguments": {}}}))
        .await;
    assert_eq!(reply["result"]["isError"], true);
    assert_eq!(reply["result"]["content"][0]["text"], "kaboom");

    let reply = peer
        .call(json!({"jsonrpc": "2.0", "id": 6, "method": "resources/list"}))
        .await;
    assert_eq!(reply["error"]["code"], -32601);

    let reply = peer
        .call(json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}))
        .await;
    assert_eq!(reply, json!({"jsonrpc": "2.0", "id": 7, "result": {}}));

    let stats = session.stats();
    assert_eq!(stats.tools.total_calls, 3);
    assert_eq!(stats.tools.failed_calls, 2);

    session.disconnect().await;
}

#[tokio::test]
async fn outbound_requests_and_notifications() {
    let (addr, mut conns) = start_mini_peer().await;
    let session = session_for(addr);
    session.connect().await.unwrap();
    let mut peer = accept(&mut conns).await;

    let s = session.clone();
    let call = tokio::spawn(async move { s.send_request("sampling/create", Some(json!({"n": 1}))).await });
    let req = peer.next().await;
    assert_eq!(req["method"], "sampling/create");
    assert_eq!(req["params"], json!({"n": 1}));
    peer.send(json!({"jsonrpc": "2.0", "id": req["id"], "result": {"ok": true}}))
        .await;
    assert_eq!(call.await.unwrap().unwrap(), json!({"ok": true}));

    let s = session.clone();
    let call = tokio::spawn(async move { s.send_request("fails", None).await });
    let req = peer.next().await;
    peer.send(json!({"jsonrpc": "2.0", "id": req["id"],
                     "error": {"code": -32000, "message": "no such thing"}}))
        .await;
    match call.await.unwrap() {
        Err(SessionError::Rpc(e)) => assert_eq!(e.code, -32000),
        other => panic!("unexpected {other:?}"),
    }

    session
        .send_notification("notifications/progress", Some(json!({"pct": 50})))
        .await
        .unwrap();
    let note = peer.next().await;
    assert_eq!(note["method"], "notifications/progress");
    assert!(note.get("id").is_none());

    session.disconnect().await;
}

#[tokio::test]
async fn manual_disconnect_never_reconnects() {
    let (addr, mut conns) = start_mini_peer().await;
    let session = session_for(addr);
    let mut events = session.subscribe();
    session.connect().await.unwrap();
    let _peer = accept(&mut conns).await;

    session.disconnect().await;
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    let ev = wait_for_event(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert_eq!(
        ev,
        SessionEvent::Disconnected {
            reason: tether_session::MANUAL_DISCONNECT.into()
        }
    );

    // Well past the debounce and the first back-off delay.
    let second = tokio::time::timeout(Duration::from_millis(800), conns.recv()).await;
    assert!(second.is_err(), "manual disconnect must not reconnect");
    assert!(!session.is_connected());
}

#[tokio::test]
async fn disconnect_sends_normal_close_frame() {
    let (addr, mut conns) = start_mini_peer().await;
    let session = session_for(addr);
    session.connect().await.unwrap();
    let peer = accept(&mut conns).await;

    session.disconnect().await;
    let code = tokio::time::timeout(WAIT, peer.closed)
        .await
        .expect("peer never saw the socket end")
        .unwrap();
    assert_eq!(code, Some(1000));
}

#[tokio::test]
async fn unexpected_close_reconnects() {
    let (addr, mut conns) = start_mini_peer().await;
    let session = session_for(addr);
    let mut events = session.subscribe();
    session.connect().await.unwrap();
    let peer = accept(&mut conns).await;

    peer.cmd.send(PeerCmd::Close).await.unwrap();

    wait_for_event(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    let _second = accept(&mut conns).await;
    let ev = wait_for_event(&mut events, |e| matches!(e, SessionEvent::Reconnected { .. })).await;
    assert!(matches!(ev, SessionEvent::Reconnected { attempts: 1, .. }));
    assert!(session.is_connected());
    assert_eq!(session.stats().connects, 2);

    session.disconnect().await;
}

#[tokio::test]
async fn connect_to_closed_port_fails_without_retrying() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let session = session_for(addr);
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::ConnectionError(_)));
    assert_eq!(session.connection_state(), ConnectionState::Error);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.stats().reconnect_attempts, 0);
}
