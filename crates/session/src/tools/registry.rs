//! Tool registry and dispatcher.
//!
//! Holds the named tools and runs invocations under a concurrency ceiling.
//! Calls that arrive while the ceiling is reached wait in a FIFO queue; a
//! finishing call hands its slot directly to the oldest waiter, so queued
//! calls start in arrival order.
//!
//! Tool-level failures (schema violations, callback errors, panics) are
//! contained: they come back as an error-flagged [`ToolCallResult`], never
//! as an `Err`.  Only registry-level failures such as an unknown tool name
//! are returned as errors.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tether_protocol::{ToolCallResult, ToolDescriptor};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::handler::ToolHandler;
use super::response::normalize;
use super::schema;
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};

/// Smoothing factor for the execution-time moving average.
const EMA_ALPHA: f64 = 0.1;

struct ToolDefinition {
    description: String,
    input_schema: Value,
    handler: Arc<dyn ToolHandler>,
    registered_at: DateTime<Utc>,
    invocations: u64,
    last_invoked: Option<DateTime<Utc>>,
    enabled: bool,
}

/// Introspection view of a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub registered_at: DateTime<Utc>,
    pub invocations: u64,
    pub last_invoked: Option<DateTime<Utc>>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolStats {
    pub total_calls: u64,
    pub failed_calls: u64,
    /// Calls that had to wait for a slot.
    pub queued_calls: u64,
    pub peak_queue_len: usize,
    pub running: usize,
    pub queue_len: usize,
    /// Exponential moving average, not a true mean.
    pub avg_execution_ms: f64,
}

struct QueuedExecution {
    tool: String,
    enqueued_at: Instant,
    admit: oneshot::Sender<()>,
}

struct ExecState {
    running: usize,
    max_concurrent: usize,
    queue: VecDeque<QueuedExecution>,
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolDefinition>>,
    exec: Mutex<ExecState>,
    stats: Mutex<ToolStats>,
    events: EventBus,
}

impl ToolRegistry {
    pub fn new(max_concurrent: usize, events: EventBus) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            exec: Mutex::new(ExecState {
                running: 0,
                max_concurrent: max_concurrent.max(1),
                queue: VecDeque::new(),
            }),
            stats: Mutex::new(ToolStats::default()),
            events,
        }
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Register a tool.  An existing tool with the same name is replaced.
    pub fn register_tool<T: ToolHandler>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: T,
    ) -> Result<(), SessionError> {
        self.register_boxed(name, description, input_schema, Arc::new(handler))
    }

    /// Register a pre-wrapped handler.
    pub fn register_boxed(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), SessionError> {
        let name = name.into();
        let description = description.into();
        if name.trim().is_empty() {
            return Err(SessionError::InvalidToolDefinition(
                "tool name must not be empty".into(),
            ));
        }
        if description.trim().is_empty() {
            return Err(SessionError::InvalidToolDefinition(format!(
                "tool {name} needs a description"
            )));
        }
        let input_schema = if input_schema.is_null() {
            serde_json::json!({ "type": "object", "properties": {} })
        } else {
            input_schema
        };

        let previous = self.tools.write().insert(
            name.clone(),
            ToolDefinition {
                description,
                input_schema,
                handler,
                registered_at: Utc::now(),
                invocations: 0,
                last_invoked: None,
                enabled: true,
            },
        );
        if previous.is_some() {
            tracing::warn!(tool = %name, "tool already registered, replacing definition");
        } else {
            tracing::info!(tool = %name, "tool registered");
        }
        self.events.emit(SessionEvent::ToolRegistered { name });
        Ok(())
    }

    /// Remove a tool.  Returns `false` if it was not registered.
    pub fn unregister_tool(&self, name: &str) -> bool {
        if self.tools.write().remove(name).is_some() {
            tracing::info!(tool = %name, "tool unregistered");
            self.events.emit(SessionEvent::ToolUnregistered {
                name: name.to_string(),
            });
            true
        } else {
            tracing::debug!(tool = %name, "unregister requested for unknown tool");
            false
        }
    }

    /// Enable or disable a tool.  Disabled tools are not listed and their
    /// calls fail in-band.  Returns `false` if the tool is unknown.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.tools.write().get_mut(name) {
            Some(def) => {
                def.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Public projection of every enabled tool, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .read()
            .iter()
            .filter(|(_, def)| def.enabled)
            .map(|(name, def)| ToolDescriptor {
                name: name.clone(),
                description: def.description.clone(),
                input_schema: def.input_schema.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn info(&self, name: &str) -> Option<ToolInfo> {
        self.tools.read().get(name).map(|def| ToolInfo {
            name: name.to_string(),
            description: def.description.clone(),
            input_schema: def.input_schema.clone(),
            registered_at: def.registered_at,
            invocations: def.invocations,
            last_invoked: def.last_invoked,
            enabled: def.enabled,
        })
    }

    pub fn stats(&self) -> ToolStats {
        let mut stats = self.stats.lock().clone();
        let exec = self.exec.lock();
        stats.running = exec.running;
        stats.queue_len = exec.queue.len();
        stats
    }

    /// Change the concurrency ceiling.  Raising it admits queued calls.
    pub fn set_max_concurrent(&self, max: usize) {
        let mut exec = self.exec.lock();
        exec.max_concurrent = max.max(1);
        Self::drain(&mut exec);
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Run a tool, waiting for a free slot if the ceiling is reached.
    pub async fn execute_tool(&self, name: &str, args: Value) -> Result<ToolCallResult, SessionError> {
        if !self.contains(name) {
            return Err(SessionError::ToolNotFound(name.to_string()));
        }
        let entry = self.enter(name);
        let slot = self.wait(entry).await;
        self.run_in_slot(name, args, slot).await
    }

    /// Claim a place in the concurrency window now and run later.  Tickets
    /// start in the order they were reserved.
    pub fn reserve(self: &Arc<Self>, name: &str) -> Result<ToolTicket, SessionError> {
        if !self.contains(name) {
            return Err(SessionError::ToolNotFound(name.to_string()));
        }
        Ok(ToolTicket {
            registry: self.clone(),
            name: name.to_string(),
            entry: Some(self.enter(name)),
        })
    }

    async fn run_in_slot(
        &self,
        name: &str,
        args: Value,
        _slot: Slot<'_>,
    ) -> Result<ToolCallResult, SessionError> {
        // Re-resolve: the tool may have been replaced or removed while queued.
        let (handler, input_schema, enabled) = match self.tools.read().get(name) {
            Some(def) => (def.handler.clone(), def.input_schema.clone(), def.enabled),
            None => return Err(SessionError::ToolNotFound(name.to_string())),
        };

        let started = Instant::now();
        let outcome = if enabled {
            self.invoke(name, &input_schema, handler, args).await
        } else {
            Err(format!("tool {name} is disabled"))
        };
        let elapsed = started.elapsed();

        Ok(self.finish(name, elapsed, outcome))
    }

    async fn invoke(
        &self,
        name: &str,
        input_schema: &Value,
        handler: Arc<dyn ToolHandler>,
        args: Value,
    ) -> Result<ToolCallResult, String> {
        let args = if args.is_null() {
            Value::Object(Default::default())
        } else {
            args
        };
        if let Err(violation) = schema::validate(input_schema, &args) {
            return Err(SessionError::InvalidToolArguments(violation.to_string()).to_string());
        }

        if let Some(def) = self.tools.write().get_mut(name) {
            def.invocations += 1;
            def.last_invoked = Some(Utc::now());
        }

        match AssertUnwindSafe(handler.call(args)).catch_unwind().await {
            Ok(Ok(value)) => Ok(normalize(value)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_panic) => {
                tracing::error!(tool = %name, "tool handler panicked");
                Err("tool handler panicked".into())
            }
        }
    }

    fn finish(
        &self,
        name: &str,
        elapsed: Duration,
        outcome: Result<ToolCallResult, String>,
    ) -> ToolCallResult {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let response = match outcome {
            Ok(response) => response,
            Err(message) => {
                tracing::warn!(tool = %name, error = %message, "tool call failed");
                self.events.emit(SessionEvent::ToolError {
                    name: name.to_string(),
                    error: message.clone(),
                });
                ToolCallResult::error(message)
            }
        };

        {
            let mut stats = self.stats.lock();
            stats.avg_execution_ms = if stats.total_calls == 0 {
                elapsed_ms
            } else {
                EMA_ALPHA * elapsed_ms + (1.0 - EMA_ALPHA) * stats.avg_execution_ms
            };
            stats.total_calls += 1;
            if response.is_error {
                stats.failed_calls += 1;
            }
        }

        tracing::debug!(
            tool = %name,
            elapsed_ms = elapsed.as_millis() as u64,
            is_error = response.is_error,
            "tool call finished"
        );
        self.events.emit(SessionEvent::ToolCalled {
            name: name.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            is_error: response.is_error,
        });
        response
    }

    // ── Concurrency window ───────────────────────────────────────────

    /// Take a free slot or join the back of the queue.
    fn enter(&self, name: &str) -> Entry {
        let mut exec = self.exec.lock();
        if exec.running < exec.max_concurrent {
            exec.running += 1;
            return Entry::Admitted;
        }
        let (tx, rx) = oneshot::channel();
        exec.queue.push_back(QueuedExecution {
            tool: name.to_string(),
            enqueued_at: Instant::now(),
            admit: tx,
        });
        let queue_len = exec.queue.len();
        drop(exec);

        let mut stats = self.stats.lock();
        stats.queued_calls += 1;
        stats.peak_queue_len = stats.peak_queue_len.max(queue_len);
        tracing::debug!(tool = %name, queue_len, "concurrency limit reached, queued tool call");
        Entry::Queued(rx)
    }

    async fn wait(&self, entry: Entry) -> Slot<'_> {
        if let Entry::Queued(rx) = entry {
            let mut waiting = Waiting {
                registry: self,
                rx: Some(rx),
            };
            if let Some(rx) = waiting.rx.as_mut() {
                let _ = rx.await;
            }
            waiting.rx = None;
        }
        Slot { registry: self }
    }

    fn release(&self) {
        let mut exec = self.exec.lock();
        exec.running = exec.running.saturating_sub(1);
        Self::drain(&mut exec);
    }

    /// Hand free slots to queued calls, oldest first.
    fn drain(exec: &mut ExecState) {
        while exec.running < exec.max_concurrent {
            let Some(next) = exec.queue.pop_front() else {
                break;
            };
            exec.running += 1;
            if next.admit.send(()).is_err() {
                // Caller went away while queued.
                exec.running -= 1;
                continue;
            }
            tracing::debug!(
                tool = %next.tool,
                waited_ms = next.enqueued_at.elapsed().as_millis() as u64,
                "dequeued tool call"
            );
        }
    }
}

enum Entry {
    Admitted,
    Queued(oneshot::Receiver<()>),
}

/// A reserved place in the concurrency window, from
/// [`ToolRegistry::reserve`].  Dropping an unused ticket gives the place back.
pub struct ToolTicket {
    registry: Arc<ToolRegistry>,
    name: String,
    entry: Option<Entry>,
}

impl ToolTicket {
    pub fn tool(&self) -> &str {
        &self.name
    }

    /// Wait for the slot if queued, then run the tool.
    pub async fn run(mut self, args: Value) -> Result<ToolCallResult, SessionError> {
        let registry = self.registry.clone();
        let name = std::mem::take(&mut self.name);
        let Some(entry) = self.entry.take() else {
            return Err(SessionError::ToolNotFound(name));
        };
        drop(self);
        let slot = registry.wait(entry).await;
        registry.run_in_slot(&name, args, slot).await
    }
}

impl Drop for ToolTicket {
    fn drop(&mut self) {
        match self.entry.take() {
            Some(Entry::Admitted) => self.registry.release(),
            Some(Entry::Queued(mut rx)) => {
                if rx.try_recv().is_ok() {
                    self.registry.release();
                }
            }
            None => {}
        }
    }
}

/// A held execution slot; released (and the queue drained) on drop.
struct Slot<'a> {
    registry: &'a ToolRegistry,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.registry.release();
    }
}

/// A queued call.  If the caller is dropped after being admitted but before
/// taking the slot, the slot is given back.
struct Waiting<'a> {
    registry: &'a ToolRegistry,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            if rx.try_recv().is_ok() {
                self.registry.release();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::tools::handler::{sync_tool, tool_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;

    fn registry(max: usize) -> ToolRegistry {
        ToolRegistry::new(max, EventBus::default())
    }

    fn echo_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "msg": { "type": "string" } },
            "required": ["msg"]
        })
    }

    #[tokio::test]
    async fn echo_scenario() {
        let reg = registry(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        reg.register_tool(
            "echo",
            "Echo a message",
            echo_schema(),
            sync_tool(move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args["msg"].clone())
            }),
        )
        .unwrap();

        let ok = reg.execute_tool("echo", json!({"msg": "hi"})).await.unwrap();
        assert!(!ok.is_error);
        assert_eq!(ok.text_content(), "hi");

        let bad = reg.execute_tool("echo", json!({})).await.unwrap();
        assert!(bad.is_error);
        assert!(bad.text_content().contains("invalid tool arguments"));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "callback must not run on bad args");
        assert_eq!(reg.info("echo").unwrap().invocations, 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_registry_error() {
        let reg = registry(1);
        let err = reg.execute_tool("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, SessionError::ToolNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn re_registration_replaces_callback() {
        let reg = registry(1);
        let events = reg.events.clone();
        let mut rx = events.subscribe();
        reg.register_tool("t", "old", Value::Null, sync_tool(|_| Ok(json!("old"))))
            .unwrap();
        reg.register_tool("t", "new", Value::Null, sync_tool(|_| Ok(json!("new"))))
            .unwrap();

        let r = reg.execute_tool("t", Value::Null).await.unwrap();
        assert_eq!(r.text_content(), "new");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.descriptors()[0].description, "new");
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::ToolRegistered { .. }));
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::ToolRegistered { .. }));
    }

    #[test]
    fn registration_requires_name_and_description() {
        let reg = registry(1);
        assert!(reg
            .register_tool("", "d", Value::Null, sync_tool(|_| Ok(Value::Null)))
            .is_err());
        assert!(reg
            .register_tool("x", " ", Value::Null, sync_tool(|_| Ok(Value::Null)))
            .is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn unregister_reports_absence() {
        let reg = registry(1);
        reg.register_tool("x", "d", Value::Null, sync_tool(|_| Ok(Value::Null)))
            .unwrap();
        assert!(reg.unregister_tool("x"));
        assert!(!reg.unregister_tool("x"));
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let reg = registry(2);
        reg.register_tool(
            "fail",
            "fails",
            Value::Null,
            sync_tool(|_| Err(ToolError::Failed("intentional".into()))),
        )
        .unwrap();
        reg.register_tool(
            "panic",
            "panics",
            Value::Null,
            tool_fn(|args| async move {
                if args.is_object() {
                    panic!("intentional panic");
                }
                Ok(Value::Null)
            }),
        )
        .unwrap();

        let r = reg.execute_tool("fail", json!({})).await.unwrap();
        assert!(r.is_error);
        assert_eq!(r.text_content(), "intentional");

        let r = reg.execute_tool("panic", json!({})).await.unwrap();
        assert!(r.is_error);
        assert!(r.text_content().contains("panicked"));

        let stats = reg.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.failed_calls, 2);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn disabled_tools_are_hidden_and_refused() {
        let reg = registry(1);
        reg.register_tool("x", "d", Value::Null, sync_tool(|_| Ok(json!("ran"))))
            .unwrap();
        assert!(reg.set_enabled("x", false));
        assert!(reg.descriptors().is_empty());
        let r = reg.execute_tool("x", json!({})).await.unwrap();
        assert!(r.is_error);
        assert!(!reg.set_enabled("nope", true));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_ceiling() {
        let reg = registry(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());
        reg.register_tool(
            "slow",
            "sleeps",
            Value::Null,
            tool_fn(move |_| {
                let (f, p) = (f.clone(), p.clone());
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();

        let calls = (0..6).map(|_| reg.execute_tool("slow", json!({})));
        let results = futures_util::future::join_all(calls).await;
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| !r.is_error)));
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        let stats = reg.stats();
        assert_eq!(stats.queued_calls, 4);
        assert_eq!(stats.peak_queue_len, 4);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queue_len, 0);
    }

    #[tokio::test]
    async fn queued_calls_complete_in_fifo_order() {
        let reg = Arc::new(registry(1));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(gate_rx)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let (g, o) = (gate.clone(), order.clone());
        reg.register_tool(
            "step",
            "records its argument",
            Value::Null,
            tool_fn(move |args| {
                let (g, o) = (g.clone(), o.clone());
                async move {
                    let rx = g.lock().take();
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                    o.lock().push(args["n"].as_u64().unwrap_or_default());
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();

        // First call takes the only slot and blocks on the gate.
        let first = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.execute_tool("step", json!({"n": 0})).await })
        };
        while reg.stats().running < 1 {
            tokio::task::yield_now().await;
        }

        let mut queued = Vec::new();
        for n in 1..=5u64 {
            let reg2 = reg.clone();
            queued.push(tokio::spawn(async move {
                reg2.execute_tool("step", json!({"n": n})).await
            }));
            while reg.stats().queue_len < n as usize {
                tokio::task::yield_now().await;
            }
        }

        let _ = gate_tx.send(());
        first.await.unwrap().unwrap();
        for h in queued {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tickets_start_in_reservation_order() {
        let reg = Arc::new(registry(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        reg.register_tool(
            "step",
            "records its argument",
            Value::Null,
            sync_tool(move |args| {
                o.lock().push(args["n"].as_u64().unwrap_or_default());
                Ok(Value::Null)
            }),
        )
        .unwrap();

        let tickets: Vec<ToolTicket> = (0..8).map(|_| reg.reserve("step").unwrap()).collect();
        assert_eq!(reg.stats().queue_len, 7);

        // Run them back to front; admission still follows reservation order.
        let handles: Vec<_> = tickets
            .into_iter()
            .enumerate()
            .rev()
            .map(|(n, ticket)| tokio::spawn(ticket.run(json!({"n": n}))))
            .collect();
        for h in handles {
            assert!(!h.await.unwrap().unwrap().is_error);
        }
        assert_eq!(*order.lock(), (0..8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn unused_tickets_give_their_place_back() {
        let reg = Arc::new(registry(1));
        reg.register_tool("echo", "Echo a message", echo_schema(), sync_tool(|a| Ok(a["msg"].clone())))
            .unwrap();
        assert!(matches!(reg.reserve("missing"), Err(SessionError::ToolNotFound(_))));

        let held = reg.reserve("echo").unwrap();
        let queued = reg.reserve("echo").unwrap();
        assert_eq!(reg.stats().running, 1);
        assert_eq!(reg.stats().queue_len, 1);

        drop(queued);
        drop(held);
        assert_eq!(reg.stats().running, 0);

        let result = reg.execute_tool("echo", json!({"msg": "hi"})).await.unwrap();
        assert_eq!(result.text_content(), "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn execution_time_is_an_exponential_average() {
        let reg = registry(1);
        reg.register_tool(
            "nap",
            "sleeps for ms",
            Value::Null,
            tool_fn(|args| async move {
                let ms = args["ms"].as_u64().unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::Null)
            }),
        )
        .unwrap();

        reg.execute_tool("nap", json!({"ms": 100})).await.unwrap();
        assert!((reg.stats().avg_execution_ms - 100.0).abs() < 1.0);
        reg.execute_tool("nap", json!({"ms": 200})).await.unwrap();
        assert!((reg.stats().avg_execution_ms - 110.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn raising_the_ceiling_admits_waiters() {
        let reg = Arc::new(registry(1));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(gate_rx)));
        let g = gate.clone();
        reg.register_tool(
            "block",
            "blocks once",
            Value::Null,
            tool_fn(move |_| {
                let g = g.clone();
                async move {
                    let rx = g.lock().take();
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();

        let blocked = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.execute_tool("block", json!({})).await })
        };
        while reg.stats().running < 1 {
            tokio::task::yield_now().await;
        }
        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.execute_tool("block", json!({})).await })
        };
        while reg.stats().queue_len < 1 {
            tokio::task::yield_now().await;
        }

        reg.set_max_concurrent(2);
        assert!(!waiter.await.unwrap().unwrap().is_error);
        let _ = gate_tx.send(());
        blocked.await.unwrap().unwrap();
    }
}
