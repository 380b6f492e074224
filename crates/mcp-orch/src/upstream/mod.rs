//! Upstream MCP sessions.
//!
//! An [`UpstreamSession`] is one persistent JSON-RPC conversation with one
//! upstream server, either a stdio child or a remote SSE peer. The session owns
//! the request/response correlation state: a pending map of one-shot slots
//! keyed by request id, a bounded out-of-order holding queue for responses
//! that arrive before their caller is waiting, and a retired-id set so that
//! responses arriving after a timeout are dropped instead of resolving a
//! later request.
//!
//! ## Correlation contract
//!
//! For every `request()` there is exactly one inbound message with the same
//! id that resolves or rejects its slot. Ids are monotonic and unique
//! within a session. If no matching message arrives before the deadline the
//! slot is rejected with `RequestTimeout` and the id is retired; a late
//! arrival is dropped with a warning.

pub mod manager;
pub mod sse;
pub mod stdio;
pub mod transport;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::{protocol as protocol_config, session as session_config};
use crate::error::{UpstreamError, UpstreamResult};
use crate::store::{UpstreamDef, UpstreamTransport};
use transport::{Inbound, Transport};

pub use manager::{SessionKey, SessionManager};
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// One tool from an upstream catalog, normalized.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's arguments.
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    json!({"type": "object", "properties": {}, "required": []})
}

impl ToolDef {
    /// Normalize a raw catalog entry. Accepts both `inputSchema` and the
    /// older `schema` key.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let name = value.get("name")?.as_str()?.to_string();
        let description =
            value.get("description").and_then(Value::as_str).unwrap_or_default().to_string();
        let input_schema = value
            .get("inputSchema")
            .or_else(|| value.get("schema"))
            .cloned()
            .unwrap_or_else(default_schema);
        Some(Self { name, description, input_schema })
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Starting,
    Ready,
    Closing,
    Closed,
}

/// Correlation state shared between the session and its reader task.
struct Correlation {
    pending: Mutex<HashMap<u64, oneshot::Sender<UpstreamResult<Value>>>>,
    /// Responses whose caller was not yet waiting; bounded.
    out_of_order: Mutex<VecDeque<Value>>,
    /// Ids whose slot timed out; late matches are dropped.
    retired: Mutex<HashSet<u64>>,
    state: Mutex<SessionState>,
}

impl Correlation {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            out_of_order: Mutex::new(VecDeque::new()),
            retired: Mutex::new(HashSet::new()),
            state: Mutex::new(SessionState::New),
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("state lock") = state;
    }

    fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    /// Fail every pending slot; used on close and fatal transport errors.
    fn fail_all_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().expect("pending lock");
        for (id, slot) in pending.drain() {
            tracing::debug!(request_id = id, reason, "failing pending request");
            let _ = slot.send(Err(UpstreamError::SessionClosed(reason.to_string())));
        }
    }

    fn clear_buffers(&self) {
        self.out_of_order.lock().expect("queue lock").clear();
        self.retired.lock().expect("retired lock").clear();
    }
}

/// Extract a numeric JSON-RPC id. The proxy only allocates numeric ids, so
/// anything else on this session is not a response to us.
fn message_id(message: &Value) -> Option<u64> {
    match message.get("id") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// One persistent JSON-RPC session to one upstream server.
pub struct UpstreamSession {
    /// Opaque session identifier for logs.
    session_id: String,
    def: UpstreamDef,
    transport: Arc<dyn Transport>,
    correlation: Arc<Correlation>,
    next_request_id: AtomicU64,
    initialized: AtomicBool,
    /// Serializes the initialization handshake.
    init_lock: tokio::sync::Mutex<()>,
    /// Serializes message writes so frames never interleave.
    send_lock: tokio::sync::Mutex<()>,
    /// Session-scoped catalog cache. Filtering is applied by callers on
    /// every read, so preferences stay live.
    tools_cache: Mutex<Option<Vec<ToolDef>>>,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    reader: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UpstreamSession {
    /// Start a session for the given definition.
    ///
    /// `skip_init` marks the session initialized without performing the
    /// handshake; per-server bridge traffic relays the client's own
    /// initialize instead.
    pub async fn start(def: &UpstreamDef, skip_init: bool) -> UpstreamResult<Arc<Self>> {
        let (transport, inbound): (Arc<dyn Transport>, Inbound) = match &def.transport {
            UpstreamTransport::Stdio { .. } => {
                let (t, rx) = StdioTransport::spawn(def)?;
                (Arc::new(t), rx)
            }
            UpstreamTransport::Sse { .. } => {
                let (t, rx) = SseTransport::connect(def).await?;
                (Arc::new(t), rx)
            }
        };

        Ok(Self::from_parts(def.clone(), transport, inbound, skip_init))
    }

    /// Assemble a session from an already-established transport.
    ///
    /// Public so tests can drive a session over in-memory channels.
    #[must_use]
    pub fn from_parts(
        def: UpstreamDef,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
        skip_init: bool,
    ) -> Arc<Self> {
        let correlation = Arc::new(Correlation::new());
        correlation.set_state(SessionState::Starting);

        let session = Arc::new(Self {
            session_id: format!("{}-{}", def.name, Uuid::new_v4()),
            def,
            transport,
            correlation: Arc::clone(&correlation),
            next_request_id: AtomicU64::new(0),
            initialized: AtomicBool::new(skip_init),
            init_lock: tokio::sync::Mutex::new(()),
            send_lock: tokio::sync::Mutex::new(()),
            tools_cache: Mutex::new(None),
            created_at: Instant::now(),
            last_used_at: Mutex::new(Instant::now()),
            reader: std::sync::Mutex::new(None),
        });

        let reader = tokio::spawn(run_reader(inbound, correlation, session.session_id.clone()));
        *session.reader.lock().expect("reader lock") = Some(reader);
        session.correlation.set_state(SessionState::Ready);

        session
    }

    /// Opaque session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The definition this session was created from.
    #[must_use]
    pub const fn def(&self) -> &UpstreamDef {
        &self.def
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.correlation.state()
    }

    /// Liveness without traffic: the session is `Ready` and its transport
    /// reports alive (child not exited / SSE stream connected).
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state() == SessionState::Ready && self.transport.is_alive()
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How long since the session was last used.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used_at.lock().expect("last-used lock").elapsed()
    }

    /// Update `last_used_at`. Monotonically non-decreasing.
    pub fn touch(&self) {
        let mut last = self.last_used_at.lock().expect("last-used lock");
        let now = Instant::now();
        if now > *last {
            *last = now;
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Perform the MCP initialization handshake. Idempotent; concurrent
    /// callers serialize on the init lock and the winner does the work.
    ///
    /// Retries up to three times with exponential backoff, but only when
    /// the failure matches "not initialized" semantics; anything else
    /// propagates immediately.
    pub async fn initialize(&self) -> UpstreamResult<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        tracing::info!(session = %self.session_id, "initializing upstream session");

        let mut attempt = 1;
        loop {
            if attempt > 1 {
                let delay = session_config::INIT_BACKOFF_BASE * 2u32.pow(attempt - 2);
                tracing::info!(session = %self.session_id, attempt, ?delay,
                    "retrying initialization");
                tokio::time::sleep(delay).await;
            }

            match self.initialize_once().await {
                Ok(()) => {
                    self.initialized.store(true, Ordering::SeqCst);
                    tracing::info!(session = %self.session_id, attempt, "session initialized");
                    return Ok(());
                }
                Err(err) if err.is_initialization_error()
                    && attempt < session_config::INIT_MAX_RETRIES =>
                {
                    tracing::warn!(session = %self.session_id, attempt, error = %err,
                        "initialization not ready");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn initialize_once(&self) -> UpstreamResult<()> {
        let params = json!({
            "protocolVersion": protocol_config::UPSTREAM_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": protocol_config::CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        self.request_raw("initialize", params, session_config::INITIALIZE_TIMEOUT).await?;
        self.notify("notifications/initialized", json!({})).await?;

        // Some servers reject traffic immediately after the handshake.
        tokio::time::sleep(session_config::STABILIZATION_DELAY).await;
        Ok(())
    }

    /// Send a request and await its correlated response.
    ///
    /// Initializes the session first when required.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> UpstreamResult<Value> {
        if !self.is_initialized() && method != "initialize" {
            self.initialize().await?;
        }
        self.request_raw(method, params, timeout).await
    }

    /// Request without the implicit initialization step.
    async fn request_raw(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> UpstreamResult<Value> {
        match self.state() {
            SessionState::Ready => {}
            state => {
                return Err(UpstreamError::SessionClosed(format!("session is {state:?}")));
            }
        }

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (slot_tx, slot_rx) = oneshot::channel();
        self.correlation.pending.lock().expect("pending lock").insert(id, slot_tx);

        // An interleaved response for this id may already be parked in the
        // holding queue; consult it before waiting on new bytes.
        if let Some(queued) = self.take_queued_response(id) {
            self.correlation.pending.lock().expect("pending lock").remove(&id);
            self.touch();
            return interpret_response(method, queued);
        }

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        {
            let _send = self.send_lock.lock().await;
            if let Err(err) = self.transport.send_json(&message).await {
                self.correlation.pending.lock().expect("pending lock").remove(&id);
                if err.is_session_fatal() {
                    self.correlation.set_state(SessionState::Closing);
                }
                return Err(err);
            }
        }

        self.touch();
        tracing::debug!(session = %self.session_id, method, request_id = id, "request sent");

        match tokio::time::timeout(timeout, slot_rx).await {
            Ok(Ok(result)) => {
                self.touch();
                result.and_then(|message| interpret_response(method, message))
            }
            Ok(Err(_)) => Err(UpstreamError::SessionClosed("reader stopped".into())),
            Err(_) => {
                // Retire the id so a late arrival cannot resolve a future
                // request.
                self.correlation.pending.lock().expect("pending lock").remove(&id);
                self.correlation.retired.lock().expect("retired lock").insert(id);
                Err(UpstreamError::RequestTimeout { method: method.to_string(), timeout })
            }
        }
    }

    fn take_queued_response(&self, id: u64) -> Option<Value> {
        let mut queue = self.correlation.out_of_order.lock().expect("queue lock");
        let position = queue.iter().position(|m| message_id(m) == Some(id))?;
        queue.remove(position)
    }

    /// Fire-and-forget JSON-RPC notification.
    pub async fn notify(&self, method: &str, params: Value) -> UpstreamResult<()> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let _send = self.send_lock.lock().await;
        self.transport.send_json(&message).await
    }

    /// Fetch the upstream tool catalog, reusing the session-scoped cache.
    pub async fn list_tools(&self) -> UpstreamResult<Vec<ToolDef>> {
        if let Some(cached) = self.tools_cache.lock().expect("tools lock").clone() {
            tracing::debug!(session = %self.session_id, "using cached tool catalog");
            return Ok(cached);
        }

        let result = self
            .request("tools/list", json!({}), session_config::INITIALIZE_TIMEOUT)
            .await?;

        let tools: Vec<ToolDef> = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|raw| raw.iter().filter_map(ToolDef::from_value).collect())
            .unwrap_or_default();

        *self.tools_cache.lock().expect("tools lock") = Some(tools.clone());
        tracing::info!(session = %self.session_id, count = tools.len(), "cached tool catalog");
        Ok(tools)
    }

    /// Call one tool by its original name, returning the upstream result
    /// verbatim.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> UpstreamResult<Value> {
        // Some servers require the arguments key even when empty.
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        self.request(
            "tools/call",
            json!({"name": tool_name, "arguments": arguments}),
            timeout,
        )
        .await
    }

    /// Close the session: stop the reader, tear down the transport, and
    /// fail every pending request.
    pub async fn close(&self) {
        {
            let mut state = self.correlation.state.lock().expect("state lock");
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }

        tracing::info!(session = %self.session_id, "closing upstream session");

        if let Some(reader) = self.reader.lock().expect("reader lock").take() {
            reader.abort();
        }
        self.transport.close().await;
        self.correlation.fail_all_pending("session closed");
        self.correlation.clear_buffers();
        *self.tools_cache.lock().expect("tools lock") = None;
        self.initialized.store(false, Ordering::SeqCst);
        self.correlation.set_state(SessionState::Closed);
    }
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("session_id", &self.session_id)
            .field("server", &self.def.name)
            .field("state", &self.state())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Convert a correlated JSON-RPC message into the caller's result.
fn interpret_response(method: &str, message: Value) -> UpstreamResult<Value> {
    if let Some(error) = message.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000) as i32;
        let text = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        tracing::debug!(method, code, error = %text, "upstream returned error");
        return Err(UpstreamError::protocol(code, text));
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

/// Single reader per session: routes every inbound message to its pending
/// slot, the out-of-order queue, or the notification log.
async fn run_reader(mut inbound: Inbound, correlation: Arc<Correlation>, session_id: String) {
    while let Some(message) = inbound.recv().await {
        match message_id(&message) {
            Some(id) => {
                if correlation.retired.lock().expect("retired lock").remove(&id) {
                    tracing::warn!(session = %session_id, request_id = id,
                        "dropping late response for retired request");
                    continue;
                }

                let slot = correlation.pending.lock().expect("pending lock").remove(&id);
                match slot {
                    Some(slot) => {
                        let _ = slot.send(Ok(message));
                    }
                    None => {
                        // Response raced ahead of its waiter; park it.
                        let mut queue =
                            correlation.out_of_order.lock().expect("queue lock");
                        if queue.len() >= session_config::OUT_OF_ORDER_LIMIT {
                            tracing::warn!(session = %session_id,
                                limit = session_config::OUT_OF_ORDER_LIMIT,
                                "out-of-order queue full, dropping oldest message");
                            queue.pop_front();
                        }
                        tracing::debug!(session = %session_id, request_id = id,
                            "holding out-of-order message");
                        queue.push_back(message);
                    }
                }
            }
            None => {
                let method = message.get("method").and_then(Value::as_str).unwrap_or("?");
                tracing::debug!(session = %session_id, method, "upstream notification");
            }
        }
    }

    // Transport gone: everything still pending fails now.
    tracing::debug!(session = %session_id, "inbound channel closed");
    correlation.set_state(SessionState::Closing);
    correlation.fail_all_pending("transport disconnected");
}
