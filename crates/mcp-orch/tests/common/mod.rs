//! Shared test harness: a scripted SSE MCP upstream and proxy helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use mcp_orch::upstream::sse::SseParser;

/// How a scripted upstream behaves.
#[derive(Clone)]
pub struct UpstreamBehavior {
    /// Tools the upstream reports from `tools/list`.
    pub tools: Vec<(&'static str, &'static str)>,
    /// Emit the `endpoint` bootstrap event on connect.
    pub announce_endpoint: bool,
    /// Answer `tools/call` requests (false simulates a hung tool).
    pub respond_to_calls: bool,
}

impl Default for UpstreamBehavior {
    fn default() -> Self {
        Self {
            tools: vec![("foo", "does foo")],
            announce_endpoint: true,
            respond_to_calls: true,
        }
    }
}

struct ScriptedState {
    behavior: UpstreamBehavior,
    sessions: Mutex<HashMap<String, mpsc::Sender<Value>>>,
    calls: Mutex<Vec<Value>>,
    initialize_count: AtomicU32,
}

/// An in-process MCP server speaking the SSE transport, for driving the
/// proxy's upstream machinery without external processes.
pub struct ScriptedUpstream {
    pub addr: SocketAddr,
    state: Arc<ScriptedState>,
    server: tokio::task::JoinHandle<()>,
}

impl ScriptedUpstream {
    pub async fn start(behavior: UpstreamBehavior) -> Self {
        let state = Arc::new(ScriptedState {
            behavior,
            sessions: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            initialize_count: AtomicU32::new(0),
        });

        let router = axum::Router::new()
            .route("/sse", get(scripted_sse))
            .route("/messages", post(scripted_messages))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, state, server }
    }

    /// SSE URL for an upstream definition.
    pub fn url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }

    /// `tools/call` params received so far.
    pub async fn recorded_calls(&self) -> Vec<Value> {
        self.state.calls.lock().await.clone()
    }

    pub fn initialize_count(&self) -> u32 {
        self.state.initialize_count.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedUpstream {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[derive(serde::Deserialize)]
struct SessionIdQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn scripted_sse(State(state): State<Arc<ScriptedState>>) -> impl IntoResponse {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<Value>(64);
    state.sessions.lock().await.insert(session_id.clone(), tx);

    let announce = state.behavior.announce_endpoint;
    let stream = async_stream::stream! {
        if announce {
            yield Ok::<_, Infallible>(
                Event::default()
                    .event("endpoint")
                    .data(format!("/messages?sessionId={session_id}")),
            );
        }
        while let Some(message) = rx.recv().await {
            yield Ok(Event::default().event("message").data(message.to_string()));
        }
    };

    Sse::new(stream)
}

async fn scripted_messages(
    State(state): State<Arc<ScriptedState>>,
    Query(query): Query<SessionIdQuery>,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    let Some(id) = request.get("id").cloned() else {
        // Notification: accepted, no response.
        return StatusCode::ACCEPTED;
    };
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default();

    let response = match method {
        "initialize" => {
            state.initialize_count.fetch_add(1, Ordering::SeqCst);
            Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "scripted-upstream", "version": "1.0.0"}
                }
            }))
        }
        "tools/list" => {
            let tools: Vec<Value> = state
                .behavior
                .tools
                .iter()
                .map(|(name, description)| {
                    json!({
                        "name": name,
                        "description": description,
                        "inputSchema": {"type": "object", "properties": {}}
                    })
                })
                .collect();
            Some(json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools}}))
        }
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or_default();
            state.calls.lock().await.push(params.clone());
            if state.behavior.respond_to_calls {
                Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{"type": "text", "text": "done"}],
                        "echo": params,
                    }
                }))
            } else {
                None
            }
        }
        other => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("Method not found: {other}")}
        })),
    };

    if let Some(response) = response {
        let sender = state.sessions.lock().await.get(&query.session_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(response).await;
        }
    }

    StatusCode::ACCEPTED
}

/// Serve a router on an ephemeral port.
pub async fn serve_router(router: axum::Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, handle)
}

/// Client-side SSE reader over a reqwest response, reusing the proxy's own
/// incremental parser.
pub struct SseReader {
    stream: std::pin::Pin<
        Box<dyn futures::Stream<Item = Result<axum::body::Bytes, reqwest::Error>> + Send>,
    >,
    parser: SseParser,
    buffered: std::collections::VecDeque<mcp_orch::upstream::sse::SseEvent>,
}

impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        use futures::StreamExt;
        Self {
            stream: response.bytes_stream().boxed(),
            parser: SseParser::new(),
            buffered: std::collections::VecDeque::new(),
        }
    }

    /// Next event within a deadline; panics on timeout to fail the test.
    pub async fn next_event(&mut self, timeout: Duration) -> mcp_orch::upstream::sse::SseEvent {
        use futures::StreamExt;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(event) = self.buffered.pop_front() {
                return event;
            }
            let chunk = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .expect("timed out waiting for SSE event")
                .expect("SSE stream ended")
                .expect("SSE stream errored");
            self.buffered.extend(self.parser.push(&chunk));
        }
    }

    /// Next `message` event parsed as JSON, skipping other event types.
    pub async fn next_message(&mut self, timeout: Duration) -> Value {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("timed out waiting for message event");
            let event = self.next_event(remaining).await;
            if event.name == "message" {
                return serde_json::from_str(&event.data).expect("message payload is JSON");
            }
        }
    }
}
