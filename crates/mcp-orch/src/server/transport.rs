//! Client-facing SSE transport.
//!
//! Two interlocked endpoints per project (unified) and per (project,
//! server): a long-lived SSE stream that first announces the companion
//! messages URL via the MCP `endpoint` event, and a message sink that
//! accepts client JSON-RPC POSTs, dispatches them asynchronously, and
//! returns `202 {"status":"processing"}`; the real response arrives over
//! the SSE stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::AppState;
use super::session::{ClientFingerprint, ClientSession};
use crate::config::{protocol as protocol_config, transport as transport_config};
use crate::error::AuthError;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, codes};
use crate::store::{ProjectConfig, UpstreamDef};
use crate::unified::DispatchOptions;

/// Query parameters shared by message sinks and SSE streams.
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    session_id: Option<String>,
    /// Opt into legacy (un-namespaced) tool naming for this session.
    legacy: Option<bool>,
}

/// Query parameters for the client-config export.
#[derive(Debug, Deserialize)]
pub struct ClientConfigQuery {
    unified: Option<bool>,
}

/// Build the full proxy router.
///
/// The `bridge/` routes are deprecated aliases of the per-server endpoints,
/// kept for clients configured against the old path layout.
pub fn create_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/projects/{project_id}/unified/sse", get(unified_sse))
        .route("/projects/{project_id}/unified/messages", post(unified_messages))
        .route("/projects/{project_id}/servers/{server_name}/sse", get(server_sse))
        .route("/projects/{project_id}/servers/{server_name}/messages", post(server_messages))
        .route("/projects/{project_id}/servers/{server_name}/bridge/sse", get(server_sse))
        .route(
            "/projects/{project_id}/servers/{server_name}/bridge/messages",
            post(server_messages),
        )
        .route("/projects/{project_id}/client-config", get(client_config))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "mcp-orch",
        "version": env!("CARGO_PKG_VERSION"),
        "client_sessions": state.clients.session_count().await,
        "upstream_sessions": state.sessions.session_count().await,
    }))
}

fn bearer_token(auth: Option<&TypedHeader<Authorization<Bearer>>>) -> Option<&str> {
    auth.map(|TypedHeader(Authorization(bearer))| bearer.token())
}

fn fingerprint(headers: &HeaderMap) -> ClientFingerprint {
    let user_agent =
        headers.get("user-agent").and_then(|v| v.to_str().ok()).map(str::to_string);
    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    ClientFingerprint { user_agent, ip_address }
}

fn auth_failure(err: &AuthError) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"detail": err.to_string()}))).into_response()
}

fn not_found(detail: impl Into<String>) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"detail": detail.into()}))).into_response()
}

fn accepted() -> Response {
    (StatusCode::ACCEPTED, Json(json!({"status": "processing"}))).into_response()
}

async fn load_project(state: &AppState, project_id: Uuid) -> Result<ProjectConfig, Response> {
    state
        .store
        .get_project(project_id)
        .await
        .ok_or_else(|| not_found("Project not found"))
}

/// Per-server endpoints use the upstream's own auth override.
async fn load_server(
    state: &AppState,
    project_id: Uuid,
    server_name: &str,
) -> Result<UpstreamDef, Response> {
    match state.store.get_upstream(project_id, server_name).await {
        Some(def) if def.enabled => Ok(def),
        _ => Err(not_found(format!(
            "Server '{server_name}' not found or disabled in project {project_id}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Unified endpoint
// ---------------------------------------------------------------------------

/// GET /projects/{project_id}/unified/sse
async fn unified_sse(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    headers: HeaderMap,
) -> Response {
    let project = match load_project(&state, project_id).await {
        Ok(project) => project,
        Err(response) => return response,
    };

    let principal = match state
        .authenticator
        .authenticate(project.sse_auth_required, bearer_token(auth.as_ref()))
        .await
    {
        Ok(principal) => principal,
        Err(err) => return auth_failure(&err),
    };

    let (session, rx) =
        state.clients.create(project_id, None, principal, fingerprint(&headers)).await;

    let endpoint_url =
        format!("/projects/{project_id}/unified/messages?session_id={}", session.id);
    let stream = session_event_stream(Arc::clone(&state), session, endpoint_url, rx);

    sse_response(stream)
}

/// POST /projects/{project_id}/unified/messages
async fn unified_messages(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<SessionQuery>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let project = match load_project(&state, project_id).await {
        Ok(project) => project,
        Err(response) => return response,
    };

    if let Err(err) = state
        .authenticator
        .authenticate(project.message_auth_required, bearer_token(auth.as_ref()))
        .await
    {
        return auth_failure(&err);
    }

    let Some(session_id) = query.session_id else {
        return not_found("Missing session_id");
    };
    let Some(session) = state.clients.get(&session_id).await else {
        return not_found(format!("Could not find session {session_id}"));
    };

    if let Some(legacy) = query.legacy {
        session.set_legacy_mode(legacy);
    }
    session.count_request();

    tracing::debug!(
        session_id = %session.id,
        method = %request.method,
        "unified message received"
    );

    // Dispatch is asynchronous: the JSON-RPC response goes out over SSE.
    let endpoint = state.unified_endpoint(project_id);
    tokio::spawn(async move {
        let options = DispatchOptions {
            legacy_mode: session.legacy_mode(),
            client_session_id: Some(session.id.clone()),
        };
        if let Some(response) = endpoint.handle(&request, &options).await {
            session.enqueue(response).await;
        }
    });

    accepted()
}

// ---------------------------------------------------------------------------
// Per-server endpoints
// ---------------------------------------------------------------------------

/// GET /projects/{project_id}/servers/{server_name}/sse
async fn server_sse(
    State(state): State<Arc<AppState>>,
    Path((project_id, server_name)): Path<(Uuid, String)>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    headers: HeaderMap,
) -> Response {
    let project = match load_project(&state, project_id).await {
        Ok(project) => project,
        Err(response) => return response,
    };
    let def = match load_server(&state, project_id, &server_name).await {
        Ok(def) => def,
        Err(response) => return response,
    };

    let principal = match state
        .authenticator
        .authenticate(def.effective_jwt_auth_required(&project), bearer_token(auth.as_ref()))
        .await
    {
        Ok(principal) => principal,
        Err(err) => return auth_failure(&err),
    };

    let (session, rx) = state
        .clients
        .create(project_id, Some(server_name.clone()), principal, fingerprint(&headers))
        .await;

    let endpoint_url = format!(
        "/projects/{project_id}/servers/{server_name}/messages?session_id={}",
        session.id
    );
    let stream = session_event_stream(Arc::clone(&state), session, endpoint_url, rx);

    sse_response(stream)
}

/// POST /projects/{project_id}/servers/{server_name}/messages
async fn server_messages(
    State(state): State<Arc<AppState>>,
    Path((project_id, server_name)): Path<(Uuid, String)>,
    Query(query): Query<SessionQuery>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let project = match load_project(&state, project_id).await {
        Ok(project) => project,
        Err(response) => return response,
    };
    let def = match load_server(&state, project_id, &server_name).await {
        Ok(def) => def,
        Err(response) => return response,
    };

    if let Err(err) = state
        .authenticator
        .authenticate(def.effective_jwt_auth_required(&project), bearer_token(auth.as_ref()))
        .await
    {
        return auth_failure(&err);
    }

    let Some(session_id) = query.session_id else {
        return not_found("Missing session_id");
    };
    let Some(session) = state.clients.get(&session_id).await else {
        return not_found(format!("Could not find session {session_id}"));
    };
    session.count_request();

    tokio::spawn(async move {
        if let Some(response) = dispatch_server_message(&state, &def, &session, request).await {
            session.enqueue(response).await;
        }
    });

    accepted()
}

/// Dispatch one message directly into a single upstream session.
///
/// The shared upstream session is initialized once by the proxy, so the
/// client's `initialize` is answered locally instead of being replayed.
async fn dispatch_server_message(
    state: &AppState,
    def: &UpstreamDef,
    session: &ClientSession,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    if request.method.starts_with("notifications/") {
        tracing::debug!(method = %request.method, "client notification accepted");
        return None;
    }

    let id = request.id.clone();
    let response = match request.method.as_str() {
        "initialize" => {
            let requested = request
                .params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(protocol_config::UPSTREAM_PROTOCOL_VERSION);
            JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": requested,
                    "capabilities": {"tools": {}},
                    "serverInfo": {
                        "name": format!("mcp-orch-{}", def.name),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
        }
        "tools/list" => server_tools_list(state, def, id).await,
        "tools/call" => server_tools_call(state, def, session, id, &request.params).await,
        "resources/list" => JsonRpcResponse::success(id, json!({"resources": []})),
        "resources/templates/list" => {
            JsonRpcResponse::success(id, json!({"resourceTemplates": []}))
        }
        "prompts/list" => JsonRpcResponse::success(id, json!({"prompts": []})),
        "ping" => JsonRpcResponse::success(id, json!({})),
        other => JsonRpcResponse::error(
            id,
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        ),
    };
    Some(response)
}

async fn server_tools_list(
    state: &AppState,
    def: &UpstreamDef,
    id: Option<Value>,
) -> JsonRpcResponse {
    let result = async {
        let upstream = state.sessions.get_or_create(def).await?;
        let tools = upstream.list_tools().await?;
        let preferences = state.store.list_tool_preferences(def.project_id, def.id).await;
        Ok::<_, crate::error::UpstreamError>(crate::filter::filter_tools(&preferences, tools))
    }
    .await;

    match result {
        Ok(tools) => {
            state.health.record_success(def.project_id, &def.name);
            let mut rendered: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": t.input_schema,
                    })
                })
                .collect();
            if state.settings.enable_test_tools {
                rendered.push(echo_tool_descriptor());
            }
            JsonRpcResponse::success(id, json!({"tools": rendered}))
        }
        Err(err) => {
            tracing::warn!(server = %def.name, error = %err, "per-server tools/list failed");
            if err.is_session_fatal() {
                state.sessions.invalidate(def.project_id, &def.name).await;
                state.health.record_failure(def.project_id, &def.name, &err.to_string());
            }
            JsonRpcResponse::error(id, err.jsonrpc_code(), err.to_string())
        }
    }
}

async fn server_tools_call(
    state: &AppState,
    def: &UpstreamDef,
    session: &ClientSession,
    id: Option<Value>,
    params: &Value,
) -> JsonRpcResponse {
    let Some(tool_name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::error(
            id,
            codes::INVALID_PARAMS,
            "Invalid params: 'name' is required",
        );
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    // Test-only connectivity tool, enabled explicitly.
    if state.settings.enable_test_tools && tool_name == "echo" {
        let message = arguments.get("message").and_then(Value::as_str).unwrap_or("");
        return JsonRpcResponse::success(
            id,
            json!({"content": [{"type": "text", "text": message}]}),
        );
    }

    let options = DispatchOptions {
        legacy_mode: false,
        client_session_id: Some(session.id.clone()),
    };
    let endpoint = state.unified_endpoint(def.project_id);
    match endpoint.call_tool_on(def, tool_name, arguments, &options).await {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(err) => JsonRpcResponse::error(id, err.jsonrpc_code(), err.to_string()),
    }
}

fn echo_tool_descriptor() -> Value {
    json!({
        "name": "echo",
        "description": "Echo a message back through the proxy (test tool)",
        "inputSchema": {
            "type": "object",
            "properties": {
                "message": {"type": "string", "description": "Message to echo"}
            },
            "required": ["message"]
        }
    })
}

// ---------------------------------------------------------------------------
// SSE stream assembly
// ---------------------------------------------------------------------------

/// Removes the client session from the registry when the SSE stream drops.
struct DisconnectGuard {
    state: Arc<AppState>,
    session_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let state = Arc::clone(&self.state);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            state.clients.remove(&session_id).await;
        });
    }
}

/// The per-session SSE stream: `endpoint` bootstrap event, a short
/// stabilization delay, then every queued JSON-RPC response as a `message`
/// event. Client disconnects end the stream silently.
fn session_event_stream(
    state: Arc<AppState>,
    session: Arc<ClientSession>,
    endpoint_url: String,
    rx: tokio::sync::mpsc::Receiver<JsonRpcResponse>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    use futures::StreamExt;
    use tokio_stream::wrappers::ReceiverStream;

    let guard = DisconnectGuard { state, session_id: session.id.clone() };
    let mut responses = ReceiverStream::new(rx);

    async_stream::stream! {
        // Guard lives as long as the stream; dropping it deregisters the
        // session.
        let _guard = guard;

        tracing::debug!(session_id = %session.id, endpoint = %endpoint_url,
            "announcing message endpoint");
        yield Ok(Event::default().event("endpoint").data(endpoint_url));

        tokio::time::sleep(transport_config::STREAM_STABILIZATION).await;

        while let Some(response) = responses.next().await {
            let payload = match serde_json::to_string(&response) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to serialize response");
                    continue;
                }
            };
            yield Ok(Event::default().event("message").data(payload));
        }
    }
}

fn sse_response(stream: impl Stream<Item = Result<Event, Infallible>> + Send + 'static) -> Response {
    (
        [
            ("X-Accel-Buffering", "no"),
            ("Cache-Control", "no-cache, no-store, must-revalidate"),
        ],
        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(transport_config::KEEP_ALIVE_INTERVAL)
                .text("ping"),
        ),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Client-config export
// ---------------------------------------------------------------------------

/// GET /projects/{project_id}/client-config
///
/// Emits an `mcpServers` block for MCP clients, pointing either at the
/// unified endpoint or at per-server endpoints.
async fn client_config(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<ClientConfigQuery>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> Response {
    let project = match load_project(&state, project_id).await {
        Ok(project) => project,
        Err(response) => return response,
    };

    if let Err(err) = state
        .authenticator
        .authenticate(project.message_auth_required, bearer_token(auth.as_ref()))
        .await
    {
        return auth_failure(&err);
    }

    let use_unified = query.unified.unwrap_or(project.unified_mcp_enabled);
    let base_url = state.settings.server_base_url.trim_end_matches('/');
    let servers: Vec<UpstreamDef> = state
        .store
        .list_upstreams(project_id)
        .await
        .into_iter()
        .filter(|def| def.enabled)
        .collect();

    let mut mcp_servers = serde_json::Map::new();
    if use_unified {
        let requires_auth =
            servers.iter().any(|def| def.effective_jwt_auth_required(&project));
        let mut entry = json!({
            "type": "sse",
            "url": format!("{base_url}/projects/{project_id}/unified/sse"),
            "timeout": 60,
            "disabled": false,
        });
        if requires_auth {
            entry["headers"] = json!({"Authorization": "Bearer ${MCP_API_KEY}"});
        }
        mcp_servers.insert(format!("mcp-orch-unified-{project_id}"), entry);
    } else {
        for def in &servers {
            let mut entry = json!({
                "type": "sse",
                "url": format!(
                    "{base_url}/projects/{project_id}/servers/{}/sse",
                    def.name
                ),
                "timeout": def.timeout_secs,
                "disabled": false,
            });
            if def.effective_jwt_auth_required(&project) {
                entry["headers"] = json!({"Authorization": "Bearer ${MCP_API_KEY}"});
            }
            mcp_servers.insert(format!("project-{project_id}-{}", def.name), entry);
        }
    }

    Json(json!({
        "project_id": project_id,
        "project_name": project.name,
        "mode": if use_unified { "unified" } else { "individual" },
        "servers_count": servers.len(),
        "config": {"mcpServers": mcp_servers},
    }))
    .into_response()
}
