//! Per-project unified multiplexer.
//!
//! One virtual MCP endpoint per project. `tools/list` aggregates the
//! catalogs of every enabled upstream under namespaced names;
//! `tools/call` routes to the owning upstream. Failures are quarantined
//! per upstream: a broken server is recorded in the health registry and
//! skipped, and never prevents another server's tools from appearing or
//! being callable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::audit::{ActivitySink, CallStatus, ToolCallRecord};
use crate::config::protocol;
use crate::error::UpstreamError;
use crate::filter::filter_tools;
use crate::health::HealthRegistry;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, codes};
use crate::store::{ConfigStore, UpstreamDef};
use crate::upstream::{SessionManager, ToolDef};

/// Per-dispatch options carried from the client session.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// When true, tools are exposed by their original names and calls are
    /// resolved by probing upstreams. Default: namespaces on.
    pub legacy_mode: bool,
    /// Client session id, threaded into activity records.
    pub client_session_id: Option<String>,
}

/// A tool surfaced through the unified endpoint.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub original_name: String,
    pub description: String,
    pub input_schema: Value,
    pub source_server: String,
    pub namespaced_name: String,
}

impl ToolDescriptor {
    /// Render for a `tools/list` response.
    #[must_use]
    pub fn to_value(&self, legacy_mode: bool) -> Value {
        if legacy_mode {
            json!({
                "name": self.original_name,
                "description": self.description,
                "inputSchema": self.input_schema,
            })
        } else {
            json!({
                "name": self.namespaced_name,
                "description": self.description,
                "inputSchema": self.input_schema,
                "_source_server": self.source_server,
                "_original_name": self.original_name,
                "_namespace": self.namespaced_name
                    .split(protocol::NAMESPACE_SEPARATOR)
                    .next()
                    .unwrap_or(&self.source_server),
            })
        }
    }
}

/// Stable mapping of server names to namespaces for one project endpoint.
///
/// Registered once on first catalog collection; append-mostly afterwards.
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    inner: Mutex<NamespaceMaps>,
}

#[derive(Debug, Default)]
struct NamespaceMaps {
    by_server: HashMap<String, String>,
    by_namespace: HashMap<String, String>,
}

impl NamespaceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server, returning its namespace. Stable: re-registering
    /// returns the original assignment.
    pub fn register(&self, server_name: &str) -> String {
        let mut maps = self.inner.lock().expect("namespace lock");
        if let Some(existing) = maps.by_server.get(server_name) {
            return existing.clone();
        }

        // The separator must not appear inside a namespace.
        let base: String = server_name
            .chars()
            .map(|c| if c == protocol::NAMESPACE_SEPARATOR { '_' } else { c })
            .collect();

        let mut candidate = base.clone();
        let mut suffix = 2;
        while maps.by_namespace.contains_key(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }

        maps.by_server.insert(server_name.to_string(), candidate.clone());
        maps.by_namespace.insert(candidate.clone(), server_name.to_string());
        candidate
    }

    /// Resolve a namespace back to its server name.
    #[must_use]
    pub fn server_for(&self, namespace: &str) -> Option<String> {
        self.inner.lock().expect("namespace lock").by_namespace.get(namespace).cloned()
    }

    /// Namespace previously assigned to a server, if any.
    #[must_use]
    pub fn namespace_for(&self, server_name: &str) -> Option<String> {
        self.inner.lock().expect("namespace lock").by_server.get(server_name).cloned()
    }
}

/// Build `<namespace>.<tool>`.
#[must_use]
pub fn namespaced_name(namespace: &str, tool: &str) -> String {
    format!("{namespace}{}{tool}", protocol::NAMESPACE_SEPARATOR)
}

/// The per-project virtual MCP endpoint.
pub struct UnifiedEndpoint {
    project_id: Uuid,
    store: Arc<dyn ConfigStore>,
    sessions: Arc<SessionManager>,
    health: Arc<HealthRegistry>,
    namespaces: NamespaceRegistry,
    audit: Arc<dyn ActivitySink>,
}

impl UnifiedEndpoint {
    #[must_use]
    pub fn new(
        project_id: Uuid,
        store: Arc<dyn ConfigStore>,
        sessions: Arc<SessionManager>,
        health: Arc<HealthRegistry>,
        audit: Arc<dyn ActivitySink>,
    ) -> Self {
        Self {
            project_id,
            store,
            sessions,
            health,
            namespaces: NamespaceRegistry::new(),
            audit,
        }
    }

    #[must_use]
    pub const fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Handle one client JSON-RPC message. Returns `None` for
    /// notifications, which get no response.
    pub async fn handle(
        &self,
        request: &JsonRpcRequest,
        options: &DispatchOptions,
    ) -> Option<JsonRpcResponse> {
        if request.method.starts_with("notifications/") {
            tracing::debug!(method = %request.method, "client notification accepted");
            return None;
        }

        let id = request.id.clone();
        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(id).await,
            "tools/list" => self.handle_tools_list(id, options).await,
            "tools/call" => self.handle_tools_call(id, &request.params, options).await,
            "resources/list" => {
                JsonRpcResponse::success(id, json!({"resources": []}))
            }
            "resources/templates/list" => {
                JsonRpcResponse::success(id, json!({"resourceTemplates": []}))
            }
            // Advertised empty for client compatibility; the proxy is
            // tools-focused.
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

    async fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        let enabled = self
            .store
            .list_upstreams(self.project_id)
            .await
            .into_iter()
            .filter(|def| def.enabled)
            .count();

        tracing::info!(project_id = %self.project_id, upstreams = enabled, "unified initialize");

        let tools_capability =
            if enabled > 0 { json!({"listChanged": false}) } else { json!({}) };

        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": protocol::UNIFIED_PROTOCOL_VERSION,
                "capabilities": {
                    "experimental": {},
                    "tools": tools_capability,
                    "logging": {},
                    "prompts": {},
                    "resources": {},
                },
                "serverInfo": {
                    "name": protocol::UNIFIED_SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "instructions": format!(
                    "MCP orchestrator unified proxy for project {}.",
                    self.project_id
                ),
            }),
        )
    }

    async fn handle_tools_list(
        &self,
        id: Option<Value>,
        options: &DispatchOptions,
    ) -> JsonRpcResponse {
        let descriptors = self.collect_tools().await;
        let tools: Vec<Value> =
            descriptors.iter().map(|d| d.to_value(options.legacy_mode)).collect();
        JsonRpcResponse::success(id, json!({"tools": tools}))
    }

    /// Aggregate catalogs across all enabled upstreams, concurrently.
    ///
    /// Isolation invariant: one upstream's failure never removes another's
    /// tools from the result.
    pub async fn collect_tools(&self) -> Vec<ToolDescriptor> {
        let defs: Vec<UpstreamDef> = self
            .store
            .list_upstreams(self.project_id)
            .await
            .into_iter()
            .filter(|def| def.enabled)
            .collect();

        let fetches = defs.iter().map(|def| async move {
            if !self.health.check_available(self.project_id, &def.name) {
                tracing::debug!(server = %def.name, "skipping upstream: circuit open");
                return (def, None);
            }
            match self.fetch_catalog(def).await {
                Ok(tools) => (def, Some(tools)),
                Err(err) => {
                    tracing::warn!(server = %def.name, error = %err,
                        "failed to collect tools from upstream");
                    self.note_failure(def, &err).await;
                    (def, None)
                }
            }
        });

        let mut descriptors = Vec::new();
        for (def, outcome) in futures::future::join_all(fetches).await {
            let Some(tools) = outcome else { continue };
            self.health.record_success(self.project_id, &def.name);

            let namespace = self.namespaces.register(&def.name);
            for tool in tools {
                descriptors.push(ToolDescriptor {
                    namespaced_name: namespaced_name(&namespace, &tool.name),
                    original_name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                    source_server: def.name.clone(),
                });
            }
        }

        tracing::info!(
            project_id = %self.project_id,
            tools = descriptors.len(),
            "unified catalog collected"
        );
        descriptors
    }

    /// One upstream's filtered catalog via the session pool.
    async fn fetch_catalog(&self, def: &UpstreamDef) -> Result<Vec<ToolDef>, UpstreamError> {
        let session = self.sessions.get_or_create(def).await?;
        let tools = session.list_tools().await?;
        let preferences =
            self.store.list_tool_preferences(self.project_id, def.id).await;
        Ok(filter_tools(&preferences, tools))
    }

    async fn handle_tools_call(
        &self,
        id: Option<Value>,
        params: &Value,
        options: &DispatchOptions,
    ) -> JsonRpcResponse {
        let Some(tool_name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(
                id,
                codes::INVALID_PARAMS,
                "Invalid params: 'name' is required",
            );
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let resolved = self.resolve_tool(tool_name, options.legacy_mode).await;
        let Some((server_name, original_name)) = resolved else {
            return JsonRpcResponse::error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("Tool not found: {tool_name}"),
            );
        };

        let Some(def) = self.store.get_upstream(self.project_id, &server_name).await else {
            return JsonRpcResponse::error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("Tool not found: {tool_name}"),
            );
        };

        match self.call_tool_on(&def, &original_name, arguments, options).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(err) => JsonRpcResponse::error(id, err.jsonrpc_code(), err.to_string()),
        }
    }

    /// Map a client-facing tool name to `(server_name, original_name)`.
    async fn resolve_tool(&self, tool_name: &str, legacy_mode: bool) -> Option<(String, String)> {
        if !legacy_mode {
            if let Some((namespace, original)) =
                tool_name.split_once(protocol::NAMESPACE_SEPARATOR)
            {
                if let Some(server) = self.namespaces.server_for(namespace) {
                    return Some((server, original.to_string()));
                }
                // The registry may be cold (call before any list); accept a
                // namespace that names a configured server directly.
                if self.store.get_upstream(self.project_id, namespace).await.is_some() {
                    return Some((namespace.to_string(), original.to_string()));
                }
            }
        }

        // Un-namespaced (or unknown prefix): probe upstreams in order until
        // one reports a matching tool.
        let defs = self.store.list_upstreams(self.project_id).await;
        for def in defs.into_iter().filter(|d| d.enabled) {
            if !self.health.check_available(self.project_id, &def.name) {
                continue;
            }
            match self.fetch_catalog(&def).await {
                Ok(tools) => {
                    if tools.iter().any(|t| t.name == tool_name) {
                        tracing::info!(tool = tool_name, server = %def.name,
                            "auto-resolved tool to upstream");
                        return Some((def.name, tool_name.to_string()));
                    }
                }
                Err(err) => {
                    tracing::debug!(server = %def.name, error = %err,
                        "probe failed while resolving tool");
                    self.note_failure(&def, &err).await;
                }
            }
        }
        None
    }

    /// Execute a tool on a specific upstream, with circuit checks, health
    /// bookkeeping, and activity logging.
    ///
    /// Retryable failures (see [`crate::error::RetryClass`]) get up to
    /// three attempts with class-specific waits; repeated initialization
    /// failures recreate the pooled session before the next try.
    pub async fn call_tool_on(
        &self,
        def: &UpstreamDef,
        original_name: &str,
        arguments: Value,
        options: &DispatchOptions,
    ) -> Result<Value, UpstreamError> {
        if !def.enabled {
            return Err(UpstreamError::Config(format!("server `{}` is disabled", def.name)));
        }
        if !self.health.check_available(self.project_id, &def.name) {
            return Err(UpstreamError::Unavailable(def.name.clone()));
        }

        let started = Instant::now();
        let mut attempt = 1;
        let outcome = loop {
            let result = async {
                let session = self.sessions.get_or_create(def).await?;
                session
                    .call_tool(original_name, arguments.clone(), def.request_timeout())
                    .await
            }
            .await;

            let err = match result {
                Ok(value) => break Ok(value),
                Err(err) => err,
            };
            let Some(class) = err.retry_class() else { break Err(err) };
            if attempt >= crate::config::session::CALL_MAX_ATTEMPTS {
                break Err(err);
            }

            tracing::warn!(server = %def.name, tool = original_name, attempt,
                class = ?class, error = %err, "tool call failed, retrying");

            // A session that keeps claiming "not initialized" is wedged;
            // drop it so the next attempt starts fresh.
            if class == crate::error::RetryClass::Initialization && attempt > 1 {
                self.sessions.invalidate(self.project_id, &def.name).await;
            }

            tokio::time::sleep(class.delay(attempt)).await;
            attempt += 1;
        };

        let duration = started.elapsed();
        match &outcome {
            Ok(_) => {
                self.health.record_success(self.project_id, &def.name);
                self.record_call(def, original_name, CallStatus::Success, duration, None, options);
            }
            Err(err) => {
                let status = if matches!(err, UpstreamError::RequestTimeout { .. }) {
                    CallStatus::Timeout
                } else {
                    CallStatus::Failed
                };
                self.note_failure(def, err).await;
                self.record_call(
                    def,
                    original_name,
                    status,
                    duration,
                    Some(err.to_string()),
                    options,
                );
            }
        }

        outcome
    }

    /// Health bookkeeping for a failed interaction. Hard failures feed the
    /// circuit; protocol errors mean the upstream answered and count as
    /// contact, not as circuit failures. Session-fatal errors also evict
    /// the pooled session so the next call spawns fresh.
    async fn note_failure(&self, def: &UpstreamDef, err: &UpstreamError) {
        let hard = err.is_session_fatal()
            || matches!(
                err,
                UpstreamError::RequestTimeout { .. } | UpstreamError::QueueOverflow(_)
            );
        if hard {
            self.health.record_failure(self.project_id, &def.name, &err.to_string());
        }
        if err.is_session_fatal() {
            self.sessions.invalidate(self.project_id, &def.name).await;
        }
    }

    fn record_call(
        &self,
        def: &UpstreamDef,
        tool_name: &str,
        status: CallStatus,
        duration: std::time::Duration,
        error: Option<String>,
        options: &DispatchOptions,
    ) {
        let mut record =
            ToolCallRecord::new(self.project_id, &def.name, tool_name, status, duration);
        if let Some(error) = error {
            record = record.with_error(error);
        }
        if let Some(session_id) = &options.client_session_id {
            record = record.with_client_session(session_id.clone());
        }
        self.audit.record_tool_call(&record);
    }
}

impl std::fmt::Debug for UnifiedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedEndpoint").field("project_id", &self.project_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingSink;
    use crate::config::Settings;
    use crate::store::MemoryStore;

    fn endpoint_with_store(store: Arc<MemoryStore>) -> UnifiedEndpoint {
        UnifiedEndpoint::new(
            Uuid::new_v4(),
            store,
            Arc::new(SessionManager::new(&Settings::for_testing())),
            Arc::new(HealthRegistry::default()),
            Arc::new(TracingSink),
        )
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: Some(json!(1)),
        }
    }

    #[test]
    fn test_namespace_registration_is_stable() {
        let registry = NamespaceRegistry::new();
        let first = registry.register("search");
        let second = registry.register("search");
        assert_eq!(first, second);
        assert_eq!(registry.server_for(&first).as_deref(), Some("search"));
    }

    #[test]
    fn test_namespace_sanitizes_separator() {
        let registry = NamespaceRegistry::new();
        let namespace = registry.register("my.server");
        assert_eq!(namespace, "my_server");
        assert_eq!(registry.server_for("my_server").as_deref(), Some("my.server"));
    }

    #[test]
    fn test_namespace_collisions_get_suffixes() {
        let registry = NamespaceRegistry::new();
        assert_eq!(registry.register("a.b"), "a_b");
        assert_eq!(registry.register("a_b"), "a_b_2");
        assert_eq!(registry.server_for("a_b_2").as_deref(), Some("a_b"));
    }

    #[test]
    fn test_descriptor_rendering() {
        let descriptor = ToolDescriptor {
            original_name: "foo".into(),
            description: "does foo".into(),
            input_schema: json!({"type": "object"}),
            source_server: "alpha".into(),
            namespaced_name: "alpha.foo".into(),
        };

        let standard = descriptor.to_value(false);
        assert_eq!(standard["name"], "alpha.foo");
        assert_eq!(standard["_original_name"], "foo");
        assert_eq!(standard["_source_server"], "alpha");

        let legacy = descriptor.to_value(true);
        assert_eq!(legacy["name"], "foo");
        assert!(legacy.get("_original_name").is_none());
    }

    #[tokio::test]
    async fn test_initialize_without_upstreams_hides_tools_capability() {
        let endpoint = endpoint_with_store(Arc::new(MemoryStore::new()));
        let response = endpoint
            .handle(&request("initialize", json!({})), &DispatchOptions::default())
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], protocol::UNIFIED_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "mcp-orch-unified");
        assert_eq!(result["capabilities"]["tools"], json!({}));
        assert_eq!(result["capabilities"]["resources"], json!({}));
    }

    #[tokio::test]
    async fn test_resources_list_is_empty() {
        let endpoint = endpoint_with_store(Arc::new(MemoryStore::new()));
        let response = endpoint
            .handle(&request("resources/list", json!({})), &DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["resources"], json!([]));

        let response = endpoint
            .handle(
                &request("resources/templates/list", json!({})),
                &DispatchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["resourceTemplates"], json!([]));
    }

    #[tokio::test]
    async fn test_unknown_method_returns_not_found() {
        let endpoint = endpoint_with_store(Arc::new(MemoryStore::new()));
        let response = endpoint
            .handle(&request("sampling/createMessage", json!({})), &DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_prompts_list_is_empty() {
        let endpoint = endpoint_with_store(Arc::new(MemoryStore::new()));
        let response = endpoint
            .handle(&request("prompts/list", json!({})), &DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["prompts"], json!([]));
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let endpoint = endpoint_with_store(Arc::new(MemoryStore::new()));
        let notification = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: "notifications/initialized".into(),
            params: json!({}),
            id: None,
        };
        assert!(endpoint.handle(&notification, &DispatchOptions::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_tools_call_requires_name() {
        let endpoint = endpoint_with_store(Arc::new(MemoryStore::new()));
        let response = endpoint
            .handle(&request("tools/call", json!({})), &DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_tools_call_unknown_tool_not_found() {
        let endpoint = endpoint_with_store(Arc::new(MemoryStore::new()));
        let response = endpoint
            .handle(
                &request("tools/call", json!({"name": "ghost.tool"})),
                &DispatchOptions::default(),
            )
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::METHOD_NOT_FOUND);
        assert!(error.message.contains("ghost.tool"));
    }

    #[tokio::test]
    async fn test_ping_answers_empty_object() {
        let endpoint = endpoint_with_store(Arc::new(MemoryStore::new()));
        let response = endpoint
            .handle(&request("ping", json!({})), &DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.result.unwrap(), json!({}));
    }
}
