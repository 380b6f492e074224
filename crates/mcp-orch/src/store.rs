//! Config-store interface.
//!
//! The proxy core never owns the mapping of projects to upstream server
//! definitions; it reads it through the narrow [`ConfigStore`] trait. A
//! persistent implementation lives outside the core. [`MemoryStore`] is the
//! in-process implementation used by tests and the development CLI.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::session;

/// How the proxy reaches an upstream server.
///
/// Exactly one of the two shapes applies to a definition; the enum encodes
/// the invariant that `command` and `url` are mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamTransport {
    /// Local subprocess speaking JSON-RPC over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Overlaid onto the parent environment at spawn time.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote server speaking JSON-RPC over SSE.
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// One upstream MCP server definition, immutable per lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamDef {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub transport: UpstreamTransport,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub enabled: bool,
    /// Per-server JWT requirement; `None` falls back to the project policy.
    pub jwt_auth_required: Option<bool>,
}

impl UpstreamDef {
    /// Per-request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            session::DEFAULT_REQUEST_TIMEOUT
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Effective JWT requirement: the server override, falling back to the
    /// project's message policy.
    #[must_use]
    pub fn effective_jwt_auth_required(&self, project: &ProjectConfig) -> bool {
        self.jwt_auth_required.unwrap_or(project.message_auth_required)
    }

    #[must_use]
    pub const fn is_stdio(&self) -> bool {
        matches!(self.transport, UpstreamTransport::Stdio { .. })
    }

    #[must_use]
    pub const fn is_sse(&self) -> bool {
        matches!(self.transport, UpstreamTransport::Sse { .. })
    }
}

/// Per-project security and endpoint policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: Uuid,
    pub name: String,
    /// Require authentication on SSE stream connects.
    pub sse_auth_required: bool,
    /// Require authentication on message POSTs.
    pub message_auth_required: bool,
    /// Whether the client-config export defaults to the unified endpoint.
    pub unified_mcp_enabled: bool,
}

impl ProjectConfig {
    /// A project with authentication required everywhere.
    #[must_use]
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            sse_auth_required: true,
            message_auth_required: true,
            unified_mcp_enabled: true,
        }
    }

    /// A project that accepts anonymous connections (development).
    #[must_use]
    pub fn open(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            sse_auth_required: false,
            message_auth_required: false,
            unified_mcp_enabled: true,
        }
    }
}

/// Per-(project, server, tool) enable override. Absence means enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPreference {
    pub project_id: Uuid,
    pub server_id: Uuid,
    pub tool_name: String,
    pub enabled: bool,
}

/// Opaque identity yielded by the access controller. The core does not
/// interpret it beyond logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable subject identifier (user id, key id).
    pub subject: String,
    /// Project the credential is scoped to, when it is a project key.
    pub project_id: Option<Uuid>,
}

/// Narrow read interface over the persistent configuration.
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    /// All upstream definitions for a project, in stable enumeration order.
    async fn list_upstreams(&self, project_id: Uuid) -> Vec<UpstreamDef>;

    /// One upstream definition by name.
    async fn get_upstream(&self, project_id: Uuid, server_name: &str) -> Option<UpstreamDef>;

    /// Project policy record.
    async fn get_project(&self, project_id: Uuid) -> Option<ProjectConfig>;

    /// Tool preferences for one (project, server) pair.
    async fn list_tool_preferences(
        &self,
        project_id: Uuid,
        server_id: Uuid,
    ) -> Vec<ToolPreference>;

    /// Resolve a bearer API key (`project_…` / `mch_…`) to a principal.
    async fn resolve_api_key(&self, token: &str) -> Option<Principal>;
}

/// SHA-256 hex digest used for API-key storage and lookup.
#[must_use]
pub fn hash_api_key(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{digest:x}")
}

/// In-memory [`ConfigStore`] for tests and the development CLI.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    projects: HashMap<Uuid, ProjectConfig>,
    upstreams: Vec<UpstreamDef>,
    preferences: Vec<ToolPreference>,
    /// Keyed by SHA-256 hex of the token.
    api_keys: HashMap<String, Principal>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, project: ProjectConfig) {
        self.inner.write().expect("store lock").projects.insert(project.id, project);
    }

    pub fn add_upstream(&self, def: UpstreamDef) {
        self.inner.write().expect("store lock").upstreams.push(def);
    }

    pub fn set_tool_preference(
        &self,
        project_id: Uuid,
        server_id: Uuid,
        tool_name: impl Into<String>,
        enabled: bool,
    ) {
        let tool_name = tool_name.into();
        let mut inner = self.inner.write().expect("store lock");
        // Tuple uniqueness: replace an existing row for the same key.
        inner.preferences.retain(|p| {
            !(p.project_id == project_id && p.server_id == server_id && p.tool_name == tool_name)
        });
        inner.preferences.push(ToolPreference { project_id, server_id, tool_name, enabled });
    }

    pub fn add_api_key(&self, token: &str, principal: Principal) {
        self.inner
            .write()
            .expect("store lock")
            .api_keys
            .insert(hash_api_key(token), principal);
    }

    /// Flip an upstream's `enabled` flag. Returns false when unknown.
    pub fn set_upstream_enabled(&self, project_id: Uuid, server_name: &str, enabled: bool) -> bool {
        let mut inner = self.inner.write().expect("store lock");
        for def in &mut inner.upstreams {
            if def.project_id == project_id && def.name == server_name {
                def.enabled = enabled;
                return true;
            }
        }
        false
    }
}

#[async_trait::async_trait]
impl ConfigStore for MemoryStore {
    async fn list_upstreams(&self, project_id: Uuid) -> Vec<UpstreamDef> {
        self.inner
            .read()
            .expect("store lock")
            .upstreams
            .iter()
            .filter(|def| def.project_id == project_id)
            .cloned()
            .collect()
    }

    async fn get_upstream(&self, project_id: Uuid, server_name: &str) -> Option<UpstreamDef> {
        self.inner
            .read()
            .expect("store lock")
            .upstreams
            .iter()
            .find(|def| def.project_id == project_id && def.name == server_name)
            .cloned()
    }

    async fn get_project(&self, project_id: Uuid) -> Option<ProjectConfig> {
        self.inner.read().expect("store lock").projects.get(&project_id).cloned()
    }

    async fn list_tool_preferences(
        &self,
        project_id: Uuid,
        server_id: Uuid,
    ) -> Vec<ToolPreference> {
        self.inner
            .read()
            .expect("store lock")
            .preferences
            .iter()
            .filter(|p| p.project_id == project_id && p.server_id == server_id)
            .cloned()
            .collect()
    }

    async fn resolve_api_key(&self, token: &str) -> Option<Principal> {
        let inner = self.inner.read().expect("store lock");
        inner
            .api_keys
            .get(&hash_api_key(token))
            // Plaintext fallback kept for keys imported from older stores.
            .or_else(|| inner.api_keys.get(token))
            .cloned()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("store lock");
        f.debug_struct("MemoryStore")
            .field("projects", &inner.projects.len())
            .field("upstreams", &inner.upstreams.len())
            .finish()
    }
}

/// Convenience constructor for a stdio upstream definition.
#[must_use]
pub fn stdio_upstream(
    project_id: Uuid,
    name: impl Into<String>,
    command: impl Into<String>,
    args: Vec<String>,
) -> UpstreamDef {
    UpstreamDef {
        id: Uuid::new_v4(),
        project_id,
        name: name.into(),
        transport: UpstreamTransport::Stdio {
            command: command.into(),
            args,
            env: HashMap::new(),
        },
        timeout_secs: 60,
        enabled: true,
        jwt_auth_required: None,
    }
}

/// Convenience constructor for an SSE upstream definition.
#[must_use]
pub fn sse_upstream(project_id: Uuid, name: impl Into<String>, url: impl Into<String>) -> UpstreamDef {
    UpstreamDef {
        id: Uuid::new_v4(),
        project_id,
        name: name.into(),
        transport: UpstreamTransport::Sse { url: url.into(), headers: HashMap::new() },
        timeout_secs: 30,
        enabled: true,
        jwt_auth_required: None,
    }
}
