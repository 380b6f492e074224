//! mcp-orch: multi-tenant orchestrating proxy for MCP tool servers.
//!
//! Clients connect over Server-Sent Events to a project-scoped endpoint;
//! the proxy fans tool-listing and tool-call requests out to a fleet of
//! upstream MCP servers (local stdio subprocesses or remote SSE peers)
//! and presents one coherent MCP endpoint per project.
//!
//! # Architecture
//!
//! - [`protocol`]: JSON-RPC 2.0 types and chunk-safe newline framing
//! - [`upstream`]: persistent upstream sessions and the pooled registry
//! - [`unified`]: the per-project multiplexer with namespaced catalogs
//! - [`filter`]: per-project tool enable/disable overlay
//! - [`health`]: per-upstream circuit breaker
//! - [`server`]: the client-facing SSE transport and access controller
//! - [`store`]: narrow interface to the external configuration store
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp_orch::{ProxyServer, Settings, store::MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let server = ProxyServer::new(Settings::from_env(), store);
//!     server.run(8000).await
//! }
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod filter;
pub mod health;
pub mod protocol;
pub mod server;
pub mod store;
pub mod unified;
pub mod upstream;

pub use config::Settings;
pub use error::{AuthError, UpstreamError};
pub use server::ProxyServer;
