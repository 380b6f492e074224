//! Client-facing proxy server.
//!
//! Assembles the shared application state (config store, upstream session
//! pool, health registry, client sessions, access controller), builds the
//! axum router, and runs it with graceful shutdown.

pub mod auth;
pub mod session;
pub mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::audit::{ActivitySink, TracingSink};
use crate::config::Settings;
use crate::health::HealthRegistry;
use crate::store::ConfigStore;
use crate::unified::UnifiedEndpoint;
use crate::upstream::SessionManager;
use auth::Authenticator;
use session::ClientSessionManager;

/// Shared state behind every handler.
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<dyn ConfigStore>,
    /// Upstream session pool.
    pub sessions: Arc<SessionManager>,
    /// Connected downstream clients.
    pub clients: Arc<ClientSessionManager>,
    pub health: Arc<HealthRegistry>,
    pub audit: Arc<dyn ActivitySink>,
    pub authenticator: Authenticator,
    /// One multiplexer per project, created on first use. The namespace
    /// registry inside stays stable for the endpoint's lifetime.
    endpoints: Mutex<HashMap<Uuid, Arc<UnifiedEndpoint>>>,
}

impl AppState {
    /// The project's unified endpoint, created on first use.
    pub fn unified_endpoint(&self, project_id: Uuid) -> Arc<UnifiedEndpoint> {
        let mut endpoints = self.endpoints.lock().expect("endpoints lock");
        Arc::clone(endpoints.entry(project_id).or_insert_with(|| {
            Arc::new(UnifiedEndpoint::new(
                project_id,
                Arc::clone(&self.store),
                Arc::clone(&self.sessions),
                Arc::clone(&self.health),
                Arc::clone(&self.audit),
            ))
        }))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").field("settings", &self.settings).finish()
    }
}

/// The orchestrating proxy server.
pub struct ProxyServer {
    state: Arc<AppState>,
}

impl ProxyServer {
    /// Build a server with the default tracing activity sink.
    #[must_use]
    pub fn new(settings: Settings, store: Arc<dyn ConfigStore>) -> Self {
        Self::with_sink(settings, store, Arc::new(TracingSink))
    }

    /// Build a server with a custom activity sink.
    #[must_use]
    pub fn with_sink(
        settings: Settings,
        store: Arc<dyn ConfigStore>,
        audit: Arc<dyn ActivitySink>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(&settings));
        let clients = Arc::new(ClientSessionManager::new(Arc::clone(&audit)));
        let authenticator = Authenticator::new(Arc::clone(&store), &settings);

        let state = Arc::new(AppState {
            settings,
            store,
            sessions,
            clients,
            health: Arc::new(HealthRegistry::default()),
            audit,
            authenticator,
            endpoints: Mutex::new(HashMap::new()),
        });

        Self { state }
    }

    /// Shared state, for embedding the router elsewhere.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// The proxy router with background maintenance tasks started.
    #[must_use]
    pub fn router(&self) -> axum::Router {
        self.state.sessions.start_cleanup_task();
        self.state.clients.start_cleanup_task();
        transport::create_router(Arc::clone(&self.state))
    }

    /// Serve on the given port until shutdown.
    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let router = self.router();
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        tracing::info!("proxy listening on http://{addr}");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

        self.state.sessions.shutdown().await;
        self.state.clients.stop();
        tracing::info!("proxy shut down");
        Ok(())
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer").finish()
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    tracing::info!("received shutdown signal");
}
