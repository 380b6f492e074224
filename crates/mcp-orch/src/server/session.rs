//! Client session management.
//!
//! A [`ClientSession`] pairs a long-lived SSE stream with the companion
//! message endpoint. Responses produced by asynchronous dispatch are pushed
//! onto the session's bounded outbound queue; the SSE task drains it. A
//! full queue blocks the dispatcher cooperatively, so slow clients throttle
//! but never lose responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::audit::{ActivitySink, SessionEvent};
use crate::config::transport as transport_config;
use crate::protocol::JsonRpcResponse;
use crate::store::Principal;

/// Client fingerprint captured at connect time.
#[derive(Debug, Clone, Default)]
pub struct ClientFingerprint {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl ClientFingerprint {
    /// Best-effort client identification from the user agent.
    #[must_use]
    pub fn client_type(&self) -> &'static str {
        let Some(agent) = &self.user_agent else { return "unknown" };
        let agent = agent.to_lowercase();
        if agent.contains("cline") {
            "cline"
        } else if agent.contains("cursor") {
            "cursor"
        } else if agent.contains("vscode") {
            "vscode"
        } else if agent.contains("roo") {
            "roo"
        } else if agent == "node" {
            "node_client"
        } else {
            "unknown"
        }
    }
}

/// One connected client.
pub struct ClientSession {
    pub id: String,
    pub project_id: Uuid,
    /// Set for per-server endpoints, `None` for the unified endpoint.
    pub server_name: Option<String>,
    pub principal: Option<Principal>,
    pub fingerprint: ClientFingerprint,
    outbound: mpsc::Sender<JsonRpcResponse>,
    active: AtomicBool,
    legacy_mode: AtomicBool,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    created_at: Instant,
    expires_at: Instant,
}

impl ClientSession {
    /// Queue a response for SSE delivery. Blocks when the queue is full;
    /// a disconnected client is squelched with a debug log.
    pub async fn enqueue(&self, response: JsonRpcResponse) {
        if response.error.is_some() {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        if self.outbound.send(response).await.is_err() {
            tracing::debug!(session_id = %self.id, "client gone, dropping response");
            self.active.store(false, Ordering::SeqCst);
        }
    }

    pub fn count_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && Instant::now() < self.expires_at
    }

    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Legacy naming mode: original tool names, probe-based call routing.
    /// Off by default; namespaced names are authoritative.
    #[must_use]
    pub fn legacy_mode(&self) -> bool {
        self.legacy_mode.load(Ordering::Relaxed)
    }

    pub fn set_legacy_mode(&self, on: bool) {
        self.legacy_mode.store(on, Ordering::Relaxed);
    }

    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("server_name", &self.server_name)
            .field("client", &self.fingerprint.client_type())
            .finish()
    }
}

/// Registry of connected clients, keyed by session id.
pub struct ClientSessionManager {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    audit: Arc<dyn ActivitySink>,
    cleanup: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClientSessionManager {
    #[must_use]
    pub fn new(audit: Arc<dyn ActivitySink>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            audit,
            cleanup: std::sync::Mutex::new(None),
        }
    }

    /// Allocate a session and the receiver its SSE stream drains.
    pub async fn create(
        &self,
        project_id: Uuid,
        server_name: Option<String>,
        principal: Option<Principal>,
        fingerprint: ClientFingerprint,
    ) -> (Arc<ClientSession>, mpsc::Receiver<JsonRpcResponse>) {
        let (tx, rx) = mpsc::channel(transport_config::OUTBOUND_QUEUE_CAPACITY);
        let now = Instant::now();
        let session = Arc::new(ClientSession {
            id: Uuid::new_v4().to_string(),
            project_id,
            server_name,
            principal,
            fingerprint,
            outbound: tx,
            active: AtomicBool::new(true),
            legacy_mode: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            created_at: now,
            expires_at: now + transport_config::CLIENT_SESSION_TTL,
        });

        tracing::info!(
            session_id = %session.id,
            project_id = %project_id,
            client = session.fingerprint.client_type(),
            ip = session.fingerprint.ip_address.as_deref().unwrap_or("-"),
            "client session connected"
        );
        self.audit.record_session_event(project_id, &session.id, SessionEvent::Connected);

        self.sessions.write().await.insert(session.id.clone(), Arc::clone(&session));
        (session, rx)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Tear down one session on client disconnect.
    pub async fn remove(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.remove(session_id) {
            session.mark_inactive();
            tracing::info!(
                session_id,
                total_requests = session.total_requests(),
                failed_requests = session.failed_requests(),
                "client session disconnected"
            );
            self.audit.record_session_event(
                session.project_id,
                session_id,
                SessionEvent::Disconnected,
            );
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop expired or inactive sessions.
    pub async fn cleanup_stale(&self) -> usize {
        let stale: Vec<Arc<ClientSession>> = {
            let sessions = self.sessions.read().await;
            sessions.values().filter(|s| !s.is_active()).cloned().collect()
        };

        if stale.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write().await;
        for session in &stale {
            sessions.remove(&session.id);
            self.audit.record_session_event(
                session.project_id,
                &session.id,
                SessionEvent::Expired,
            );
        }
        stale.len()
    }

    /// Start the background cleanup sweep.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(transport_config::CLIENT_CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let cleaned = manager.cleanup_stale().await;
                if cleaned > 0 {
                    tracing::debug!(count = cleaned, "client session cleanup complete");
                }
            }
        });
        *self.cleanup.lock().expect("cleanup lock") = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.cleanup.lock().expect("cleanup lock").take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ClientSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSessionManager").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingSink;
    use serde_json::json;

    fn manager() -> ClientSessionManager {
        ClientSessionManager::new(Arc::new(TracingSink))
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let manager = manager();
        let (session, _rx) = manager
            .create(Uuid::new_v4(), None, None, ClientFingerprint::default())
            .await;

        assert!(manager.get(&session.id).await.is_some());
        assert!(manager.get("missing").await.is_none());
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_enqueue_reaches_receiver() {
        let manager = manager();
        let (session, mut rx) = manager
            .create(Uuid::new_v4(), None, None, ClientFingerprint::default())
            .await;

        session.enqueue(JsonRpcResponse::success(Some(json!(1)), json!({"ok": true}))).await;
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_error_responses_count_failures() {
        let manager = manager();
        let (session, _rx) = manager
            .create(Uuid::new_v4(), None, None, ClientFingerprint::default())
            .await;

        session.enqueue(JsonRpcResponse::error(Some(json!(1)), -32603, "boom")).await;
        assert_eq!(session.failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_marks_inactive() {
        let manager = manager();
        let (session, rx) = manager
            .create(Uuid::new_v4(), None, None, ClientFingerprint::default())
            .await;
        drop(rx);

        session.enqueue(JsonRpcResponse::success(Some(json!(1)), json!({}))).await;
        assert!(!session.is_active());

        assert_eq!(manager.cleanup_stale().await, 1);
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_marks_disconnected() {
        let manager = manager();
        let (session, _rx) = manager
            .create(Uuid::new_v4(), None, None, ClientFingerprint::default())
            .await;

        manager.remove(&session.id).await;
        assert!(manager.get(&session.id).await.is_none());
        assert!(!session.is_active());
    }

    #[test]
    fn test_client_type_detection() {
        let fingerprint = ClientFingerprint {
            user_agent: Some("Cline/3.0 VSCode".into()),
            ip_address: None,
        };
        assert_eq!(fingerprint.client_type(), "cline");

        let unknown = ClientFingerprint::default();
        assert_eq!(unknown.client_type(), "unknown");

        let node =
            ClientFingerprint { user_agent: Some("node".into()), ip_address: None };
        assert_eq!(node.client_type(), "node_client");
    }
}
