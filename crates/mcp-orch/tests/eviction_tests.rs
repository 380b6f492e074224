//! Idle-eviction scenario: sessions unused past the timeout are torn down
//! by the sweep, and the next call transparently spawns a fresh one.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedUpstream, UpstreamBehavior};
use serde_json::json;
use uuid::Uuid;

use mcp_orch::Settings;
use mcp_orch::audit::TracingSink;
use mcp_orch::health::HealthRegistry;
use mcp_orch::protocol::JsonRpcRequest;
use mcp_orch::store::{MemoryStore, ProjectConfig, sse_upstream};
use mcp_orch::unified::{DispatchOptions, UnifiedEndpoint};
use mcp_orch::upstream::SessionManager;

fn short_lived_settings() -> Settings {
    Settings {
        session_timeout: Duration::from_millis(700),
        cleanup_interval: Duration::from_millis(150),
        ..Settings::for_testing()
    }
}

fn request(method: &str, params: serde_json::Value) -> JsonRpcRequest {
    JsonRpcRequest { jsonrpc: "2.0".into(), method: method.into(), params, id: Some(json!(1)) }
}

#[tokio::test]
async fn test_idle_session_evicted_then_recreated_on_demand() {
    let upstream = ScriptedUpstream::start(UpstreamBehavior::default()).await;

    let project_id = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    store.add_project(ProjectConfig::open(project_id, "eviction"));
    let mut def = sse_upstream(project_id, "alpha", upstream.url());
    def.timeout_secs = 2;
    store.add_upstream(def);

    let sessions = Arc::new(SessionManager::new(&short_lived_settings()));
    sessions.start_cleanup_task();

    let endpoint = UnifiedEndpoint::new(
        project_id,
        Arc::clone(&store) as Arc<dyn mcp_orch::store::ConfigStore>,
        Arc::clone(&sessions),
        Arc::new(HealthRegistry::default()),
        Arc::new(TracingSink),
    );

    // First call spawns a pooled session and initializes the upstream.
    let response = endpoint
        .handle(
            &request("tools/call", json!({"name": "alpha.foo", "arguments": {}})),
            &DispatchOptions::default(),
        )
        .await
        .unwrap();
    assert!(response.error.is_none());
    assert_eq!(sessions.session_count().await, 1);
    assert_eq!(upstream.initialize_count(), 1);

    // Unused past the timeout: the sweep terminates it.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(sessions.session_count().await, 0);

    // The next call spawns a fresh session (a second initialization).
    let response = endpoint
        .handle(
            &request("tools/call", json!({"name": "alpha.foo", "arguments": {}})),
            &DispatchOptions::default(),
        )
        .await
        .unwrap();
    assert!(response.error.is_none());
    assert_eq!(sessions.session_count().await, 1);
    assert_eq!(upstream.initialize_count(), 2);

    sessions.shutdown().await;
}

#[tokio::test]
async fn test_active_session_survives_sweeps() {
    let upstream = ScriptedUpstream::start(UpstreamBehavior::default()).await;

    let project_id = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    store.add_project(ProjectConfig::open(project_id, "eviction"));
    let mut def = sse_upstream(project_id, "alpha", upstream.url());
    def.timeout_secs = 2;
    store.add_upstream(def);

    let sessions = Arc::new(SessionManager::new(&short_lived_settings()));
    sessions.start_cleanup_task();

    let endpoint = UnifiedEndpoint::new(
        project_id,
        Arc::clone(&store) as Arc<dyn mcp_orch::store::ConfigStore>,
        Arc::clone(&sessions),
        Arc::new(HealthRegistry::default()),
        Arc::new(TracingSink),
    );

    let call = request("tools/call", json!({"name": "alpha.foo", "arguments": {}}));
    endpoint.handle(&call, &DispatchOptions::default()).await.unwrap();

    // Keep the session busy across several sweep periods.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        endpoint.handle(&call, &DispatchOptions::default()).await.unwrap();
    }

    // Still the original pooled session: initialized exactly once.
    assert_eq!(sessions.session_count().await, 1);
    assert_eq!(upstream.initialize_count(), 1);

    sessions.shutdown().await;
}
