//! Proxy-chaining test: one proxy's per-server endpoint is itself a valid
//! SSE MCP server, so a second proxy can front it as an upstream. This
//! exercises the SSE client transport against the real SSE server
//! transport end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedUpstream, SseReader, UpstreamBehavior, serve_router};
use serde_json::json;
use uuid::Uuid;

use mcp_orch::store::{MemoryStore, ProjectConfig, sse_upstream};
use mcp_orch::{ProxyServer, Settings};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_proxy_fronting_another_proxy() {
    // Innermost: a scripted MCP server with one tool.
    let origin = ScriptedUpstream::start(UpstreamBehavior {
        tools: vec![("origin_tool", "the real tool")],
        ..UpstreamBehavior::default()
    })
    .await;

    // Inner proxy: fronts the scripted server.
    let inner_project = Uuid::new_v4();
    let inner_store = Arc::new(MemoryStore::new());
    inner_store.add_project(ProjectConfig::open(inner_project, "inner"));
    let mut inner_def = sse_upstream(inner_project, "origin", origin.url());
    inner_def.timeout_secs = 5;
    inner_store.add_upstream(inner_def);

    let inner = ProxyServer::new(Settings::for_testing(), inner_store);
    let (inner_addr, _inner_handle) = serve_router(inner.router()).await;

    // Outer proxy: treats the inner proxy's per-server endpoint as its own
    // SSE upstream.
    let outer_project = Uuid::new_v4();
    let outer_store = Arc::new(MemoryStore::new());
    outer_store.add_project(ProjectConfig::open(outer_project, "outer"));
    let mut outer_def = sse_upstream(
        outer_project,
        "inner",
        format!("http://{inner_addr}/projects/{inner_project}/servers/origin/sse"),
    );
    outer_def.timeout_secs = 8;
    outer_store.add_upstream(outer_def);

    let outer = ProxyServer::new(Settings::for_testing(), outer_store);
    let (outer_addr, _outer_handle) = serve_router(outer.router()).await;

    // Client connects to the outer proxy's unified endpoint.
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{outer_addr}/projects/{outer_project}/unified/sse"))
        .send()
        .await
        .unwrap();
    let mut reader = SseReader::new(response);
    let endpoint = reader.next_event(WAIT).await;
    assert_eq!(endpoint.name, "endpoint");
    let messages_url = format!("http://{outer_addr}{}", endpoint.data);

    // The chained catalog carries the origin tool, namespaced by the outer
    // proxy. (The inner proxy's test-only echo tool rides along.)
    client
        .post(&messages_url)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}}))
        .send()
        .await
        .unwrap();
    let message = reader.next_message(WAIT).await;
    let names: Vec<&str> = message["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"inner.origin_tool"), "got {names:?}");

    // A call through both proxies reaches the origin server with the
    // original tool name.
    client
        .post(&messages_url)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "inner.origin_tool", "arguments": {"hop": 2}}
        }))
        .send()
        .await
        .unwrap();
    let message = reader.next_message(WAIT).await;
    assert_eq!(message["id"], 2);
    assert_eq!(message["result"]["echo"]["name"], "origin_tool");
    assert_eq!(message["result"]["echo"]["arguments"]["hop"], 2);

    let calls = origin.recorded_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["name"], "origin_tool");
}
