//! Stdio upstream tests against real child processes.
//!
//! Request ids are allocated monotonically from 1 per session, so a shell
//! script that answers line-by-line with canned ids behaves like a minimal
//! MCP server: id 1 is `initialize`, the following line is the
//! `notifications/initialized` notification, and so on.
#![cfg(unix)]

mod common;

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use mcp_orch::UpstreamError;
use mcp_orch::store::{UpstreamDef, UpstreamTransport, stdio_upstream};
use mcp_orch::upstream::UpstreamSession;

fn sh_upstream(script: &str) -> UpstreamDef {
    let mut def = stdio_upstream(
        Uuid::new_v4(),
        "sh-upstream",
        "sh",
        vec!["-c".to_string(), script.to_string()],
    );
    def.timeout_secs = 5;
    def
}

const MCP_SCRIPT: &str = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"sh-upstream","version":"0"}}}\n'
read line
read line
printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"shell_tool","description":"from sh","inputSchema":{"type":"object"}}]}}\n'
read line
printf '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"ok"}]}}\n'
cat > /dev/null
"#;

#[tokio::test]
async fn test_full_stdio_handshake_catalog_and_call() {
    let def = sh_upstream(MCP_SCRIPT);
    let session = UpstreamSession::start(&def, false).await.unwrap();

    // Implicit initialization happens on the first request.
    let tools = session.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "shell_tool");
    assert!(session.is_initialized());

    let result = session
        .call_tool("shell_tool", json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "ok");

    session.close().await;
    assert!(!session.is_alive());
}

#[tokio::test]
async fn test_spawn_failure_for_missing_command() {
    let def = stdio_upstream(
        Uuid::new_v4(),
        "ghost",
        "definitely-not-a-real-command-xyz",
        vec![],
    );

    let err = UpstreamSession::start(&def, false).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Spawn { .. }));
    assert!(err.is_session_fatal());
}

#[tokio::test]
async fn test_child_env_overlay_reaches_process() {
    // The canned response embeds the env var the definition overlays.
    let script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"value":"%s"}}\n' "$ORCH_TEST_VALUE"
cat > /dev/null
"#;
    let mut def = sh_upstream(script);
    if let UpstreamTransport::Stdio { env, .. } = &mut def.transport {
        env.insert("ORCH_TEST_VALUE".to_string(), "overlaid".to_string());
    }

    let session = UpstreamSession::start(&def, true).await.unwrap();
    let result = session.request("probe", json!({}), Duration::from_secs(5)).await.unwrap();
    assert_eq!(result["value"], "overlaid");

    session.close().await;
}

#[tokio::test]
async fn test_process_exit_marks_session_dead() {
    // The child answers one request and exits immediately.
    let script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
"#;
    let def = sh_upstream(script);
    let session = UpstreamSession::start(&def, true).await.unwrap();

    session.request("only", json!({}), Duration::from_secs(5)).await.unwrap();

    // Process exit is observed without sending traffic.
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.is_alive() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session should notice the child exited");

    session.close().await;
}

#[tokio::test]
async fn test_close_is_graceful_on_eof() {
    let def = sh_upstream("cat > /dev/null");
    let session = UpstreamSession::start(&def, true).await.unwrap();
    assert!(session.is_alive());

    // Closing stdin lets `cat` exit inside the grace period.
    session.close().await;
    assert!(!session.is_alive());
}
