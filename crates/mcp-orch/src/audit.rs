//! Activity-log sink.
//!
//! Tool calls and client session events are reported through the narrow
//! [`ActivitySink`] trait; a persistent sink lives outside the core. The
//! default [`TracingSink`] emits structured tracing events so activity is
//! visible without any external collector.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Outcome of a proxied tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Failed,
    Timeout,
}

impl CallStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

/// One proxied tool call, as reported to the sink.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub project_id: Uuid,
    pub server_name: String,
    pub tool_name: String,
    /// `server.tool` form used for reporting.
    pub tool_namespace: String,
    pub status: CallStatus,
    pub duration: Duration,
    pub error_message: Option<String>,
    pub client_session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Client session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Expired,
}

impl SessionEvent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Expired => "expired",
        }
    }
}

/// Append-only sink for tool-call and session events.
pub trait ActivitySink: Send + Sync {
    fn record_tool_call(&self, record: &ToolCallRecord);

    fn record_session_event(&self, project_id: Uuid, session_id: &str, event: SessionEvent);
}

/// Default sink backed by `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ActivitySink for TracingSink {
    fn record_tool_call(&self, record: &ToolCallRecord) {
        tracing::info!(
            project_id = %record.project_id,
            tool = %record.tool_namespace,
            status = record.status.as_str(),
            duration_ms = record.duration.as_millis() as u64,
            error = record.error_message.as_deref().unwrap_or(""),
            "tool call"
        );
    }

    fn record_session_event(&self, project_id: Uuid, session_id: &str, event: SessionEvent) {
        tracing::info!(
            project_id = %project_id,
            session_id,
            event = event.as_str(),
            "client session"
        );
    }
}

impl ToolCallRecord {
    /// Build a record for a completed call.
    #[must_use]
    pub fn new(
        project_id: Uuid,
        server_name: &str,
        tool_name: &str,
        status: CallStatus,
        duration: Duration,
    ) -> Self {
        Self {
            project_id,
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            tool_namespace: format!("{server_name}.{tool_name}"),
            status,
            duration,
            error_message: None,
            client_session_id: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_client_session(mut self, session_id: impl Into<String>) -> Self {
        self.client_session_id = Some(session_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_namespace() {
        let record = ToolCallRecord::new(
            Uuid::new_v4(),
            "search",
            "web_search",
            CallStatus::Success,
            Duration::from_millis(42),
        );
        assert_eq!(record.tool_namespace, "search.web_search");
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_record_builder() {
        let record = ToolCallRecord::new(
            Uuid::new_v4(),
            "files",
            "read",
            CallStatus::Timeout,
            Duration::from_secs(30),
        )
        .with_error("request timed out")
        .with_client_session("sess-1");

        assert_eq!(record.status.as_str(), "timeout");
        assert_eq!(record.client_session_id.as_deref(), Some("sess-1"));
    }
}
