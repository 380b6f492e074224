//! Error types for the orchestrating proxy.
//!
//! Uses `thiserror` for structured error handling. The taxonomy separates
//! session-fatal failures (which evict the session from the registry) from
//! per-request failures (which become JSON-RPC error payloads for the
//! client) and initialization failures (which are retried inside the
//! session).

use std::time::Duration;

use crate::protocol::codes;

/// Errors from an upstream MCP session or its transport.
#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    /// Failed to spawn the stdio child process.
    #[error("failed to spawn upstream process `{command}`: {source}")]
    Spawn {
        /// The configured command.
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to open the SSE connection to a remote upstream.
    #[error("failed to connect to upstream at {url}: {message}")]
    Connect {
        /// Configured SSE URL.
        url: String,
        /// Connection failure detail.
        message: String,
    },

    /// The remote SSE upstream never announced its message endpoint.
    #[error("upstream did not announce a message endpoint within {0:?}")]
    EndpointMissing(Duration),

    /// The upstream rejected traffic because it considers itself
    /// uninitialized. Retried internally by the session.
    #[error("upstream initialization incomplete: {0}")]
    InitializationIncomplete(String),

    /// No matching response arrived before the deadline. Local to one
    /// request; the request id is retired.
    #[error("request `{method}` timed out after {timeout:?}")]
    RequestTimeout {
        /// JSON-RPC method that timed out.
        method: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The session was closed while requests were pending.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// JSON-RPC `error` object returned by the upstream. Local to one
    /// request, surfaced to the caller.
    #[error("upstream protocol error {code}: {message}")]
    Protocol {
        /// JSON-RPC error code from the upstream.
        code: i32,
        /// Error message from the upstream.
        message: String,
    },

    /// Transport-level failure (broken pipe, closed stream). Terminal for
    /// the session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The out-of-order holding queue overflowed.
    #[error("out-of-order message queue overflowed (limit {0})")]
    QueueOverflow(usize),

    /// The upstream's circuit is open; the call fails fast.
    #[error("upstream `{0}` is unavailable (circuit open)")]
    Unavailable(String),

    /// Upstream definition problem (missing, disabled, invalid).
    #[error("configuration error: {0}")]
    Config(String),
}

impl UpstreamError {
    /// Create a connect error.
    #[must_use]
    pub fn connect(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect { url: url.into(), message: message.into() }
    }

    /// Create a protocol error from an upstream JSON-RPC error object.
    #[must_use]
    pub fn protocol(code: i32, message: impl Into<String>) -> Self {
        Self::Protocol { code, message: message.into() }
    }

    /// True when the session that produced this error must be torn down and
    /// recreated on the next call.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. }
                | Self::Connect { .. }
                | Self::EndpointMissing(_)
                | Self::SessionClosed(_)
                | Self::Transport(_)
        )
    }

    /// True when the failure matches "not initialized" semantics and the
    /// initialization sequence may be retried.
    #[must_use]
    pub fn is_initialization_error(&self) -> bool {
        match self {
            Self::InitializationIncomplete(_) => true,
            Self::Protocol { message, .. } => classify_initialization_message(message),
            _ => false,
        }
    }

    /// JSON-RPC error code to surface downstream for this failure.
    #[must_use]
    pub const fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::Config(_) => codes::METHOD_NOT_FOUND,
            Self::Spawn { .. }
            | Self::Connect { .. }
            | Self::EndpointMissing(_)
            | Self::InitializationIncomplete(_)
            | Self::RequestTimeout { .. }
            | Self::SessionClosed(_)
            | Self::Transport(_)
            | Self::QueueOverflow(_)
            | Self::Unavailable(_) => codes::INTERNAL_ERROR,
        }
    }
}

/// Heuristic match for upstream error text that means "initialize first".
#[must_use]
pub fn classify_initialization_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["before initialization", "not initialized", "initialization incomplete", "initialization was complete"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Retryable failure classes for proxied tool calls. Each class carries its
/// own backoff schedule; anything unclassified is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Upstream still initializing. Longest waits; a repeat also triggers
    /// session recreation.
    Initialization,
    /// Parameter complaints that some servers emit transiently right after
    /// startup.
    Parameters,
    /// Request deadline elapsed.
    Timeout,
    /// Transport or connection failure.
    Connection,
}

impl RetryClass {
    /// Wait before retry `attempt` (1-based count of failures so far).
    #[must_use]
    pub fn delay(self, attempt: u32) -> Duration {
        let schedule_ms: &[u64] = match self {
            Self::Initialization => &[2000, 4000, 8000],
            Self::Parameters => &[500, 1000, 2000],
            Self::Timeout => &[1000, 3000, 5000],
            Self::Connection => &[1000, 2000, 4000],
        };
        let index = (attempt.saturating_sub(1) as usize).min(schedule_ms.len() - 1);
        Duration::from_millis(schedule_ms[index])
    }
}

impl UpstreamError {
    /// Classify a failure for the tool-call retry loop. `None` means the
    /// error is not retryable and propagates immediately.
    #[must_use]
    pub fn retry_class(&self) -> Option<RetryClass> {
        match self {
            Self::InitializationIncomplete(_) => Some(RetryClass::Initialization),
            Self::RequestTimeout { .. } => Some(RetryClass::Timeout),
            Self::Spawn { .. }
            | Self::Connect { .. }
            | Self::EndpointMissing(_)
            | Self::SessionClosed(_)
            | Self::Transport(_) => Some(RetryClass::Connection),
            Self::Protocol { message, .. } => {
                if classify_initialization_message(message) {
                    Some(RetryClass::Initialization)
                } else if classify_parameter_message(message) {
                    Some(RetryClass::Parameters)
                } else {
                    None
                }
            }
            Self::QueueOverflow(_) | Self::Unavailable(_) | Self::Config(_) => None,
        }
    }
}

/// Heuristic match for transient parameter complaints.
#[must_use]
pub fn classify_parameter_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["invalid request parameters", "invalid parameters", "parameter error"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Errors from the access controller.
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    /// No credentials were presented but the policy requires them.
    #[error("authentication required")]
    MissingCredentials,

    /// The presented token did not resolve to a principal.
    #[error("invalid token")]
    InvalidToken,

    /// The presented token is expired.
    #[error("token expired")]
    Expired,
}

/// Result type alias for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;
