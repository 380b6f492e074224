//! Configuration for the orchestrating proxy.

use std::time::Duration;

/// Protocol-level constants.
pub mod protocol {
    /// MCP protocol version the proxy speaks to upstream servers.
    pub const UPSTREAM_PROTOCOL_VERSION: &str = "2024-11-05";

    /// MCP protocol version advertised to downstream clients by the unified
    /// endpoint.
    pub const UNIFIED_PROTOCOL_VERSION: &str = "2025-03-26";

    /// Client name sent in the upstream `initialize` handshake.
    pub const CLIENT_NAME: &str = "mcp-orch";

    /// Server name advertised by the unified endpoint.
    pub const UNIFIED_SERVER_NAME: &str = "mcp-orch-unified";

    /// Separator between namespace and tool name. Must not appear in
    /// registered server names.
    pub const NAMESPACE_SEPARATOR: char = '.';
}

/// Timing and sizing constants for upstream sessions.
pub mod session {
    use std::time::Duration;

    /// How long to wait for the SSE `endpoint` bootstrap event.
    pub const ENDPOINT_WAIT: Duration = Duration::from_secs(5);

    /// Timeout for the upstream `initialize` response. Generous because
    /// heavy servers (package-manager launched) are slow to come up.
    pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Pause after `notifications/initialized` before allowing traffic.
    pub const STABILIZATION_DELAY: Duration = Duration::from_millis(500);

    /// Initialization retry attempts.
    pub const INIT_MAX_RETRIES: u32 = 3;

    /// Base delay for the exponential initialization backoff (1s, 2s, 4s).
    pub const INIT_BACKOFF_BASE: Duration = Duration::from_secs(1);

    /// Attempts for one proxied tool call before the failure is surfaced.
    pub const CALL_MAX_ATTEMPTS: u32 = 3;

    /// Default per-request timeout when the upstream definition has none.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    /// Grace period for a stdio child to exit after stdin closes.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    /// Bound on the out-of-order message holding queue.
    pub const OUT_OF_ORDER_LIMIT: usize = 64;

    /// Capacity of the transport inbound channel.
    pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

    /// Read chunk size for stdio stdout.
    pub const READ_CHUNK_SIZE: usize = 8192;
}

/// Circuit-breaker tuning for upstream health tracking.
pub mod circuit {
    use std::time::Duration;

    /// Consecutive hard failures before the circuit opens.
    pub const FAILURE_THRESHOLD: u32 = 3;

    /// Cool-down before an open circuit becomes half-open.
    pub const COOL_DOWN: Duration = Duration::from_secs(30);
}

/// Client-facing transport tuning.
pub mod transport {
    use std::time::Duration;

    /// Bound on each client session's outbound SSE queue.
    pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

    /// Delay before dispatching the first queued response; improves interop
    /// with clients that need the SSE stream fully established.
    pub const STREAM_STABILIZATION: Duration = Duration::from_millis(100);

    /// SSE keep-alive ping interval.
    pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

    /// Client session lifetime.
    pub const CLIENT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Sweep period for expired client sessions.
    pub const CLIENT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
}

/// Runtime settings, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Idle lifetime of an upstream session before eviction.
    pub session_timeout: Duration,

    /// Period of the idle-eviction sweep.
    pub cleanup_interval: Duration,

    /// HMAC key for JWT verification.
    pub auth_secret: Option<String>,

    /// When true, every request passes through as anonymous.
    pub disable_auth: bool,

    /// Accept `alg=none` JWTs (development only).
    pub dev_unsafe_jwt: bool,

    /// Base URL advertised in the client-config export.
    pub server_base_url: String,

    /// Expose the test-only `echo` tool on per-server endpoints.
    pub enable_test_tools: bool,
}

impl Settings {
    /// Default idle session lifetime in minutes.
    pub const DEFAULT_SESSION_TIMEOUT_MINUTES: u64 = 30;

    /// Default eviction sweep period in minutes.
    pub const DEFAULT_CLEANUP_INTERVAL_MINUTES: u64 = 5;

    /// Create settings from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let session_timeout_minutes = env_u64(
            "MCP_SESSION_TIMEOUT_MINUTES",
            Self::DEFAULT_SESSION_TIMEOUT_MINUTES,
        );
        let cleanup_interval_minutes = env_u64(
            "MCP_SESSION_CLEANUP_INTERVAL_MINUTES",
            Self::DEFAULT_CLEANUP_INTERVAL_MINUTES,
        );

        Self {
            session_timeout: Duration::from_secs(session_timeout_minutes * 60),
            cleanup_interval: Duration::from_secs(cleanup_interval_minutes * 60),
            auth_secret: std::env::var("AUTH_SECRET").ok(),
            disable_auth: env_flag("DISABLE_AUTH"),
            dev_unsafe_jwt: false,
            server_base_url: std::env::var("MCP_SERVER_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            enable_test_tools: false,
        }
    }

    /// Create settings for tests: short timeouts, auth disabled.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            session_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(1),
            auth_secret: None,
            disable_auth: true,
            dev_unsafe_jwt: false,
            server_base_url: "http://localhost:8000".to_string(),
            enable_test_tools: true,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(Self::DEFAULT_SESSION_TIMEOUT_MINUTES * 60),
            cleanup_interval: Duration::from_secs(Self::DEFAULT_CLEANUP_INTERVAL_MINUTES * 60),
            auth_secret: None,
            disable_auth: false,
            dev_unsafe_jwt: false,
            server_base_url: "http://localhost:8000".to_string(),
            enable_test_tools: false,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}
