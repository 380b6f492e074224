//! Per-upstream health tracking and circuit breaking.
//!
//! Every (project, server) pair gets a rolling in-memory record. Three
//! consecutive hard failures open the circuit; an open circuit makes
//! `tools/list` skip the upstream and `tools/call` fail fast. After a
//! cool-down the circuit goes half-open and lets one probe through.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::circuit;

/// Circuit state for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Rolling health record for one upstream.
#[derive(Debug, Clone)]
pub struct UpstreamHealth {
    pub consecutive_failures: u32,
    pub last_success_at: Option<Instant>,
    pub last_error: Option<String>,
    pub circuit: CircuitState,
    /// When the circuit opened; drives the cool-down.
    opened_at: Option<Instant>,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            last_success_at: None,
            last_error: None,
            circuit: CircuitState::Closed,
            opened_at: None,
        }
    }
}

/// Key: (project-id, server-name).
pub type HealthKey = (Uuid, String);

/// Registry of upstream health records. Records are created on first
/// request and never destroyed during the process lifetime.
pub struct HealthRegistry {
    records: Mutex<HashMap<HealthKey, UpstreamHealth>>,
    failure_threshold: u32,
    cool_down: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(circuit::FAILURE_THRESHOLD, circuit::COOL_DOWN)
    }
}

impl HealthRegistry {
    #[must_use]
    pub fn new(failure_threshold: u32, cool_down: Duration) -> Self {
        Self { records: Mutex::new(HashMap::new()), failure_threshold, cool_down }
    }

    /// Whether a call to this upstream may proceed.
    ///
    /// An open circuit whose cool-down has elapsed transitions to half-open
    /// and admits exactly this call as the probe.
    pub fn check_available(&self, project_id: Uuid, server_name: &str) -> bool {
        let mut records = self.records.lock().expect("health lock");
        let record = records.entry((project_id, server_name.to_string())).or_default();

        match record.circuit {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = record.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cool_down {
                    tracing::info!(server = server_name, "circuit half-open, admitting probe");
                    record.circuit = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful interaction; closes the circuit.
    pub fn record_success(&self, project_id: Uuid, server_name: &str) {
        let mut records = self.records.lock().expect("health lock");
        let record = records.entry((project_id, server_name.to_string())).or_default();

        if record.circuit != CircuitState::Closed {
            tracing::info!(server = server_name, "circuit closed after success");
        }
        record.consecutive_failures = 0;
        record.last_success_at = Some(Instant::now());
        record.circuit = CircuitState::Closed;
        record.opened_at = None;
    }

    /// Record a hard failure (spawn/connect/transport/timeout).
    ///
    /// A failing half-open probe re-opens immediately; otherwise the
    /// circuit opens once the threshold is reached.
    pub fn record_failure(&self, project_id: Uuid, server_name: &str, error: &str) {
        let mut records = self.records.lock().expect("health lock");
        let record = records.entry((project_id, server_name.to_string())).or_default();

        record.consecutive_failures += 1;
        record.last_error = Some(error.to_string());

        let should_open = record.circuit == CircuitState::HalfOpen
            || record.consecutive_failures >= self.failure_threshold;
        if should_open && record.circuit != CircuitState::Open {
            tracing::warn!(
                server = server_name,
                failures = record.consecutive_failures,
                error,
                "circuit opened"
            );
            record.circuit = CircuitState::Open;
            record.opened_at = Some(Instant::now());
        }
    }

    /// Current snapshot of one upstream's record, if it exists.
    #[must_use]
    pub fn snapshot(&self, project_id: Uuid, server_name: &str) -> Option<UpstreamHealth> {
        self.records
            .lock()
            .expect("health lock")
            .get(&(project_id, server_name.to_string()))
            .cloned()
    }
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("upstreams", &self.records.lock().expect("health lock").len())
            .finish()
    }
}
