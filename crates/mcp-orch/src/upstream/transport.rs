//! Transport seam for upstream sessions.
//!
//! A transport moves JSON-RPC values in both directions: outbound through
//! [`Transport::send_json`], inbound through the `mpsc` receiver handed to
//! the session at construction. Keeping the seam this narrow makes the
//! session unit-testable with channel-backed transports.

use tokio::sync::mpsc;

use crate::error::UpstreamResult;

/// Outbound half of an upstream transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send one JSON-RPC message. Callers serialize sends per session.
    async fn send_json(&self, message: &serde_json::Value) -> UpstreamResult<()>;

    /// Probe liveness without sending traffic.
    fn is_alive(&self) -> bool;

    /// Tear down the transport. Idempotent.
    async fn close(&self);
}

/// Inbound half: decoded messages from the upstream, in arrival order.
pub type Inbound = mpsc::Receiver<serde_json::Value>;

/// Channel-backed transport for tests.
///
/// Messages "sent" to the upstream land on [`ChannelTransport::sent`];
/// pushing onto the paired inbound sender simulates upstream responses.
pub struct ChannelTransport {
    sent: mpsc::UnboundedSender<serde_json::Value>,
    alive: std::sync::atomic::AtomicBool,
}

impl ChannelTransport {
    /// Build a transport plus the handles a test drives it with.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<serde_json::Value>, mpsc::Sender<serde_json::Value>, Inbound)
    {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) =
            mpsc::channel(crate::config::session::INBOUND_CHANNEL_CAPACITY);
        let transport =
            Self { sent: sent_tx, alive: std::sync::atomic::AtomicBool::new(true) };
        (transport, sent_rx, inbound_tx, inbound_rx)
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send_json(&self, message: &serde_json::Value) -> UpstreamResult<()> {
        self.sent
            .send(message.clone())
            .map_err(|_| crate::error::UpstreamError::Transport("test channel closed".into()))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}
