//! Remote SSE transport.
//!
//! Opens a long-lived `GET` to the upstream's SSE URL, waits for the
//! `endpoint` bootstrap event announcing the companion message URL, then
//! forwards inbound `message` events and sends requests as HTTP `POST`s to
//! the announced endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::transport::{Inbound, Transport};
use crate::config::session;
use crate::error::{UpstreamError, UpstreamResult};
use crate::store::UpstreamDef;

/// Connect timeout for the initial SSE GET.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for each message POST to the announced endpoint.
const POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport over a remote SSE MCP server.
pub struct SseTransport {
    client: reqwest::Client,
    /// Absolute message endpoint announced by the upstream.
    message_url: Url,
    headers: reqwest::header::HeaderMap,
    connected: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the SSE stream and await the `endpoint` announcement.
    pub async fn connect(def: &UpstreamDef) -> UpstreamResult<(Self, Inbound)> {
        let crate::store::UpstreamTransport::Sse { url, headers } = &def.transport else {
            return Err(UpstreamError::Config(format!(
                "upstream `{}` is not an SSE definition",
                def.name
            )));
        };

        let base_url = Url::parse(url)
            .map_err(|err| UpstreamError::connect(url, format!("invalid URL: {err}")))?;
        let header_map = build_headers(headers)?;

        // No global timeout: it would cut the long-lived event stream.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| UpstreamError::connect(url, err.to_string()))?;

        tracing::info!(server = %def.name, url = %url, "connecting to SSE upstream");

        // send() resolves once response headers arrive; bound it so an
        // upstream that accepts TCP but never answers cannot hang start().
        let response = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client
                .get(base_url.clone())
                .headers(header_map.clone())
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|_| UpstreamError::connect(url, format!("no response within {CONNECT_TIMEOUT:?}")))?
        .map_err(|err| UpstreamError::connect(url, err.to_string()))?;

        if !response.status().is_success() {
            return Err(UpstreamError::connect(
                url,
                format!("HTTP {}", response.status()),
            ));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(session::INBOUND_CHANNEL_CAPACITY);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_event_stream(
            response,
            inbound_tx,
            endpoint_tx,
            Arc::clone(&connected),
            def.name.clone(),
        ));

        // The upstream must announce its message endpoint promptly.
        let endpoint =
            match tokio::time::timeout(session::ENDPOINT_WAIT, endpoint_rx).await {
                Ok(Ok(endpoint)) => endpoint,
                _ => {
                    reader.abort();
                    connected.store(false, Ordering::SeqCst);
                    return Err(UpstreamError::EndpointMissing(session::ENDPOINT_WAIT));
                }
            };

        let message_url = match base_url.join(endpoint.trim()) {
            Ok(message_url) => message_url,
            Err(err) => {
                reader.abort();
                connected.store(false, Ordering::SeqCst);
                return Err(UpstreamError::connect(
                    url,
                    format!("invalid endpoint `{endpoint}`: {err}"),
                ));
            }
        };

        tracing::debug!(server = %def.name, endpoint = %message_url, "received message endpoint");

        Ok((
            Self {
                client,
                message_url,
                headers: header_map,
                connected,
                reader: std::sync::Mutex::new(Some(reader)),
            },
            inbound_rx,
        ))
    }
}

fn build_headers(
    headers: &std::collections::HashMap<String, String>,
) -> UpstreamResult<reqwest::header::HeaderMap> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name: reqwest::header::HeaderName = name
            .parse()
            .map_err(|_| UpstreamError::Config(format!("invalid header name `{name}`")))?;
        let value = value
            .parse()
            .map_err(|_| UpstreamError::Config(format!("invalid value for header `{name}`")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Pump the SSE byte stream, routing events to the session.
async fn read_event_stream(
    response: reqwest::Response,
    inbound: mpsc::Sender<serde_json::Value>,
    endpoint_tx: oneshot::Sender<String>,
    connected: Arc<AtomicBool>,
    server: String,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(server = %server, error = %err, "SSE stream error");
                break;
            }
        };

        for event in parser.push(&chunk) {
            match event.name.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data);
                    }
                }
                // Unnamed events default to "message" per the SSE standard.
                "message" | "" => match serde_json::from_str(&event.data) {
                    Ok(value) => {
                        if inbound.send(value).await.is_err() {
                            connected.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(server = %server, error = %err,
                            "skipping unparseable SSE message payload");
                    }
                },
                other => {
                    tracing::debug!(server = %server, event = other, "ignoring SSE event");
                }
            }
        }
    }

    tracing::info!(server = %server, "SSE stream ended");
    connected.store(false, Ordering::SeqCst);
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    async fn send_json(&self, message: &serde_json::Value) -> UpstreamResult<()> {
        let response = self
            .client
            .post(self.message_url.clone())
            .headers(self.headers.clone())
            .timeout(POST_TIMEOUT)
            .json(message)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(format!("message POST failed: {err}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(UpstreamError::Transport(format!(
                "message POST rejected: HTTP {}",
                response.status()
            )))
        }
    }

    fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if let Some(reader) = self.reader.lock().expect("reader lock").take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("message_url", &self.message_url.as_str())
            .field("connected", &self.is_alive())
            .finish()
    }
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
}

/// Incremental SSE parser over arbitrary byte chunks.
///
/// Handles multi-byte UTF-8 split at chunk boundaries the same way the
/// JSON frame decoder does, and joins multi-line `data:` fields with `\n`.
#[derive(Debug, Default)]
pub struct SseParser {
    bytes: Vec<u8>,
    text: String,
    event_name: String,
    data_lines: Vec<String>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.decode_chunk(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.text.find('\n') {
            let line: String = self.text.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line dispatches the accumulated event.
                if !self.data_lines.is_empty() {
                    events.push(SseEvent {
                        name: std::mem::take(&mut self.event_name),
                        data: self.data_lines.join("\n"),
                    });
                    self.data_lines.clear();
                } else {
                    self.event_name.clear();
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event_name = value.trim_start().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            } else if line.starts_with(':') {
                // Comment line (keep-alive ping); ignored.
            }
        }

        events
    }

    fn decode_chunk(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.bytes) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.bytes.clear();
                    return;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    self.text
                        .push_str(std::str::from_utf8(&self.bytes[..valid_up_to]).unwrap_or(""));
                    match err.error_len() {
                        None => {
                            self.bytes.drain(..valid_up_to);
                            return;
                        }
                        Some(invalid_len) => {
                            self.bytes.drain(..valid_up_to + invalid_len);
                        }
                    }
                }
            }
        }
    }
}
