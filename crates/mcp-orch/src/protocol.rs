//! JSON-RPC 2.0 message types and newline-delimited framing.
//!
//! Every MCP conversation in this proxy (stdio children, remote SSE peers,
//! downstream clients) speaks JSON-RPC 2.0. Stdio transports frame one
//! JSON object per `\n`-terminated line; SSE transports carry the same
//! objects as event payloads. The [`FrameDecoder`] accepts arbitrary byte
//! chunks and never mis-decodes a multi-byte code point split at a chunk
//! boundary.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// JSON-RPC error codes used on the wire.
pub mod codes {
    /// Malformed JSON received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method or tool not found.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid request parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Upstream execution failed.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Generic failure.
    pub const SERVER_ERROR: i32 = -32000;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// A request without an `id` is a notification and gets no response.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcResponse {
    /// JSON-RPC version constant.
    const VERSION: &'static str = "2.0";

    #[must_use]
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error(id: Option<serde_json::Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
            id,
        }
    }
}

/// Serialize a JSON-RPC message as one newline-terminated frame.
///
/// Senders hold a per-session write lock, so a frame is never interleaved
/// with another task's bytes.
#[must_use]
pub fn encode_message(message: &serde_json::Value) -> Vec<u8> {
    let mut frame = serde_json::to_vec(message).unwrap_or_else(|_| b"null".to_vec());
    frame.push(b'\n');
    frame
}

/// Incremental decoder for newline-delimited JSON-RPC over a byte stream.
///
/// Accepts arbitrary chunks. An incomplete multi-byte UTF-8 sequence at the
/// end of a chunk is buffered until the following chunk completes it; an
/// incomplete line is buffered until its terminating `\n` arrives. Malformed
/// lines are skipped with a warning and do not corrupt stream state.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Bytes of a trailing, not-yet-decodable UTF-8 sequence.
    bytes: Vec<u8>,
    /// Decoded text of the trailing, not-yet-terminated line.
    text: String,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every complete message it unlocks.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<serde_json::Value> {
        self.bytes.extend_from_slice(chunk);
        self.decode_buffered_bytes();
        self.drain_complete_lines()
    }

    /// Move as many buffered bytes as possible into the text buffer.
    fn decode_buffered_bytes(&mut self) {
        loop {
            match std::str::from_utf8(&self.bytes) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.bytes.clear();
                    return;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    // Safe: valid_up_to marks a UTF-8 boundary.
                    self.text
                        .push_str(std::str::from_utf8(&self.bytes[..valid_up_to]).unwrap_or(""));

                    match err.error_len() {
                        // Incomplete sequence at the end of the chunk: keep
                        // the tail until the next chunk completes it.
                        None => {
                            self.bytes.drain(..valid_up_to);
                            return;
                        }
                        // Truly invalid bytes mid-stream: skip them so one
                        // bad frame cannot wedge the decoder.
                        Some(invalid_len) => {
                            tracing::warn!(
                                invalid_len,
                                "skipping invalid UTF-8 bytes in message stream"
                            );
                            self.bytes.drain(..valid_up_to + invalid_len);
                        }
                    }
                }
            }
        }
    }

    /// Split the text buffer on `\n`, parsing each complete line.
    fn drain_complete_lines(&mut self) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();

        while let Some(newline) = self.text.find('\n') {
            let line: String = self.text.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str(line) {
                Ok(value) => messages.push(value),
                Err(err) => {
                    let preview: String = line.chars().take(200).collect();
                    tracing::warn!(error = %err, preview = %preview,
                        "skipping malformed JSON-RPC line");
                }
            }
        }

        messages
    }

    /// Number of bytes held back waiting for more input.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.bytes.len() + self.text.len()
    }

    /// Drop all buffered state.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.text.clear();
    }
}
