//! SSE frame encoding.

use bytes::Bytes;
use serde::Serialize;

/// Literal payload of the OpenAI end-of-stream sentinel.
pub const DONE_PAYLOAD: &str = "[DONE]";

/// One Server-Sent-Event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` line; only Anthropic-style frames carry one
    pub event: Option<String>,
    /// `data:` line payload, a single line of JSON or the done sentinel
    pub data: String,
}

impl SseFrame {
    /// Data-only frame (OpenAI-style framing).
    pub fn data(value: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: None,
            data: serde_json::to_string(value)?,
        })
    }

    /// Frame with both `event:` and `data:` lines (Anthropic-style framing).
    pub fn typed(event: impl Into<String>, value: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: Some(event.into()),
            data: serde_json::to_string(value)?,
        })
    }

    pub fn done() -> Self {
        Self {
            event: None,
            data: DONE_PAYLOAD.to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.event.is_none() && self.data == DONE_PAYLOAD
    }

    /// Frame type label: the `event:` name, or the JSON `type` field for data-only frames.
    pub fn label(&self) -> Option<String> {
        if let Some(event) = &self.event {
            return Some(event.clone());
        }
        serde_json::from_str::<serde_json::Value>(&self.data)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
    }

    /// Wire bytes: `[event: <type>\n]data: <payload>\n\n`.
    pub fn encode(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        out.push_str("data: ");
        out.push_str(&self.data);
        out.push_str("\n\n");
        Bytes::from(out)
    }
}

/// Parse a wire byte stream back into frames. Used by tests and the upstream
/// backend; tolerant of `\r\n` line endings and comment lines.
pub fn parse_frames(raw: &str) -> Vec<SseFrame> {
    let normalized = raw.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data: Vec<&str> = Vec::new();
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }
            if data.is_empty() {
                None
            } else {
                Some(SseFrame {
                    event,
                    data: data.join("\n"),
                })
            }
        })
        .collect()
}
