//! Protocol-neutral representation of backend output.
//!
//! The backend engine produces [`InternalEvent`]s (streaming) or a single
//! [`GenerationResponse`] (non-streaming). Transcoders turn these into the
//! wire format of whichever client protocol issued the request.

use serde::{Deserialize, Serialize};

// ============================================================================
// Request Types
// ============================================================================

/// Client-facing protocol of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// OpenAI `/v1/chat/completions`
    #[default]
    ChatCompletions,
    /// OpenAI `/v1/responses`
    Responses,
    /// Anthropic `/v1/messages`
    Messages,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::ChatCompletions => "chat_completions",
            RequestType::Responses => "responses",
            RequestType::Messages => "messages",
        }
    }

    /// Whether the protocol terminates streams with `data: [DONE]`.
    pub fn uses_done_sentinel(&self) -> bool {
        !matches!(self, RequestType::Messages)
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat_completions" | "chat" | "openai" => Ok(RequestType::ChatCompletions),
            "responses" | "response_api" => Ok(RequestType::Responses),
            "messages" | "anthropic" | "claude" => Ok(RequestType::Messages),
            _ => Err(format!("Unknown request type: {}", s)),
        }
    }
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Why generation stopped. Serialized verbatim in chat-style frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    #[serde(untagged)]
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(reason) => reason,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Error payload carried by an [`InternalEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendError {
    pub message: String,
    #[serde(default = "default_error_type")]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
}

fn default_error_type() -> String {
    "api_error".to_string()
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: default_error_type(),
            code: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Incremental tool-call data for one tool call slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Slot index within the choice; stable across deltas of the same call
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Delta for a single choice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceDelta {
    pub index: u32,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

impl ChoiceDelta {
    pub fn text(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn finish(index: u32, reason: FinishReason) -> Self {
        Self {
            index,
            finish_reason: Some(reason),
            ..Default::default()
        }
    }

    /// True when the delta carries neither output nor a terminal marker.
    pub fn is_empty(&self) -> bool {
        !self.has_output() && self.finish_reason.is_none()
    }

    /// Carries text, reasoning or tool-call data.
    pub fn has_output(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.is_empty())
            || self.reasoning.as_deref().is_some_and(|r| !r.is_empty())
            || !self.tool_calls.is_empty()
    }
}

/// One increment of generation output from the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub choices: Vec<ChoiceDelta>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub error: Option<BackendError>,
}

impl InternalEvent {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    /// Event carrying only a text delta for choice 0.
    pub fn text(id: impl Into<String>, model: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, model).with_choice(ChoiceDelta::text(0, text))
    }

    /// Event carrying only a finish reason for choice 0.
    pub fn finish(id: impl Into<String>, model: impl Into<String>, reason: FinishReason) -> Self {
        Self::new(id, model).with_choice(ChoiceDelta::finish(0, reason))
    }

    /// Error event; carries no content.
    pub fn error(error: BackendError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_choice(mut self, choice: ChoiceDelta) -> Self {
        self.choices.push(choice);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// True when transcoding this event must produce no frames.
    pub fn is_empty(&self) -> bool {
        self.error.is_none() && self.usage.is_none() && self.choices.iter().all(ChoiceDelta::is_empty)
    }

    /// First finish reason carried by any choice.
    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.choices.iter().find_map(|c| c.finish_reason.as_ref())
    }
}

// ============================================================================
// Non-streaming Response
// ============================================================================

/// A complete tool call in a non-streamed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Single reply from the backend for non-streaming requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub text: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_round_trip_names() {
        assert_eq!("chat".parse::<RequestType>().unwrap(), RequestType::ChatCompletions);
        assert_eq!("anthropic".parse::<RequestType>().unwrap(), RequestType::Messages);
        assert_eq!(RequestType::Responses.to_string(), "responses");
        assert!("gemini".parse::<RequestType>().is_err());
    }

    #[test]
    fn test_done_sentinel_usage() {
        assert!(RequestType::ChatCompletions.uses_done_sentinel());
        assert!(RequestType::Responses.uses_done_sentinel());
        assert!(!RequestType::Messages.uses_done_sentinel());
    }

    #[test]
    fn test_empty_event_detection() {
        let empty = InternalEvent::new("id", "m").with_choice(ChoiceDelta {
            content: Some(String::new()),
            ..Default::default()
        });
        assert!(empty.is_empty());
        assert!(!InternalEvent::text("id", "m", "hi").is_empty());
        assert!(!InternalEvent::finish("id", "m", FinishReason::Stop).is_empty());
        assert!(!InternalEvent::error(BackendError::new("x")).is_empty());
    }

    #[test]
    fn test_finish_reason_verbatim() {
        assert_eq!(FinishReason::parse("length").as_str(), "length");
        assert_eq!(FinishReason::parse("eos_token").as_str(), "eos_token");
        let json = serde_json::to_value(FinishReason::Other("eos_token".into())).unwrap();
        assert_eq!(json, serde_json::json!("eos_token"));
        let json = serde_json::to_value(FinishReason::ToolCalls).unwrap();
        assert_eq!(json, serde_json::json!("tool_calls"));
    }
}
