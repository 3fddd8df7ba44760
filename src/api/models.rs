//! API request models for the three client protocols.
//!
//! Each protocol's body is deserialized into its own request type and then
//! normalized into a [`GenerationRequest`] for the backend.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::core::error::{AppError, Result};
use crate::services::backend::{ChatMessage, GenerationRequest};
use crate::transformer::RequestType;

/// Message content: a plain string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of all text-bearing parts.
    pub fn flatten(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One content part (`text`, `input_text`, `output_text`, ...).
///
/// Non-text parts are accepted and ignored.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"role": "user", "content": "Hello!"}))]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// OpenAI chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "model": "gpt-4o",
    "messages": [
        {"role": "system", "content": "You are a helpful assistant."},
        {"role": "user", "content": "Hello!"}
    ],
    "stream": true
}))]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// OpenAI function tools, passed through unchanged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub tools: Vec<Value>,
}

impl ChatCompletionRequest {
    pub fn into_generation(self) -> Result<GenerationRequest> {
        let model = require_model(self.model)?;
        let mut system = Vec::new();
        let mut messages = Vec::with_capacity(self.messages.len());
        for message in self.messages {
            if message.role == "system" || message.role == "developer" {
                system.push(message.content.flatten());
            } else {
                messages.push(ChatMessage::new(message.role, message.content.flatten()));
            }
        }
        Ok(GenerationRequest {
            request_type: RequestType::ChatCompletions,
            model,
            messages,
            system: join_system(system),
            stream: self.stream,
            max_tokens: self.max_completion_tokens.or(self.max_tokens),
            temperature: self.temperature,
            tools: self.tools,
        })
    }
}

/// One item of a responses `input` array.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InputItem {
    #[serde(default = "default_user_role")]
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

fn default_user_role() -> String {
    "user".to_string()
}

/// Responses `input`: a bare prompt or a list of message items.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Items(Vec<InputItem>),
}

/// OpenAI responses request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "model": "gpt-4o",
    "instructions": "Be brief.",
    "input": "Hello!",
    "stream": true
}))]
pub struct ResponsesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<ResponsesInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Flat responses-style function tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub tools: Vec<Value>,
}

impl ResponsesRequest {
    pub fn into_generation(self) -> Result<GenerationRequest> {
        let model = require_model(self.model)?;
        let mut system: Vec<String> = self.instructions.into_iter().collect();
        let mut messages = Vec::new();
        match self.input {
            Some(ResponsesInput::Text(text)) => messages.push(ChatMessage::new("user", text)),
            Some(ResponsesInput::Items(items)) => {
                for item in items {
                    if item.role == "system" || item.role == "developer" {
                        system.push(item.content.flatten());
                    } else {
                        messages.push(ChatMessage::new(item.role, item.content.flatten()));
                    }
                }
            }
            None => {}
        }
        if messages.is_empty() {
            return Err(AppError::BadRequest("input must not be empty".to_string()));
        }
        Ok(GenerationRequest {
            request_type: RequestType::Responses,
            model,
            messages,
            system: join_system(system),
            stream: self.stream,
            max_tokens: self.max_output_tokens,
            temperature: self.temperature,
            tools: self.tools.into_iter().map(responses_tool_to_openai).collect(),
        })
    }
}

/// Anthropic `system`: a string or a list of text blocks.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentPart>),
}

/// Anthropic messages request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "model": "claude-sonnet-4",
    "max_tokens": 1024,
    "system": "Be brief.",
    "messages": [{"role": "user", "content": "Hello!"}],
    "stream": true
}))]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Anthropic tools (`name`, `description`, `input_schema`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub tools: Vec<Value>,
}

impl MessagesRequest {
    pub fn into_generation(self) -> Result<GenerationRequest> {
        let model = require_model(self.model)?;
        if self.messages.is_empty() {
            return Err(AppError::BadRequest("messages must not be empty".to_string()));
        }
        let system = match self.system {
            Some(SystemPrompt::Text(text)) => Some(text),
            Some(SystemPrompt::Blocks(blocks)) => {
                join_system(blocks.into_iter().filter_map(|b| b.text).collect())
            }
            None => None,
        };
        Ok(GenerationRequest {
            request_type: RequestType::Messages,
            model,
            messages: self
                .messages
                .into_iter()
                .map(|m| ChatMessage::new(m.role, m.content.flatten()))
                .collect(),
            system,
            stream: self.stream,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: self.tools.into_iter().map(anthropic_tool_to_openai).collect(),
        })
    }
}

/// Parse a raw request body for the given protocol.
pub fn parse_generation_request(request_type: RequestType, body: &[u8]) -> Result<GenerationRequest> {
    fn decode<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T> {
        serde_json::from_slice(body)
            .map_err(|e| AppError::BadRequest(format!("Invalid request body: {}", e)))
    }
    match request_type {
        RequestType::ChatCompletions => decode::<ChatCompletionRequest>(body)?.into_generation(),
        RequestType::Responses => decode::<ResponsesRequest>(body)?.into_generation(),
        RequestType::Messages => decode::<MessagesRequest>(body)?.into_generation(),
    }
}

fn require_model(model: String) -> Result<String> {
    let model = model.trim().to_string();
    if model.is_empty() {
        Err(AppError::BadRequest("model is required".to_string()))
    } else {
        Ok(model)
    }
}

fn join_system(parts: Vec<String>) -> Option<String> {
    let parts: Vec<String> = parts.into_iter().filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// `{"type":"function","name":..}` to `{"type":"function","function":{..}}`.
fn responses_tool_to_openai(tool: Value) -> Value {
    if tool.get("function").is_some() || tool.get("name").is_none() {
        return tool;
    }
    json!({
        "type": "function",
        "function": {
            "name": tool["name"],
            "description": tool.get("description").cloned().unwrap_or(Value::Null),
            "parameters": tool.get("parameters").cloned().unwrap_or_else(|| json!({"type": "object"})),
        }
    })
}

fn anthropic_tool_to_openai(tool: Value) -> Value {
    if tool.get("name").is_none() {
        return tool;
    }
    json!({
        "type": "function",
        "function": {
            "name": tool["name"],
            "description": tool.get("description").cloned().unwrap_or(Value::Null),
            "parameters": tool.get("input_schema").cloned().unwrap_or_else(|| json!({"type": "object"})),
        }
    })
}
