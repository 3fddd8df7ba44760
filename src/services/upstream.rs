//! OpenAI-compatible upstream backend.
//!
//! Sends every [`GenerationRequest`] to `{base_url}/chat/completions` and
//! turns the upstream reply (JSON or SSE) into the internal event model.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::backend::{BackendReply, EventStream, GenerationBackend, GenerationRequest};
use crate::core::cancel::StreamCancelHandle;
use crate::core::config::UpstreamConfig;
use crate::core::error::{AppError, Result};
use crate::transformer::sse::parse_frames;
use crate::transformer::{
    BackendError, ChoiceDelta, FinishReason, GenerationResponse, InternalEvent, ToolCall,
    ToolCallDelta, Usage,
};

const MAX_ERROR_MESSAGE_LEN: usize = 500;

pub struct UpstreamBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    platform: String,
}

impl UpstreamBackend {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            platform: config.platform_name.clone(),
        }
    }

    /// OpenAI chat-completions request body for the upstream.
    pub fn build_payload(request: &GenerationRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for message in &request.messages {
            messages.push(json!({ "role": message.role, "content": message.content }));
        }

        let mut payload = json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if request.stream {
            payload["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            payload["tools"] = Value::Array(request.tools.clone());
        }
        payload
    }

    fn event_stream(response: reqwest::Response) -> EventStream {
        let cancel = StreamCancelHandle::new();
        let watcher = cancel.clone();

        let events = async_stream::stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            // bytes before this offset hold no frame terminator
            let mut scanned = 0;

            'read: loop {
                let chunk = tokio::select! {
                    biased;
                    _ = watcher.cancelled() => {
                        tracing::debug!("Upstream stream cancelled; dropping connection");
                        break 'read;
                    }
                    chunk = bytes.next() => chunk,
                };

                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        yield InternalEvent::error(
                            BackendError::new(format!("Upstream stream error: {}", e))
                                .with_type("upstream_error"),
                        );
                        break 'read;
                    }
                    None => break 'read,
                };
                buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

                while let Some(pos) = find_frame_end(&buffer, scanned) {
                    let block: Vec<u8> = buffer.drain(..pos + 2).collect();
                    scanned = 0;
                    let text = String::from_utf8_lossy(&block);
                    for frame in parse_frames(&text) {
                        if frame.is_done() {
                            break 'read;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                            tracing::warn!("Skipping non-JSON upstream frame: {}", frame.data);
                            continue;
                        };
                        let event = parse_chunk(&value);
                        let is_error = event.error.is_some();
                        yield event;
                        if is_error {
                            break 'read;
                        }
                    }
                }
                // a trailing '\n' may pair with the first byte of the next chunk
                scanned = buffer.len().saturating_sub(1);
            }
        };

        EventStream::new(Box::pin(events), cancel)
    }
}

/// Offset of the first blank-line terminator at or after `from`.
fn find_frame_end(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| pos + from)
}

#[async_trait]
impl GenerationBackend for UpstreamBackend {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn generate(&self, request: GenerationRequest) -> Result<BackendReply> {
        let payload = Self::build_payload(&request);
        let mut builder = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        tracing::debug!(model = %request.model, stream = request.stream, "Sending upstream request");
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let message = extract_error_message(&body).unwrap_or_else(|| truncate(&text));
            tracing::warn!(status = status.as_u16(), "Upstream returned error: {}", message);
            return Err(AppError::Backend(
                BackendError::new(message)
                    .with_type(error_type_of(&body))
                    .with_code(status.as_u16().to_string()),
            ));
        }

        if request.stream {
            return Ok(BackendReply::Stream(Self::event_stream(response)));
        }

        let body: Value = response.json().await?;
        if body.get("error").is_some() {
            let message = extract_error_message(&body).unwrap_or_else(|| body.to_string());
            return Err(AppError::Backend(
                BackendError::new(message).with_type(error_type_of(&body)),
            ));
        }
        Ok(BackendReply::Single(parse_response(&body)))
    }
}

/// Error message from common upstream error shapes.
pub fn extract_error_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            body.get("error")
                .and_then(|e| e.as_str())
                .map(|s| s.to_string())
        })
        .or_else(|| {
            body.get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
}

fn error_type_of(body: &Value) -> String {
    body.get("error")
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
        .unwrap_or("upstream_error")
        .to_string()
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_MESSAGE_LEN {
        return text.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn usage_of(value: &Value) -> Option<Usage> {
    let usage = value.get("usage").filter(|u| u.is_object())?;
    let read = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|k| usage.get(*k).and_then(|v| v.as_u64()))
            .unwrap_or(0) as u32
    };
    Some(Usage::new(
        read(["prompt_tokens", "input_tokens"]),
        read(["completion_tokens", "output_tokens"]),
    ))
}

/// One upstream `chat.completion.chunk` as an internal event.
///
/// An `error` member turns the whole chunk into an error event.
pub fn parse_chunk(value: &Value) -> InternalEvent {
    if value.get("error").is_some_and(|e| !e.is_null()) {
        let message = extract_error_message(value).unwrap_or_else(|| value.to_string());
        let mut error = BackendError::new(message).with_type(error_type_of(value));
        if let Some(code) = value["error"].get("code").filter(|c| !c.is_null()) {
            error = error.with_code(code.as_str().map(str::to_string).unwrap_or_else(|| code.to_string()));
        }
        return InternalEvent::error(error);
    }

    let choices = value
        .get("choices")
        .and_then(|c| c.as_array())
        .map(|choices| choices.iter().map(parse_choice).collect())
        .unwrap_or_default();

    InternalEvent {
        id: str_field(value, "id").unwrap_or_default(),
        model: str_field(value, "model").unwrap_or_default(),
        created: value.get("created").and_then(|c| c.as_i64()).unwrap_or_default(),
        choices,
        usage: usage_of(value),
        error: None,
    }
}

fn parse_choice(choice: &Value) -> ChoiceDelta {
    let delta = &choice["delta"];
    let tool_calls = delta
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(position, call)| ToolCallDelta {
                    index: call
                        .get("index")
                        .and_then(|i| i.as_u64())
                        .unwrap_or(position as u64) as u32,
                    id: str_field(call, "id"),
                    name: str_field(&call["function"], "name"),
                    arguments: str_field(&call["function"], "arguments"),
                })
                .collect()
        })
        .unwrap_or_default();

    ChoiceDelta {
        index: choice.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32,
        role: str_field(delta, "role"),
        content: str_field(delta, "content"),
        reasoning: str_field(delta, "reasoning_content").or_else(|| str_field(delta, "reasoning")),
        tool_calls,
        finish_reason: choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(FinishReason::parse),
    }
}

/// Upstream `chat.completion` object as a single reply. Only choice 0 is kept.
pub fn parse_response(body: &Value) -> GenerationResponse {
    let choice = &body["choices"][0];
    let message = &choice["message"];
    let tool_calls = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolCall {
                    id: str_field(call, "id").unwrap_or_default(),
                    name: str_field(&call["function"], "name").unwrap_or_default(),
                    arguments: str_field(&call["function"], "arguments").unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    GenerationResponse {
        id: str_field(body, "id").unwrap_or_default(),
        model: str_field(body, "model").unwrap_or_default(),
        created: body.get("created").and_then(|c| c.as_i64()).unwrap_or_default(),
        text: str_field(message, "content").unwrap_or_default(),
        reasoning: str_field(message, "reasoning_content"),
        tool_calls,
        finish_reason: choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(FinishReason::parse),
        usage: usage_of(body).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::ChatMessage;

    #[test]
    fn test_build_payload() {
        let request = GenerationRequest {
            model: "gpt-4o".into(),
            system: Some("be brief".into()),
            messages: vec![ChatMessage::new("user", "hi")],
            stream: true,
            max_tokens: Some(64),
            ..Default::default()
        };
        let payload = UpstreamBackend::build_payload(&request);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "hi");
        assert_eq!(payload["stream_options"]["include_usage"], true);
        assert_eq!(payload["max_tokens"], 64);
        assert!(payload.get("temperature").is_none());
    }

    #[test]
    fn test_find_frame_end_from_offset() {
        let buffer = b"data: {}\n\ndata: {}\n\n";
        assert_eq!(find_frame_end(buffer, 0), Some(8));
        assert_eq!(find_frame_end(buffer, 9), Some(18));
        assert_eq!(find_frame_end(buffer, 19), None);
        assert_eq!(find_frame_end(buffer, 100), None);
        assert_eq!(find_frame_end(b"data: x\n\nrest", 0), Some(7));

        // terminator split across two reads: resume one byte back
        let mut partial = b"data: {}\n".to_vec();
        assert_eq!(find_frame_end(&partial, 0), None);
        let resume = partial.len() - 1;
        partial.push(b'\n');
        assert_eq!(find_frame_end(&partial, resume), Some(8));
    }

    #[test]
    fn test_parse_chunk_text_and_finish() {
        let chunk = json!({
            "id": "c1", "model": "m", "created": 7,
            "choices": [{"index": 0, "delta": {"content": "Hi"}, "finish_reason": null}]
        });
        let event = parse_chunk(&chunk);
        assert_eq!(event.choices[0].content.as_deref(), Some("Hi"));
        assert!(event.choices[0].finish_reason.is_none());

        let chunk = json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "length"}]});
        assert_eq!(parse_chunk(&chunk).finish_reason(), Some(&FinishReason::Length));
    }

    #[test]
    fn test_parse_chunk_tool_calls_and_usage() {
        let chunk = json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "f", "arguments": "{"}}
            ]}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5}
        });
        let event = parse_chunk(&chunk);
        let call = &event.choices[0].tool_calls[0];
        assert_eq!(call.name.as_deref(), Some("f"));
        assert_eq!(event.usage, Some(Usage::new(3, 5)));
    }

    #[test]
    fn test_parse_chunk_error() {
        let chunk = json!({"error": {"message": "overloaded", "type": "server_error", "code": 529}});
        let event = parse_chunk(&chunk);
        let error = event.error.unwrap();
        assert_eq!(error.message, "overloaded");
        assert_eq!(error.error_type, "server_error");
        assert_eq!(error.code.as_deref(), Some("529"));
    }

    #[test]
    fn test_parse_response() {
        let body = json!({
            "id": "c1", "model": "m", "created": 1,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "done"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        });
        let response = parse_response(&body);
        assert_eq!(response.text, "done");
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.usage.total_tokens(), 3);
    }

    #[test]
    fn test_truncate_long_error() {
        let long = "e".repeat(1000);
        assert_eq!(truncate(&long).len(), MAX_ERROR_MESSAGE_LEN + 3);
    }
}
