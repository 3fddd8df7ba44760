//! OpenAI chat-completions framing.
//!
//! Stateless: every non-empty event becomes exactly one
//! `chat.completion.chunk` frame.

use serde_json::{json, Value};

use super::sse::SseFrame;
use super::unified::{BackendError, ChoiceDelta, GenerationResponse, InternalEvent, RequestType};
use super::{TranscodeError, Transcoder};

#[derive(Debug, Default)]
pub struct ChatTranscoder;

impl ChatTranscoder {
    pub fn new() -> Self {
        Self
    }

    fn choice_json(choice: &ChoiceDelta) -> Value {
        let mut delta = serde_json::Map::new();
        if let Some(role) = &choice.role {
            delta.insert("role".into(), json!(role));
        }
        if let Some(content) = &choice.content {
            delta.insert("content".into(), json!(content));
        }
        if let Some(reasoning) = &choice.reasoning {
            delta.insert("reasoning_content".into(), json!(reasoning));
        }
        if !choice.tool_calls.is_empty() {
            let calls: Vec<Value> = choice
                .tool_calls
                .iter()
                .map(|call| {
                    let mut function = serde_json::Map::new();
                    if let Some(name) = &call.name {
                        function.insert("name".into(), json!(name));
                    }
                    if let Some(arguments) = &call.arguments {
                        function.insert("arguments".into(), json!(arguments));
                    }
                    let mut obj = serde_json::Map::new();
                    obj.insert("index".into(), json!(call.index));
                    if let Some(id) = &call.id {
                        obj.insert("id".into(), json!(id));
                        obj.insert("type".into(), json!("function"));
                    }
                    obj.insert("function".into(), Value::Object(function));
                    Value::Object(obj)
                })
                .collect();
            delta.insert("tool_calls".into(), Value::Array(calls));
        }

        json!({
            "index": choice.index,
            "delta": Value::Object(delta),
            "finish_reason": choice.finish_reason.as_ref().map(|r| r.as_str()),
        })
    }
}

impl Transcoder for ChatTranscoder {
    fn request_type(&self) -> RequestType {
        RequestType::ChatCompletions
    }

    fn transcode(&mut self, event: &InternalEvent) -> Result<Vec<SseFrame>, TranscodeError> {
        if event.is_empty() {
            return Ok(Vec::new());
        }

        let choices: Vec<Value> = event
            .choices
            .iter()
            .filter(|c| !c.is_empty())
            .map(Self::choice_json)
            .collect();

        let mut chunk = json!({
            "id": event.id,
            "object": "chat.completion.chunk",
            "created": event.created,
            "model": event.model,
            "choices": choices,
        });
        if let Some(usage) = &event.usage {
            chunk["usage"] = json!({
                "prompt_tokens": usage.input_tokens,
                "completion_tokens": usage.output_tokens,
                "total_tokens": usage.total_tokens(),
            });
        }

        Ok(vec![SseFrame::data(&chunk)?])
    }

    fn error_frame(&self, error: &BackendError) -> SseFrame {
        SseFrame {
            event: None,
            data: error_body(error).to_string(),
        }
    }
}

/// `{"error": {...}}` envelope shared by streaming and non-streaming paths.
pub fn error_body(error: &BackendError) -> Value {
    json!({
        "error": {
            "message": error.message,
            "type": error.error_type,
            "code": error.code,
        }
    })
}

/// Non-streamed `chat.completion` object.
pub fn render_response(response: &GenerationResponse) -> Value {
    let mut message = json!({
        "role": "assistant",
        "content": response.text,
    });
    if let Some(reasoning) = &response.reasoning {
        message["reasoning_content"] = json!(reasoning);
    }
    if !response.tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(
            response
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments }
                    })
                })
                .collect(),
        );
    }

    json!({
        "id": response.id,
        "object": "chat.completion",
        "created": response.created,
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": response.finish_reason.as_ref().map(|r| r.as_str()).unwrap_or("stop"),
        }],
        "usage": {
            "prompt_tokens": response.usage.input_tokens,
            "completion_tokens": response.usage.output_tokens,
            "total_tokens": response.usage.total_tokens(),
        }
    })
}
