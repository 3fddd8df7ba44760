//! Anthropic messages framing.
//!
//! Every frame carries an `event:` line naming its type. A stream opens with
//! `message_start`, emits numbered content blocks
//! (`content_block_start` / `content_block_delta` / `content_block_stop`) and
//! ends with `message_delta` followed by `message_stop`. There is no
//! `[DONE]` sentinel.
//!
//! A finish reason closes the open block but the closing `message_delta` is
//! held until the backend sequence ends: usage commonly arrives in a chunk
//! after the finish reason and belongs in that frame.

use serde_json::{json, Value};

use super::sse::SseFrame;
use super::unified::{
    BackendError, ChoiceDelta, FinishReason, GenerationResponse, InternalEvent, RequestType,
    ToolCallDelta, Usage,
};
use super::{TranscodeError, Transcoder};

/// Kind of the content block currently open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    /// Tool call slot index from the internal event
    ToolUse(u32),
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    index: u32,
    kind: BlockKind,
}

#[derive(Debug, Default)]
pub struct AnthropicTranscoder {
    started: bool,
    /// Finish reason seen; only usage may follow
    finish_reason: Option<FinishReason>,
    stopped: bool,
    next_block: u32,
    open: Option<OpenBlock>,
    /// Tool slots that already had a block; a slot never reopens
    seen_tools: Vec<u32>,
    usage: Usage,
}

impl AnthropicTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn typed(kind: &str, payload: Value) -> Result<SseFrame, TranscodeError> {
        Ok(SseFrame::typed(kind, &payload)?)
    }

    fn message_start(&mut self, event: &InternalEvent) -> Result<SseFrame, TranscodeError> {
        self.started = true;
        let id = if event.id.is_empty() {
            format!("msg_{}", uuid::Uuid::new_v4().simple())
        } else {
            event.id.clone()
        };
        let input_tokens = event.usage.map(|u| u.input_tokens).unwrap_or(0);
        Self::typed(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "model": event.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": input_tokens, "output_tokens": 0 }
                }
            }),
        )
    }

    fn close_block(&mut self, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        if let Some(block) = self.open.take() {
            frames.push(Self::typed(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": block.index }),
            )?);
        }
        Ok(())
    }

    /// Make `kind` the open block, closing any other; returns its index.
    fn ensure_block(
        &mut self,
        kind: BlockKind,
        content_block: Value,
        frames: &mut Vec<SseFrame>,
    ) -> Result<u32, TranscodeError> {
        if let Some(block) = self.open {
            if block.kind == kind {
                return Ok(block.index);
            }
        }
        self.close_block(frames)?;
        let index = self.next_block;
        self.next_block += 1;
        frames.push(Self::typed(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": content_block,
            }),
        )?);
        self.open = Some(OpenBlock { index, kind });
        Ok(index)
    }

    fn block_delta(index: u32, delta: Value) -> Result<SseFrame, TranscodeError> {
        Self::typed(
            "content_block_delta",
            json!({ "type": "content_block_delta", "index": index, "delta": delta }),
        )
    }

    fn tool_delta(&mut self, call: &ToolCallDelta, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        let kind = BlockKind::ToolUse(call.index);
        let is_open = matches!(self.open, Some(block) if block.kind == kind);

        let index = if is_open {
            self.open.map(|b| b.index).unwrap_or_default()
        } else {
            if self.seen_tools.contains(&call.index) {
                return Err(TranscodeError::unsupported(
                    RequestType::Messages,
                    format!("tool call {} resumed after its block closed", call.index),
                ));
            }
            let Some(name) = call.name.as_deref() else {
                return Err(TranscodeError::unsupported(
                    RequestType::Messages,
                    format!("tool call {} started without a name", call.index),
                ));
            };
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
            self.seen_tools.push(call.index);
            self.ensure_block(
                kind,
                json!({ "type": "tool_use", "id": id, "name": name, "input": {} }),
                frames,
            )?
        };

        if let Some(partial) = call.arguments.as_deref().filter(|a| !a.is_empty()) {
            frames.push(Self::block_delta(
                index,
                json!({ "type": "input_json_delta", "partial_json": partial }),
            )?);
        }
        Ok(())
    }

    fn stop(&mut self, reason: Option<&FinishReason>, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        self.close_block(frames)?;
        frames.push(Self::typed(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": stop_reason(reason),
                    "stop_sequence": null
                },
                "usage": {
                    "input_tokens": self.usage.input_tokens,
                    "output_tokens": self.usage.output_tokens
                }
            }),
        )?);
        frames.push(Self::typed("message_stop", json!({ "type": "message_stop" }))?);
        self.stopped = true;
        Ok(())
    }
}

impl Transcoder for AnthropicTranscoder {
    fn request_type(&self) -> RequestType {
        RequestType::Messages
    }

    fn transcode(&mut self, event: &InternalEvent) -> Result<Vec<SseFrame>, TranscodeError> {
        if event.is_empty() {
            return Ok(Vec::new());
        }
        if self.stopped {
            return Err(TranscodeError::unsupported(
                RequestType::Messages,
                "event after message_stop",
            ));
        }
        if let Some(choice) = event.choices.iter().find(|c| c.index != 0) {
            return Err(TranscodeError::unsupported(
                RequestType::Messages,
                format!("choice index {} (only a single choice is supported)", choice.index),
            ));
        }
        if self.finish_reason.is_some() && event.choices.iter().any(ChoiceDelta::has_output) {
            return Err(TranscodeError::unsupported(
                RequestType::Messages,
                "content after the finish reason",
            ));
        }

        let mut frames = Vec::new();
        if !self.started {
            frames.push(self.message_start(event)?);
        }
        if let Some(usage) = event.usage {
            self.usage = usage;
        }

        let mut finish = None;
        for choice in &event.choices {
            if let Some(thinking) = choice.reasoning.as_deref().filter(|t| !t.is_empty()) {
                let index = self.ensure_block(
                    BlockKind::Thinking,
                    json!({ "type": "thinking", "thinking": "" }),
                    &mut frames,
                )?;
                frames.push(Self::block_delta(
                    index,
                    json!({ "type": "thinking_delta", "thinking": thinking }),
                )?);
            }
            if let Some(text) = choice.content.as_deref().filter(|t| !t.is_empty()) {
                let index = self.ensure_block(
                    BlockKind::Text,
                    json!({ "type": "text", "text": "" }),
                    &mut frames,
                )?;
                frames.push(Self::block_delta(
                    index,
                    json!({ "type": "text_delta", "text": text }),
                )?);
            }
            for call in &choice.tool_calls {
                self.tool_delta(call, &mut frames)?;
            }
            if finish.is_none() {
                finish = choice.finish_reason.clone();
            }
        }

        if finish.is_some() && self.finish_reason.is_none() {
            self.close_block(&mut frames)?;
            self.finish_reason = finish;
        }
        Ok(frames)
    }

    fn finish(&mut self) -> Result<Vec<SseFrame>, TranscodeError> {
        if self.stopped {
            return Ok(Vec::new());
        }
        let mut frames = Vec::new();
        if !self.started {
            frames.push(self.message_start(&InternalEvent::default())?);
        }
        let reason = self.finish_reason.take();
        self.stop(reason.as_ref(), &mut frames)?;
        Ok(frames)
    }

    fn error_frame(&self, error: &BackendError) -> SseFrame {
        SseFrame {
            event: Some("error".to_string()),
            data: error_body(error).to_string(),
        }
    }
}

/// Anthropic `stop_reason` for a finish reason. Unknown reasons pass through.
pub fn stop_reason(reason: Option<&FinishReason>) -> String {
    match reason {
        None | Some(FinishReason::Stop) => "end_turn".to_string(),
        Some(FinishReason::Length) => "max_tokens".to_string(),
        Some(FinishReason::ToolCalls) => "tool_use".to_string(),
        Some(FinishReason::ContentFilter) => "refusal".to_string(),
        Some(FinishReason::Other(other)) => other.clone(),
    }
}

/// `{"type":"error","error":{...}}` envelope.
pub fn error_body(error: &BackendError) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": error.error_type,
            "message": error.message,
        }
    })
}

/// Non-streamed `message` object.
pub fn render_response(response: &GenerationResponse) -> Value {
    let mut content = Vec::new();
    if let Some(thinking) = &response.reasoning {
        content.push(json!({ "type": "thinking", "thinking": thinking }));
    }
    if !response.text.is_empty() {
        content.push(json!({ "type": "text", "text": response.text }));
    }
    for call in &response.tool_calls {
        let input: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": input,
        }));
    }

    json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": content,
        "stop_reason": stop_reason(response.finish_reason.as_ref()),
        "stop_sequence": null,
        "usage": {
            "input_tokens": response.usage.input_tokens,
            "output_tokens": response.usage.output_tokens,
        }
    })
}
