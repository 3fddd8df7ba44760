//! OpenAI "responses" framing.
//!
//! The responses protocol numbers its output items (`output_index`) and every
//! event (`sequence_number`). Both counters live in a [`StreamIndexContext`]
//! owned by one [`ResponsesTranscoder`], i.e. by one stream. A single internal
//! event may fan out into several frames, e.g. `response.output_item.added`
//! followed by `response.output_text.delta`.
//!
//! The finish reason closes every open output item; the terminal
//! `response.completed` (or `response.incomplete`) is emitted by
//! [`Transcoder::finish`] so that trailing usage is included.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::sse::SseFrame;
use super::unified::{
    BackendError, ChoiceDelta, FinishReason, GenerationResponse, InternalEvent, RequestType,
    ToolCallDelta, Usage,
};
use super::{TranscodeError, Transcoder};

/// Per-stream index bookkeeping. Indices only grow and are never reused.
#[derive(Debug, Default, Clone)]
pub struct StreamIndexContext {
    next_output_index: u32,
    next_sequence: u64,
}

impl StreamIndexContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next output item index.
    pub fn allocate_output_index(&mut self) -> u32 {
        let index = self.next_output_index;
        self.next_output_index += 1;
        index
    }

    /// Reserve the next event sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    pub fn peek_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn output_items_allocated(&self) -> u32 {
        self.next_output_index
    }
}

#[derive(Debug)]
struct OpenItem {
    output_index: u32,
    item_id: String,
    text: String,
}

#[derive(Debug)]
struct ToolItem {
    output_index: u32,
    item_id: String,
    call_id: String,
    name: String,
    arguments: String,
    done: bool,
}

#[derive(Debug, Default)]
pub struct ResponsesTranscoder {
    ctx: StreamIndexContext,
    response_id: String,
    model: String,
    created_at: i64,
    created_sent: bool,
    /// Finish reason seen; only usage may follow
    finish_reason: Option<FinishReason>,
    finished: bool,
    message: Option<OpenItem>,
    reasoning: Option<OpenItem>,
    tools: BTreeMap<u32, ToolItem>,
    /// Finished output items keyed by output index
    output: BTreeMap<u32, Value>,
    usage: Option<Usage>,
}

impl ResponsesTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> &StreamIndexContext {
        &self.ctx
    }

    fn frame(&mut self, mut payload: Value) -> Result<SseFrame, TranscodeError> {
        payload["sequence_number"] = json!(self.ctx.next_sequence());
        Ok(SseFrame::data(&payload)?)
    }

    fn response_object(&self, status: &str, incomplete_reason: Option<&str>) -> Value {
        let mut response = json!({
            "id": self.response_id,
            "object": "response",
            "created_at": self.created_at,
            "model": self.model,
            "status": status,
            "output": self.output.values().cloned().collect::<Vec<_>>(),
        });
        if let Some(usage) = &self.usage {
            response["usage"] = usage_json(usage);
        }
        if let Some(reason) = incomplete_reason {
            response["incomplete_details"] = json!({ "reason": reason });
        }
        response
    }

    fn ensure_created(&mut self, event: &InternalEvent, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        if self.created_sent {
            return Ok(());
        }
        self.created_sent = true;
        self.response_id = if event.id.is_empty() {
            format!("resp_{}", uuid::Uuid::new_v4().simple())
        } else {
            event.id.clone()
        };
        self.model = event.model.clone();
        self.created_at = event.created;

        let created = json!({
            "type": "response.created",
            "response": self.response_object("in_progress", None),
        });
        frames.push(self.frame(created)?);
        Ok(())
    }

    fn open_reasoning(&mut self, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        if self.reasoning.is_some() {
            return Ok(());
        }
        self.close_message(frames)?;
        let output_index = self.ctx.allocate_output_index();
        let item_id = format!("rs_{}_{}", self.response_id, output_index);
        let added = json!({
            "type": "response.output_item.added",
            "output_index": output_index,
            "item": { "id": item_id, "type": "reasoning", "summary": [] },
        });
        frames.push(self.frame(added)?);
        self.reasoning = Some(OpenItem {
            output_index,
            item_id,
            text: String::new(),
        });
        Ok(())
    }

    fn close_reasoning(&mut self, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        let Some(item) = self.reasoning.take() else {
            return Ok(());
        };
        let text_done = json!({
            "type": "response.reasoning_summary_text.done",
            "item_id": item.item_id,
            "output_index": item.output_index,
            "summary_index": 0,
            "text": item.text,
        });
        frames.push(self.frame(text_done)?);

        let finished = json!({
            "id": item.item_id,
            "type": "reasoning",
            "summary": [{ "type": "summary_text", "text": item.text }],
        });
        let done = json!({
            "type": "response.output_item.done",
            "output_index": item.output_index,
            "item": finished,
        });
        frames.push(self.frame(done)?);
        self.output.insert(item.output_index, finished);
        Ok(())
    }

    fn open_message(&mut self, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        if self.message.is_some() {
            return Ok(());
        }
        self.close_reasoning(frames)?;
        let output_index = self.ctx.allocate_output_index();
        let item_id = format!("msg_{}_{}", self.response_id, output_index);

        let added = json!({
            "type": "response.output_item.added",
            "output_index": output_index,
            "item": {
                "id": item_id,
                "type": "message",
                "role": "assistant",
                "status": "in_progress",
                "content": [],
            },
        });
        frames.push(self.frame(added)?);

        let part = json!({
            "type": "response.content_part.added",
            "item_id": item_id,
            "output_index": output_index,
            "content_index": 0,
            "part": { "type": "output_text", "text": "", "annotations": [] },
        });
        frames.push(self.frame(part)?);

        self.message = Some(OpenItem {
            output_index,
            item_id,
            text: String::new(),
        });
        Ok(())
    }

    fn close_message(&mut self, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        let Some(item) = self.message.take() else {
            return Ok(());
        };
        let text_done = json!({
            "type": "response.output_text.done",
            "item_id": item.item_id,
            "output_index": item.output_index,
            "content_index": 0,
            "text": item.text,
        });
        frames.push(self.frame(text_done)?);

        let part = json!({ "type": "output_text", "text": item.text, "annotations": [] });
        let part_done = json!({
            "type": "response.content_part.done",
            "item_id": item.item_id,
            "output_index": item.output_index,
            "content_index": 0,
            "part": part,
        });
        frames.push(self.frame(part_done)?);

        let finished = json!({
            "id": item.item_id,
            "type": "message",
            "role": "assistant",
            "status": "completed",
            "content": [part],
        });
        let done = json!({
            "type": "response.output_item.done",
            "output_index": item.output_index,
            "item": finished,
        });
        frames.push(self.frame(done)?);
        self.output.insert(item.output_index, finished);
        Ok(())
    }

    fn tool_delta(&mut self, delta: &ToolCallDelta, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        if !self.tools.contains_key(&delta.index) {
            let Some(name) = delta.name.clone() else {
                return Err(TranscodeError::unsupported(
                    RequestType::Responses,
                    format!("tool call {} started without a name", delta.index),
                ));
            };
            self.close_reasoning(frames)?;
            self.close_message(frames)?;

            let output_index = self.ctx.allocate_output_index();
            let item_id = format!("fc_{}_{}", self.response_id, output_index);
            let call_id = delta
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", output_index));
            let added = json!({
                "type": "response.output_item.added",
                "output_index": output_index,
                "item": {
                    "id": item_id,
                    "type": "function_call",
                    "call_id": call_id,
                    "name": name,
                    "arguments": "",
                    "status": "in_progress",
                },
            });
            frames.push(self.frame(added)?);
            self.tools.insert(
                delta.index,
                ToolItem {
                    output_index,
                    item_id,
                    call_id,
                    name,
                    arguments: String::new(),
                    done: false,
                },
            );
        }

        let Some(arguments) = delta.arguments.as_deref().filter(|a| !a.is_empty()) else {
            return Ok(());
        };
        let (item_id, output_index) = match self.tools.get_mut(&delta.index) {
            Some(tool) if !tool.done => {
                tool.arguments.push_str(arguments);
                (tool.item_id.clone(), tool.output_index)
            }
            _ => {
                return Err(TranscodeError::unsupported(
                    RequestType::Responses,
                    format!("arguments for closed tool call {}", delta.index),
                ))
            }
        };
        let frame = json!({
            "type": "response.function_call_arguments.delta",
            "item_id": item_id,
            "output_index": output_index,
            "delta": arguments,
        });
        frames.push(self.frame(frame)?);
        Ok(())
    }

    fn close_tools(&mut self, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        let open: Vec<u32> = self
            .tools
            .iter()
            .filter(|(_, tool)| !tool.done)
            .map(|(index, _)| *index)
            .collect();
        for index in open {
            let (item_id, output_index, finished, arguments) = {
                let Some(tool) = self.tools.get_mut(&index) else {
                    continue;
                };
                tool.done = true;
                let finished = json!({
                    "id": tool.item_id,
                    "type": "function_call",
                    "call_id": tool.call_id,
                    "name": tool.name,
                    "arguments": tool.arguments,
                    "status": "completed",
                });
                (tool.item_id.clone(), tool.output_index, finished, tool.arguments.clone())
            };
            let args_done = json!({
                "type": "response.function_call_arguments.done",
                "item_id": item_id,
                "output_index": output_index,
                "arguments": arguments,
            });
            frames.push(self.frame(args_done)?);
            let done = json!({
                "type": "response.output_item.done",
                "output_index": output_index,
                "item": finished,
            });
            frames.push(self.frame(done)?);
            self.output.insert(output_index, finished);
        }
        Ok(())
    }

    fn close_items(&mut self, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        self.close_reasoning(frames)?;
        self.close_message(frames)?;
        self.close_tools(frames)
    }

    fn complete(&mut self, reason: Option<&FinishReason>, frames: &mut Vec<SseFrame>) -> Result<(), TranscodeError> {
        self.close_items(frames)?;

        let terminal = match reason {
            Some(FinishReason::Length) => json!({
                "type": "response.incomplete",
                "response": self.response_object("incomplete", Some("max_output_tokens")),
            }),
            Some(FinishReason::ContentFilter) => json!({
                "type": "response.incomplete",
                "response": self.response_object("incomplete", Some("content_filter")),
            }),
            _ => json!({
                "type": "response.completed",
                "response": self.response_object("completed", None),
            }),
        };
        frames.push(self.frame(terminal)?);
        self.finished = true;
        Ok(())
    }
}

impl Transcoder for ResponsesTranscoder {
    fn request_type(&self) -> RequestType {
        RequestType::Responses
    }

    fn transcode(&mut self, event: &InternalEvent) -> Result<Vec<SseFrame>, TranscodeError> {
        if event.is_empty() {
            return Ok(Vec::new());
        }
        if self.finished {
            return Err(TranscodeError::unsupported(
                RequestType::Responses,
                "event after the terminal response frame",
            ));
        }
        if let Some(choice) = event.choices.iter().find(|c| c.index != 0) {
            return Err(TranscodeError::unsupported(
                RequestType::Responses,
                format!("choice index {} (only a single choice is supported)", choice.index),
            ));
        }
        if self.finish_reason.is_some() && event.choices.iter().any(ChoiceDelta::has_output) {
            return Err(TranscodeError::unsupported(
                RequestType::Responses,
                "content after the finish reason",
            ));
        }

        let mut frames = Vec::new();
        self.ensure_created(event, &mut frames)?;
        if let Some(usage) = event.usage {
            self.usage = Some(usage);
        }

        let mut finish = None;
        for choice in &event.choices {
            if let Some(reasoning) = choice.reasoning.as_deref().filter(|r| !r.is_empty()) {
                self.open_reasoning(&mut frames)?;
                let (item_id, output_index) = match self.reasoning.as_mut() {
                    Some(item) => {
                        item.text.push_str(reasoning);
                        (item.item_id.clone(), item.output_index)
                    }
                    None => continue,
                };
                let delta = json!({
                    "type": "response.reasoning_summary_text.delta",
                    "item_id": item_id,
                    "output_index": output_index,
                    "summary_index": 0,
                    "delta": reasoning,
                });
                frames.push(self.frame(delta)?);
            }

            if let Some(content) = choice.content.as_deref().filter(|c| !c.is_empty()) {
                self.open_message(&mut frames)?;
                let (item_id, output_index) = match self.message.as_mut() {
                    Some(item) => {
                        item.text.push_str(content);
                        (item.item_id.clone(), item.output_index)
                    }
                    None => continue,
                };
                let delta = json!({
                    "type": "response.output_text.delta",
                    "item_id": item_id,
                    "output_index": output_index,
                    "content_index": 0,
                    "delta": content,
                });
                frames.push(self.frame(delta)?);
            }

            for call in &choice.tool_calls {
                self.tool_delta(call, &mut frames)?;
            }

            if finish.is_none() {
                finish = choice.finish_reason.clone();
            }
        }

        if finish.is_some() && self.finish_reason.is_none() {
            self.close_items(&mut frames)?;
            self.finish_reason = finish;
        }
        Ok(frames)
    }

    fn finish(&mut self) -> Result<Vec<SseFrame>, TranscodeError> {
        if self.finished {
            return Ok(Vec::new());
        }
        let mut frames = Vec::new();
        if !self.created_sent {
            self.ensure_created(&InternalEvent::default(), &mut frames)?;
        }
        let reason = self.finish_reason.take();
        self.complete(reason.as_ref(), &mut frames)?;
        Ok(frames)
    }

    fn error_frame(&self, error: &BackendError) -> SseFrame {
        SseFrame {
            event: None,
            data: error_body(error, Some(self.ctx.peek_sequence())).to_string(),
        }
    }
}

fn usage_json(usage: &Usage) -> Value {
    json!({
        "input_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens(),
    })
}

/// Responses-style error envelope.
pub fn error_body(error: &BackendError, sequence_number: Option<u64>) -> Value {
    let mut body = json!({
        "type": "error",
        "code": error.code.clone().unwrap_or_else(|| error.error_type.clone()),
        "message": error.message,
        "param": null,
    });
    if let Some(seq) = sequence_number {
        body["sequence_number"] = json!(seq);
    }
    body
}

/// Non-streamed `response` object.
pub fn render_response(response: &GenerationResponse) -> Value {
    let mut output = Vec::new();
    if let Some(reasoning) = &response.reasoning {
        output.push(json!({
            "id": format!("rs_{}_{}", response.id, output.len()),
            "type": "reasoning",
            "summary": [{ "type": "summary_text", "text": reasoning }],
        }));
    }
    if !response.text.is_empty() || response.tool_calls.is_empty() {
        output.push(json!({
            "id": format!("msg_{}_{}", response.id, output.len()),
            "type": "message",
            "role": "assistant",
            "status": "completed",
            "content": [{ "type": "output_text", "text": response.text, "annotations": [] }],
        }));
    }
    for call in &response.tool_calls {
        output.push(json!({
            "id": format!("fc_{}_{}", response.id, output.len()),
            "type": "function_call",
            "call_id": call.id,
            "name": call.name,
            "arguments": call.arguments,
            "status": "completed",
        }));
    }

    let status = match response.finish_reason {
        Some(FinishReason::Length) | Some(FinishReason::ContentFilter) => "incomplete",
        _ => "completed",
    };
    json!({
        "id": response.id,
        "object": "response",
        "created_at": response.created,
        "model": response.model,
        "status": status,
        "output": output,
        "usage": usage_json(&response.usage),
    })
}
