//! Protocol transcoders.
//!
//! The backend engine speaks one protocol-neutral event shape
//! ([`InternalEvent`]); each client protocol has a [`Transcoder`] that turns
//! those events into its own SSE frames.
//!
//! ```text
//! Backend EventStream
//!     ↓  InternalEvent
//! [Transcoder::transcode]   ← chat / responses / anthropic
//!     ↓  Vec<SseFrame>
//! StreamRelay → client
//! ```
//!
//! Chat-style transcoding is stateless and one-to-one. The responses and
//! Anthropic transcoders are stateful and may fan out one event into several
//! frames.

pub mod anthropic;
pub mod openai;
pub mod response_api;
pub mod sse;
pub mod unified;

pub use anthropic::AnthropicTranscoder;
pub use openai::ChatTranscoder;
pub use response_api::{ResponsesTranscoder, StreamIndexContext};
pub use sse::SseFrame;
pub use unified::*;

use thiserror::Error;

/// A frame could not be built from an event.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The event shape is not expressible in the target protocol
    #[error("unsupported event for {protocol}: {reason}")]
    Unsupported {
        protocol: RequestType,
        reason: String,
    },

    #[error("failed to serialize frame: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TranscodeError {
    pub fn unsupported(protocol: RequestType, reason: impl Into<String>) -> Self {
        TranscodeError::Unsupported {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Converts internal events into one client protocol's frames.
///
/// One instance serves exactly one stream; stateful implementations keep
/// their per-stream bookkeeping inside the instance.
pub trait Transcoder: Send {
    fn request_type(&self) -> RequestType;

    /// Map one event to zero or more frames. Empty events yield no frames.
    fn transcode(&mut self, event: &InternalEvent) -> Result<Vec<SseFrame>, TranscodeError>;

    /// Closing frames owed after the backend sequence is exhausted.
    fn finish(&mut self) -> Result<Vec<SseFrame>, TranscodeError> {
        Ok(Vec::new())
    }

    /// Protocol error envelope for a backend or relay error.
    fn error_frame(&self, error: &BackendError) -> SseFrame;

    /// End-of-stream sentinel, if the protocol uses one.
    fn done_sentinel(&self) -> Option<SseFrame> {
        if self.request_type().uses_done_sentinel() {
            Some(SseFrame::done())
        } else {
            None
        }
    }
}

/// Fresh transcoder (with fresh per-stream state) for a request type.
pub fn transcoder_for(request_type: RequestType) -> Box<dyn Transcoder> {
    match request_type {
        RequestType::ChatCompletions => Box::new(ChatTranscoder::new()),
        RequestType::Responses => Box::new(ResponsesTranscoder::new()),
        RequestType::Messages => Box::new(AnthropicTranscoder::new()),
    }
}

/// Render a non-streamed reply as the protocol's response body.
pub fn render_response(request_type: RequestType, response: &GenerationResponse) -> serde_json::Value {
    match request_type {
        RequestType::ChatCompletions => openai::render_response(response),
        RequestType::Responses => response_api::render_response(response),
        RequestType::Messages => anthropic::render_response(response),
    }
}

/// Render an error as the protocol's JSON error body.
pub fn error_body(request_type: RequestType, error: &BackendError) -> serde_json::Value {
    match request_type {
        RequestType::ChatCompletions => openai::error_body(error),
        RequestType::Responses => response_api::error_body(error, None),
        RequestType::Messages => anthropic::error_body(error),
    }
}
