//! Boundary to the generation backend.
//!
//! The relay never talks to a model directly. It hands a normalized
//! [`GenerationRequest`] to a [`GenerationBackend`] and gets back either one
//! [`GenerationResponse`] or an [`EventStream`] of [`InternalEvent`]s.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream};
use serde::{Deserialize, Serialize};

use crate::core::cancel::StreamCancelHandle;
use crate::core::error::Result;
use crate::transformer::{GenerationResponse, InternalEvent, RequestType};

/// One message of the conversation, flattened to text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Protocol-neutral request contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Client protocol the request arrived on
    pub request_type: RequestType,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Tool definitions in OpenAI `{"type":"function","function":{...}}` form
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
}

/// A cancellable, abandonable sequence of backend events.
///
/// Cancelling (or dropping) the stream tells the producer to stop; the
/// producer watches the same [`StreamCancelHandle`].
pub struct EventStream {
    inner: BoxStream<'static, InternalEvent>,
    cancel: StreamCancelHandle,
}

impl EventStream {
    pub fn new(inner: BoxStream<'static, InternalEvent>, cancel: StreamCancelHandle) -> Self {
        Self { inner, cancel }
    }

    /// Finite stream over pre-built events.
    pub fn from_events(events: Vec<InternalEvent>) -> Self {
        Self::new(Box::pin(stream::iter(events)), StreamCancelHandle::new())
    }

    pub fn cancel_handle(&self) -> StreamCancelHandle {
        self.cancel.clone()
    }

    /// Fire-and-forget stop signal to the producer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for EventStream {
    type Item = InternalEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// What the backend produced for a request.
#[derive(Debug)]
pub enum BackendReply {
    Single(GenerationResponse),
    Stream(EventStream),
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Platform id recorded against requests served by this backend.
    fn platform(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<BackendReply>;
}
