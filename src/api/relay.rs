//! Stream relay core.
//!
//! Drives one streaming request: pulls [`InternalEvent`]s from the backend,
//! transcodes them, and writes SSE frames to a [`FrameSink`] one by one,
//! flushing after each frame.
//!
//! ```text
//! EventStream ──► StreamRelay::run ──► Transcoder ──► FrameSink ──► client
//!      ▲                │
//!      └──── cancel ◄───┘  (write failure, transcode error, client gone)
//! ```
//!
//! [`spawn_relay`] runs the relay on its own task inside a panic boundary and
//! owns the request's [`ConnectionGuard`], so the active-connection count is
//! released exactly once however the stream ends.

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::core::accountant::ConnectionGuard;
use crate::core::cancel::StreamCancelHandle;
use crate::core::logging::REQUEST_ID;
use crate::core::metrics::Metrics;
use crate::core::middleware::{panic_message, take_panic_backtrace, RequestContext};
use crate::core::request_log::{RequestLogEntry, RequestLogger};
use crate::services::backend::EventStream;
use crate::transformer::{transcoder_for, BackendError, InternalEvent, RequestType, SseFrame, Transcoder};

/// Error type of the response body stream.
pub type BodyItem = Result<Bytes, Infallible>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The reading side is gone
    #[error("client disconnected")]
    Closed,

    #[error("write failed: {0}")]
    Failed(String),
}

/// Writable, flushable byte sink for SSE frames.
#[async_trait]
pub trait FrameSink: Send {
    async fn write(&mut self, bytes: Bytes) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError>;

    /// Whether the reading side is known to be gone.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Sink feeding an axum response body through a bounded channel.
pub struct ChannelSink {
    tx: mpsc::Sender<BodyItem>,
}

impl ChannelSink {
    /// Create a sink and the body stream that drains it.
    pub fn channel(buffer: usize) -> (Self, ReceiverStream<BodyItem>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, ReceiverStream::new(rx))
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn write(&mut self, bytes: Bytes) -> Result<(), SinkError> {
        self.tx.send(Ok(bytes)).await.map_err(|_| SinkError::Closed)
    }

    // Channel sends are delivered as soon as they are accepted
    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.tx.is_closed() {
            Err(SinkError::Closed)
        } else {
            Ok(())
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// In-memory sink that records frames and can be told to fail.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub frames: Vec<Bytes>,
    /// Number of successful writes before every further write fails
    pub fail_after: Option<usize>,
    pub flushes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_after(writes: usize) -> Self {
        Self {
            fail_after: Some(writes),
            ..Default::default()
        }
    }

    /// Everything written so far as one string.
    pub fn text(&self) -> String {
        self.frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn write(&mut self, bytes: Bytes) -> Result<(), SinkError> {
        if self.fail_after.is_some_and(|limit| self.frames.len() >= limit) {
            return Err(SinkError::Closed);
        }
        self.frames.push(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.flushes += 1;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.fail_after.is_some_and(|limit| self.frames.len() >= limit)
    }
}

/// How a relayed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Backend exhausted; closing frames and sentinel written
    Completed,
    /// Backend sent an error event; one error frame written
    BackendError(String),
    /// An event could not be transcoded; backend cancelled
    TranscodeError(String),
    /// A write failed or the body was dropped; backend cancelled
    ClientDisconnected,
    /// Cancelled by some other party while the client was still there
    Cancelled,
    /// The relay panicked; recovered at the task boundary
    Panicked(String),
}

impl RelayOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RelayOutcome::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::BackendError(_) => "backend_error",
            RelayOutcome::TranscodeError(_) => "transcode_error",
            RelayOutcome::ClientDisconnected => "client_disconnected",
            RelayOutcome::Cancelled => "cancelled",
            RelayOutcome::Panicked(_) => "panicked",
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            RelayOutcome::Completed => None,
            RelayOutcome::BackendError(msg)
            | RelayOutcome::TranscodeError(msg)
            | RelayOutcome::Panicked(msg) => Some(msg.clone()),
            RelayOutcome::ClientDisconnected => Some("client disconnected".to_string()),
            RelayOutcome::Cancelled => Some("cancelled".to_string()),
        }
    }
}

enum Step {
    Event(Option<InternalEvent>),
    Cancelled,
}

/// Per-request relay state. One instance drives exactly one stream.
pub struct StreamRelay {
    transcoder: Box<dyn Transcoder>,
    cancel: StreamCancelHandle,
    frames_written: u64,
    first_frame_at: Option<Instant>,
}

impl StreamRelay {
    pub fn new(transcoder: Box<dyn Transcoder>, cancel: StreamCancelHandle) -> Self {
        Self {
            transcoder,
            cancel,
            frames_written: 0,
            first_frame_at: None,
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.transcoder.request_type()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// When the first frame was accepted by the sink.
    pub fn first_frame_at(&self) -> Option<Instant> {
        self.first_frame_at
    }

    /// Protocol error frame for an arbitrary error.
    pub fn error_frame(&self, error: &BackendError) -> SseFrame {
        self.transcoder.error_frame(error)
    }

    async fn write_frame<S>(&mut self, frame: &SseFrame, sink: &mut S) -> Result<(), SinkError>
    where
        S: FrameSink + ?Sized,
    {
        sink.write(frame.encode()).await?;
        sink.flush().await?;
        self.frames_written += 1;
        self.first_frame_at.get_or_insert_with(Instant::now);
        Ok(())
    }

    async fn write_all<S>(&mut self, frames: &[SseFrame], sink: &mut S) -> Result<(), SinkError>
    where
        S: FrameSink + ?Sized,
    {
        for frame in frames {
            self.write_frame(frame, sink).await?;
        }
        Ok(())
    }

    fn disconnected(&self, error: &SinkError) -> RelayOutcome {
        self.cancel.cancel();
        tracing::info!(
            frames = self.frames_written,
            "Client disconnected during stream: {}",
            error
        );
        RelayOutcome::ClientDisconnected
    }

    async fn transcode_failed<S>(&mut self, reason: String, sink: &mut S) -> RelayOutcome
    where
        S: FrameSink + ?Sized,
    {
        self.cancel.cancel();
        tracing::error!(
            protocol = %self.request_type(),
            frames = self.frames_written,
            "Transcoding failed: {}",
            reason
        );
        let frame = self.error_frame(
            &BackendError::new(format!("Failed to transcode backend output: {}", reason))
                .with_type("api_error"),
        );
        if let Err(e) = self.write_frame(&frame, sink).await {
            tracing::info!("Could not deliver transcode error frame: {}", e);
        }
        RelayOutcome::TranscodeError(reason)
    }

    /// Relay `events` to `sink` until the backend is exhausted, an error ends
    /// the stream, a write fails, or cancellation is observed.
    pub async fn run<E, S>(&mut self, mut events: E, sink: &mut S) -> RelayOutcome
    where
        E: Stream<Item = InternalEvent> + Unpin + Send,
        S: FrameSink + ?Sized,
    {
        let cancel = self.cancel.clone();

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                event = events.next() => Step::Event(event),
            };

            let event = match step {
                Step::Cancelled => {
                    return if sink.is_closed() {
                        tracing::info!(frames = self.frames_written, "Client went away; stream cancelled");
                        RelayOutcome::ClientDisconnected
                    } else {
                        tracing::info!(frames = self.frames_written, "Stream cancelled");
                        RelayOutcome::Cancelled
                    };
                }
                Step::Event(None) => break,
                Step::Event(Some(event)) => event,
            };

            if let Some(error) = &event.error {
                tracing::warn!(
                    protocol = %self.request_type(),
                    error_type = %error.error_type,
                    "Backend stream error: {}",
                    error.message
                );
                // Attempt the error frame; a failed write only changes the classification
                let frame = self.transcoder.error_frame(error);
                if let Err(e) = self.write_frame(&frame, sink).await {
                    return self.disconnected(&e);
                }
                return RelayOutcome::BackendError(error.message.clone());
            }

            let frames = match self.transcoder.transcode(&event) {
                Ok(frames) => frames,
                Err(e) => return self.transcode_failed(e.to_string(), sink).await,
            };
            if let Err(e) = self.write_all(&frames, sink).await {
                return self.disconnected(&e);
            }
        }

        let closing = match self.transcoder.finish() {
            Ok(frames) => frames,
            Err(e) => return self.transcode_failed(e.to_string(), sink).await,
        };
        if let Err(e) = self.write_all(&closing, sink).await {
            return self.disconnected(&e);
        }
        if let Some(done) = self.transcoder.done_sentinel() {
            if let Err(e) = self.write_frame(&done, sink).await {
                return self.disconnected(&e);
            }
        }

        self.cancel.mark_completed();
        RelayOutcome::Completed
    }
}

/// Request facts the relay task needs for logging and accounting.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub request_type: RequestType,
    pub model: String,
    pub platform: String,
    pub started: Instant,
    pub request: RequestContext,
}

/// Shared services the relay task reports to.
#[derive(Clone)]
pub struct RelayServices {
    pub metrics: Arc<Metrics>,
    pub logger: Arc<RequestLogger>,
}

/// Run a relay on its own task.
///
/// The task owns `guard`; it is dropped when the task ends, on every outcome
/// including a panic inside the relay.
pub fn spawn_relay<S>(
    events: EventStream,
    mut sink: S,
    guard: ConnectionGuard,
    ctx: RelayContext,
    services: RelayServices,
) -> JoinHandle<RelayOutcome>
where
    S: FrameSink + 'static,
{
    let request_id = ctx.request_id.clone();
    tokio::spawn(REQUEST_ID.scope(request_id, async move {
        let _guard = guard;
        let cancel = events.cancel_handle();
        let mut relay = StreamRelay::new(transcoder_for(ctx.request_type), cancel.clone());

        let result = AssertUnwindSafe(relay.run(events, &mut sink))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let backtrace = take_panic_backtrace();
                tracing::error!(
                    method = %ctx.request.method,
                    path = %ctx.request.path,
                    body = %ctx.request.body,
                    "Stream relay panicked: {}\n{}",
                    message,
                    backtrace
                );
                cancel.cancel();
                let frame = relay.error_frame(
                    &BackendError::new("Internal server error").with_type("api_error"),
                );
                if sink.write(frame.encode()).await.is_ok() {
                    let _ = sink.flush().await;
                }
                RelayOutcome::Panicked(message)
            }
        };

        report(&ctx, &services, &relay, &outcome);
        outcome
    }))
}

fn report(ctx: &RelayContext, services: &RelayServices, relay: &StreamRelay, outcome: &RelayOutcome) {
    let request_type = ctx.request_type.as_str();
    let first_byte = relay
        .first_frame_at()
        .map(|at| at.saturating_duration_since(ctx.started));

    services.metrics.record_request(request_type, true, outcome.label());
    services
        .metrics
        .stream_frames
        .with_label_values(&[request_type])
        .inc_by(relay.frames_written());
    if let Some(latency) = first_byte {
        services.metrics.observe_first_byte(request_type, latency.as_secs_f64());
    }

    let duration_ms = ctx.started.elapsed().as_millis() as u64;
    services.logger.log(RequestLogEntry {
        request_id: ctx.request_id.clone(),
        model: ctx.model.clone(),
        platform: ctx.platform.clone(),
        request_type: ctx.request_type,
        is_stream: true,
        success: outcome.is_success(),
        first_byte_ms: first_byte.map(|d| d.as_millis() as u64),
        duration_ms,
        error_message: outcome.error_message(),
        ..Default::default()
    });

    tracing::debug!(
        model = %ctx.model,
        protocol = %ctx.request_type,
        outcome = outcome.label(),
        frames = relay.frames_written(),
        duration_ms,
        "Stream finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::{FinishReason, SseFrame};

    fn events(texts: &[&str]) -> EventStream {
        let mut list: Vec<InternalEvent> = texts
            .iter()
            .map(|t| InternalEvent::text("c1", "m", *t))
            .collect();
        list.push(InternalEvent::finish("c1", "m", FinishReason::Stop));
        EventStream::from_events(list)
    }

    #[tokio::test]
    async fn test_chat_stream_ends_with_done() {
        let stream = events(&["a", "b"]);
        let mut relay = StreamRelay::new(
            transcoder_for(RequestType::ChatCompletions),
            stream.cancel_handle(),
        );
        let mut sink = MemorySink::new();
        let outcome = relay.run(stream, &mut sink).await;

        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(sink.frames.len(), 4);
        assert_eq!(sink.flushes, 4);
        assert_eq!(sink.frames.last().unwrap(), &SseFrame::done().encode());
        assert!(relay.first_frame_at().is_some());
    }

    #[tokio::test]
    async fn test_messages_stream_has_no_done() {
        let stream = events(&["a"]);
        let mut relay =
            StreamRelay::new(transcoder_for(RequestType::Messages), stream.cancel_handle());
        let mut sink = MemorySink::new();
        assert_eq!(relay.run(stream, &mut sink).await, RelayOutcome::Completed);
        let text = sink.text();
        assert!(!text.contains("[DONE]"));
        assert!(text.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
    }

    #[tokio::test]
    async fn test_cancel_before_first_event() {
        let stream = EventStream::new(
            Box::pin(futures::stream::pending::<InternalEvent>()),
            StreamCancelHandle::new(),
        );
        let handle = stream.cancel_handle();
        let mut relay = StreamRelay::new(transcoder_for(RequestType::ChatCompletions), handle.clone());
        let mut sink = MemorySink::new();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            handle.cancel();
        });
        let outcome = relay.run(stream, &mut sink).await;
        canceller.await.unwrap();

        assert_eq!(outcome, RelayOutcome::Cancelled);
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn test_outcome_labels() {
        assert!(RelayOutcome::Completed.is_success());
        assert!(!RelayOutcome::Cancelled.is_success());
        assert_eq!(RelayOutcome::Panicked("x".into()).label(), "panicked");
        assert_eq!(
            RelayOutcome::BackendError("boom".into()).error_message().as_deref(),
            Some("boom")
        );
        assert_eq!(RelayOutcome::Completed.error_message(), None);
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed_receiver() {
        let (mut sink, body) = ChannelSink::channel(4);
        sink.write(Bytes::from("data: 1\n\n")).await.unwrap();
        assert!(!sink.is_closed());
        drop(body);
        assert!(sink.is_closed());
        assert_eq!(sink.write(Bytes::from("x")).await, Err(SinkError::Closed));
        assert_eq!(sink.flush().await, Err(SinkError::Closed));
    }
}
