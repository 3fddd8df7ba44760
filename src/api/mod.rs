//! API layer for the relay server.
//!
//! This module contains the HTTP handlers, the auth gate, protocol request
//! models, the operator stats endpoints and the streaming relay.

pub mod auth;
pub mod disconnect;
pub mod handlers;
pub mod models;
pub mod relay;
pub mod stats;

// Re-export commonly used types
pub use auth::AuthGate;
pub use disconnect::DisconnectStream;
pub use handlers::{build_router, health, metrics_handler, AppState};
pub use models::{parse_generation_request, ChatCompletionRequest, MessagesRequest, ResponsesRequest};
pub use relay::{
    spawn_relay, ChannelSink, FrameSink, MemorySink, RelayContext, RelayOutcome, RelayServices,
    SinkError, StreamRelay,
};
pub use stats::StatsApiDoc;
