//! LLM Relay - streaming protocol relay for LLM backends
//!
//! This library turns one protocol-neutral stream of generation events into
//! the Server-Sent-Event dialects clients expect:
//!
//! - **OpenAI chat completions** (`/v1/chat/completions`)
//! - **OpenAI responses** (`/v1/responses`)
//! - **Anthropic messages** (`/v1/messages`)
//!
//! Around the relay it keeps exactly-once connection accounting, contains
//! panics per request, propagates client disconnects to the backend, and
//! serves request statistics to operators.
//!
//! # Architecture
//!
//! - [`transformer`]: the internal event model and one transcoder per protocol
//! - [`api`]: HTTP handlers, auth, the stream relay and the operator API
//! - [`services`]: the backend boundary, the upstream client and stats queries
//! - [`core`]: config, errors, logging, metrics, accounting and middleware
//!
//! # Configuration
//!
//! Every setting has a default. `CONFIG_PATH` points at an optional YAML file;
//! environment variables such as `PORT`, `UPSTREAM_BASE_URL`, `API_KEYS` and
//! `ADMIN_KEY` override it.

pub mod api;
pub mod core;
pub mod services;
pub mod transformer;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState, RelayOutcome, StreamRelay};
pub use core::{AppConfig, AppError, ConnectionAccountant, Result, StreamCancelHandle};
pub use services::{EventStream, GenerationBackend, GenerationRequest, StatsService, UpstreamBackend};
pub use transformer::{InternalEvent, RequestType, Transcoder};
