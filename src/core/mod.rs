//! Core functionality for the relay server.
//!
//! This module contains fundamental components used throughout the application:
//! - Connection accounting and stream cancellation
//! - Configuration management
//! - Error handling
//! - Metrics collection and the request log
//! - HTTP middleware

pub mod accountant;
pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod request_log;

// Re-export commonly used types
pub use accountant::{ConnectionAccountant, ConnectionGuard};
pub use cancel::StreamCancelHandle;
pub use config::AppConfig;
pub use error::{AppError, Result};
pub use logging::{generate_request_id, get_request_id, REQUEST_ID};
pub use metrics::Metrics;
pub use middleware::{
    admin_logging_middleware, catch_panic, request_id_middleware, RequestContext,
};
pub use request_log::{InMemoryRequestLogStore, RequestLogEntry, RequestLogStore, RequestLogger};
