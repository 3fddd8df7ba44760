//! HTTP request handlers for the relay API.
//!
//! The three business endpoints share one flow: parse the protocol body,
//! ask the backend for a reply, then either render a single JSON response or
//! hand the event stream to a spawned [`StreamRelay`](crate::api::relay::StreamRelay).

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::auth::{admin_auth_middleware, business_auth_middleware, AuthGate};
use crate::api::disconnect::DisconnectStream;
use crate::api::models::parse_generation_request;
use crate::api::relay::{spawn_relay, ChannelSink, RelayContext, RelayServices};
use crate::api::stats::{request_logs, stats_overview, stats_rank, stats_realtime, StatsApiDoc};
use crate::core::accountant::{ConnectionAccountant, ConnectionGuard};
use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};
use crate::core::logging::{generate_request_id, get_request_id};
use crate::core::metrics::Metrics;
use crate::core::middleware::{
    admin_logging_middleware, catch_panic, request_id_middleware, RequestContext,
};
use crate::core::request_log::{RequestLogEntry, RequestLogStore, RequestLogger};
use crate::services::backend::{BackendReply, EventStream, GenerationBackend};
use crate::services::stats::StatsService;
use crate::transformer::{render_response, RequestType};

/// Shared application state.
pub struct AppState {
    pub backend: Arc<dyn GenerationBackend>,
    pub accountant: Arc<ConnectionAccountant>,
    pub metrics: Arc<Metrics>,
    pub logger: Arc<RequestLogger>,
    pub stats: Arc<StatsService>,
    pub auth: Arc<AuthGate>,
    /// Frames buffered between a relay task and its response body
    pub stream_buffer: usize,
}

impl AppState {
    /// Wire up every component from configuration. Spawns the request log
    /// writer, so it must run inside a tokio runtime.
    pub fn from_config(
        config: &AppConfig,
        backend: Arc<dyn GenerationBackend>,
        store: Arc<dyn RequestLogStore>,
    ) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| AppError::Internal(format!("Failed to register metrics: {}", e)))?;
        let accountant = Arc::new(ConnectionAccountant::with_horizon(Duration::from_secs(
            config.stats.rate_window_secs,
        )));
        let logger = RequestLogger::new(store.clone(), &config.request_log);
        let stats = StatsService::new(store, accountant.clone(), &config.stats);

        Ok(Self {
            backend,
            accountant,
            metrics: Arc::new(metrics),
            logger: Arc::new(logger),
            stats: Arc::new(stats),
            auth: Arc::new(AuthGate::from_config(&config.auth)),
            stream_buffer: config.stream.buffer,
        })
    }
}

/// Handle OpenAI chat completion requests.
pub async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    relay_request(state, RequestType::ChatCompletions, body).await
}

/// Handle OpenAI responses requests.
pub async fn responses(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    relay_request(state, RequestType::Responses, body).await
}

/// Handle Anthropic messages requests.
pub async fn messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    relay_request(state, RequestType::Messages, body).await
}

/// Bookkeeping for one business request that ends without a relay task.
struct Finished<'a> {
    state: &'a AppState,
    request_id: String,
    request_type: RequestType,
    model: String,
    is_stream: bool,
    started: Instant,
}

impl Finished<'_> {
    fn record(&self, success: bool, outcome: &str, error_message: Option<String>) {
        let elapsed = self.started.elapsed();
        let request_type = self.request_type.as_str();
        self.state
            .metrics
            .record_request(request_type, self.is_stream, outcome);
        if success {
            self.state
                .metrics
                .observe_first_byte(request_type, elapsed.as_secs_f64());
        }
        self.state.logger.log(RequestLogEntry {
            request_id: self.request_id.clone(),
            model: self.model.clone(),
            platform: self.state.backend.platform().to_string(),
            request_type: self.request_type,
            is_stream: self.is_stream,
            success,
            first_byte_ms: success.then(|| elapsed.as_millis() as u64),
            duration_ms: elapsed.as_millis() as u64,
            error_message,
            ..Default::default()
        });
    }

    fn fail(&self, error: AppError) -> Response {
        let outcome = outcome_label(&error);
        match &error {
            AppError::BadRequest(msg) => tracing::info!(model = %self.model, "Rejected request: {}", msg),
            AppError::Backend(err) => {
                tracing::warn!(model = %self.model, error_type = %err.error_type, "Backend error: {}", err.message)
            }
            other => tracing::error!(model = %self.model, "Request failed: {}", other),
        }
        self.record(false, outcome, Some(error.to_string()));
        error.into_protocol_response(self.request_type)
    }
}

fn outcome_label(error: &AppError) -> &'static str {
    match error {
        AppError::BadRequest(_) => "bad_request",
        AppError::Unauthorized => "unauthorized",
        AppError::Backend(_) | AppError::Request(_) => "backend_error",
        AppError::Transcode(_) => "transcode_error",
        AppError::Timeout => "timeout",
        _ => "internal_error",
    }
}

#[tracing::instrument(skip(state, body), fields(request_type = %request_type))]
async fn relay_request(state: Arc<AppState>, request_type: RequestType, body: Bytes) -> Response {
    let guard = state.accountant.begin();
    let started = Instant::now();
    let request_id = match get_request_id() {
        id if id.is_empty() => generate_request_id(),
        id => id,
    };

    let mut finished = Finished {
        state: &state,
        request_id: request_id.clone(),
        request_type,
        model: String::new(),
        is_stream: false,
        started,
    };

    let request = match parse_generation_request(request_type, &body) {
        Ok(request) => request,
        Err(e) => return finished.fail(e),
    };
    finished.model = request.model.clone();
    finished.is_stream = request.stream;

    tracing::debug!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "Processing request"
    );

    let reply = match state.backend.generate(request).await {
        Ok(reply) => reply,
        Err(e) => return finished.fail(e),
    };

    match reply {
        BackendReply::Single(response) => {
            let body = render_response(request_type, &response);
            finished.record(true, "completed", None);
            (StatusCode::OK, Json(body)).into_response()
        }
        BackendReply::Stream(events) => {
            let context = RelayContext {
                request_id,
                request_type,
                model: finished.model.clone(),
                platform: state.backend.platform().to_string(),
                started,
                request: RequestContext::new("POST", request_path(request_type), &body),
            };
            stream_response(&state, events, guard, context)
        }
    }
}

fn request_path(request_type: RequestType) -> &'static str {
    match request_type {
        RequestType::ChatCompletions => "/v1/chat/completions",
        RequestType::Responses => "/v1/responses",
        RequestType::Messages => "/v1/messages",
    }
}

fn stream_response(
    state: &AppState,
    events: EventStream,
    guard: ConnectionGuard,
    context: RelayContext,
) -> Response {
    let (sink, body) = ChannelSink::channel(state.stream_buffer);
    let body = DisconnectStream::new(body, events.cancel_handle());

    spawn_relay(
        events,
        sink,
        guard,
        context,
        RelayServices {
            metrics: state.metrics.clone(),
            logger: state.logger.clone(),
        },
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(body))
        .unwrap_or_else(|e| {
            tracing::error!("Failed to build SSE response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Liveness probe.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "active_connections": state.accountant.current_active_connections(),
    }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    state
        .metrics
        .active_connections
        .set(state.accountant.current_active_connections() as i64);

    match state.metrics.encode() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let business = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            business_auth_middleware,
        ));

    let admin = Router::new()
        .route("/admin/stats/overview", get(stats_overview))
        .route("/admin/stats/realtime", get(stats_realtime))
        .route("/admin/stats/rank", get(stats_rank))
        .route("/admin/logs", get(request_logs))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            admin_auth_middleware,
        ))
        .layer(middleware::from_fn(admin_logging_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .merge(business)
        .merge(admin)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", StatsApiDoc::openapi()))
        .layer(middleware::from_fn(catch_panic))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&AppError::BadRequest("x".into())), "bad_request");
        assert_eq!(outcome_label(&AppError::Timeout), "timeout");
        assert_eq!(outcome_label(&AppError::Internal("x".into())), "internal_error");
    }

    #[test]
    fn test_request_path_round_trips() {
        for rt in [
            RequestType::ChatCompletions,
            RequestType::Responses,
            RequestType::Messages,
        ] {
            assert_eq!(
                crate::core::middleware::request_type_for_path(request_path(rt)),
                Some(rt)
            );
        }
    }
}
