//! HTTP middleware for request ids, panic recovery and admin request logging.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use std::time::Instant;

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use futures::FutureExt;

use crate::core::error::AppError;
use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::transformer::RequestType;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Largest request body `catch_panic` buffers.
const MAX_BUFFERED_BODY: usize = 8 * 1024 * 1024;

/// Body prefix kept in panic logs.
const LOGGED_BODY_PREFIX: usize = 2048;

/// Request method, path and (truncated) body, attached to panic logs.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: &[u8]) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: truncate_body(body),
        }
    }
}

/// Client protocol implied by a business endpoint path.
pub fn request_type_for_path(path: &str) -> Option<RequestType> {
    match path.trim_end_matches('/') {
        "/v1/chat/completions" => Some(RequestType::ChatCompletions),
        "/v1/responses" => Some(RequestType::Responses),
        "/v1/messages" => Some(RequestType::Messages),
        _ => None,
    }
}

/// Human-readable payload of a caught panic.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

thread_local! {
    /// Backtrace of the most recent panic on this thread, captured by the hook
    static LAST_PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records the panicking thread's backtrace.
///
/// A caught panic is unwound to the catch site on the same thread, so the
/// recovery code can pick up the trace with [`take_panic_backtrace`].
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            LAST_PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// Backtrace recorded for the last panic on this thread, or the current
/// stack when the hook is not installed.
pub fn take_panic_backtrace() -> String {
    LAST_PANIC_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string())
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= LOGGED_BODY_PREFIX {
        return text.into_owned();
    }
    let mut end = LOGGED_BODY_PREFIX;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} bytes total]", &text[..end], body.len())
}

/// Assign every request an id, scope it as the `REQUEST_ID` task-local and echo it back.
///
/// An incoming `x-request-id` is reused when it is a sane header value.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let mut response = REQUEST_ID.scope(request_id.clone(), next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Recover from panics raised while handling a request.
///
/// The body is buffered so that it can be logged next to the panic message
/// and backtrace. The client receives a 500 in its protocol's error envelope.
pub async fn catch_panic(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Failed to buffer request body: {}", e);
            return AppError::BadRequest("Request body too large or unreadable".to_string())
                .into_response_for_path(parts.uri.path());
        }
    };

    let context = RequestContext::new(parts.method.as_str(), parts.uri.path(), &bytes);
    let request = Request::from_parts(parts, Body::from(bytes));

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let backtrace = take_panic_backtrace();
            tracing::error!(
                method = %context.method,
                path = %context.path,
                body = %context.body,
                "Handler panicked: {}\n{}",
                message,
                backtrace
            );
            AppError::Internal("Internal server error".to_string())
                .into_response_for_path(&context.path)
        }
    }
}

impl AppError {
    /// Error response in the envelope of the protocol served at `path`.
    pub fn into_response_for_path(self, path: &str) -> Response {
        let request_type = request_type_for_path(path).unwrap_or_default();
        self.into_protocol_response(request_type)
    }
}

/// Middleware for logging admin API requests.
///
/// Logs method, path, response status and duration of every `/admin/*` call.
pub async fn admin_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();

    tracing::info!(
        "[Admin API] {} {} - status={} duration={:.3}s",
        method,
        path,
        status,
        duration
    );

    response
}
