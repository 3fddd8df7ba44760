//! Auth gate for business and admin endpoints.
//!
//! Tokens are accepted from `Authorization: Bearer` (OpenAI style) or
//! `x-api-key` (Anthropic style) and compared by SHA-256 digest.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};

use crate::core::config::AuthConfig;
use crate::core::error::{AppError, Result};

/// Hash an API key using SHA-256.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract Bearer token from Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Token presented by the client; x-api-key takes priority.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| extract_bearer(headers).filter(|t| !t.is_empty()))
}

/// Hashed token sets, built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    business: Vec<String>,
    admin: Option<String>,
}

impl AuthGate {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            business: config.api_keys.iter().map(|k| hash_key(k)).collect(),
            admin: config.admin_key.as_deref().map(hash_key),
        }
    }

    /// Business endpoints are open when no business tokens are configured.
    /// The admin token is accepted as well.
    pub fn check_business(&self, headers: &HeaderMap) -> Result<()> {
        if self.business.is_empty() {
            return Ok(());
        }
        let digest = extract_token(headers)
            .map(hash_key)
            .ok_or(AppError::Unauthorized)?;
        if self.business.contains(&digest) || self.admin.as_ref() == Some(&digest) {
            Ok(())
        } else {
            Err(AppError::Unauthorized)
        }
    }

    /// Admin endpoints are disabled when no admin token is configured.
    pub fn check_admin(&self, headers: &HeaderMap) -> Result<()> {
        let expected = self.admin.as_ref().ok_or(AppError::Unauthorized)?;
        let digest = extract_token(headers)
            .map(hash_key)
            .ok_or(AppError::Unauthorized)?;
        if &digest == expected {
            Ok(())
        } else {
            Err(AppError::Unauthorized)
        }
    }
}

/// Gate business endpoints. Rejections use the envelope of the endpoint's protocol.
pub async fn business_auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(e) = gate.check_business(request.headers()) {
        tracing::debug!(path = %request.uri().path(), "Rejected business request");
        return e.into_response_for_path(request.uri().path());
    }
    next.run(request).await
}

/// Gate operator endpoints.
pub async fn admin_auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(e) = gate.check_admin(request.headers()) {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request");
        return e.into_response_for_path(request.uri().path());
    }
    next.run(request).await
}
