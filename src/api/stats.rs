//! Operator statistics endpoints.
//!
//! All endpoints are read-only and require the admin token.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::api::handlers::AppState;
use crate::core::error::Result;
use crate::core::request_log::RequestLogEntry;
use crate::services::stats::{
    LogPage, LogQuery, OverviewStats, RankDimension, RankItem, RealtimeStats,
};

/// OpenAPI documentation for the operator API
#[derive(OpenApi)]
#[openapi(
    paths(stats_overview, stats_realtime, stats_rank, request_logs),
    components(schemas(
        OverviewStats,
        RealtimeStats,
        RankItem,
        RankDimension,
        RankResponse,
        LogPage,
        RequestLogEntry,
        StatsErrorResponse,
    )),
    tags((name = "stats", description = "Request statistics and logs")),
    security(("bearer_auth" = [])),
    modifiers(&SecurityAddon),
    info(
        title = "LLM Relay Operator API",
        description = "Read-only statistics over relayed requests."
    )
)]
pub struct StatsApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            );
        }
    }
}

/// Error body returned by the operator API (OpenAI error envelope)
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"error": {"message": "Unauthorized", "type": "authentication_error", "code": 401}}))]
pub struct StatsErrorResponse {
    #[schema(value_type = Object)]
    pub error: serde_json::Value,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DurationQuery {
    /// Window length such as `30m`, `24h` or `7d` (default `24h`)
    pub duration: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RankQuery {
    /// `model` (default) or `platform`
    pub dimension: Option<String>,
    /// Window length (default `24h`)
    pub duration: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RankResponse {
    pub dimension: RankDimension,
    pub items: Vec<RankItem>,
}

/// Request totals for a time window
#[utoipa::path(
    get,
    path = "/admin/stats/overview",
    tag = "stats",
    params(DurationQuery),
    responses(
        (status = 200, description = "Overview for the window", body = OverviewStats),
        (status = 400, description = "Invalid duration", body = StatsErrorResponse),
        (status = 401, description = "Unauthorized", body = StatsErrorResponse)
    )
)]
pub async fn stats_overview(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DurationQuery>,
) -> Result<Json<OverviewStats>> {
    let overview = state.stats.overview(query.duration.as_deref()).await?;
    Ok(Json(overview))
}

/// Live connection figures
#[utoipa::path(
    get,
    path = "/admin/stats/realtime",
    tag = "stats",
    responses(
        (status = 200, description = "Current figures", body = RealtimeStats),
        (status = 401, description = "Unauthorized", body = StatsErrorResponse)
    )
)]
pub async fn stats_realtime(State(state): State<Arc<AppState>>) -> Json<RealtimeStats> {
    Json(state.stats.realtime())
}

/// Busiest models or platforms
#[utoipa::path(
    get,
    path = "/admin/stats/rank",
    tag = "stats",
    params(RankQuery),
    responses(
        (status = 200, description = "Top ten by request count", body = RankResponse),
        (status = 400, description = "Invalid dimension or duration", body = StatsErrorResponse),
        (status = 401, description = "Unauthorized", body = StatsErrorResponse)
    )
)]
pub async fn stats_rank(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RankQuery>,
) -> Result<Json<RankResponse>> {
    let dimension = match query.dimension.as_deref() {
        Some(raw) => raw.parse::<RankDimension>()?,
        None => RankDimension::default(),
    };
    let items = state.stats.rank(query.duration.as_deref(), dimension).await?;
    Ok(Json(RankResponse { dimension, items }))
}

/// Paginated request log, newest first
#[utoipa::path(
    get,
    path = "/admin/logs",
    tag = "stats",
    params(LogQuery),
    responses(
        (status = 200, description = "One page of log entries", body = LogPage),
        (status = 400, description = "Invalid filter", body = StatsErrorResponse),
        (status = 401, description = "Unauthorized", body = StatsErrorResponse)
    )
)]
pub async fn request_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>> {
    let page = state.stats.logs(&query).await?;
    Ok(Json(page))
}
