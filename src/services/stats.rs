//! Request statistics over the completed-request log.
//!
//! All queries are read-only. Latency averages use a trimmed mean so that
//! cold starts and timeouts do not dominate the figure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::core::accountant::ConnectionAccountant;
use crate::core::config::StatsConfig;
use crate::core::error::{AppError, Result};
use crate::core::request_log::{RequestLogEntry, RequestLogStore};
use crate::transformer::RequestType;

pub const DEFAULT_DURATION: &str = "24h";
pub const RANK_LIMIT: usize = 10;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OverviewStats {
    /// Window the figures cover, as requested (e.g. `24h`)
    pub duration: String,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    /// Fraction of successful requests in `[0, 1]`; 0 when there were none
    pub success_rate: f64,
    /// Trimmed-mean time to first byte in milliseconds
    pub avg_first_byte_ms: f64,
    /// Number of requests that carried a first-byte latency
    pub latency_samples: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RealtimeStats {
    pub active_connections: u64,
    pub requests_last_minute: u64,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RankDimension {
    #[default]
    Model,
    Platform,
}

impl std::str::FromStr for RankDimension {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "model" => Ok(RankDimension::Model),
            "platform" => Ok(RankDimension::Platform),
            other => Err(AppError::BadRequest(format!(
                "Unknown rank dimension '{}', expected model or platform",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RankItem {
    pub name: String,
    pub count: u64,
    pub success_rate: f64,
    /// Fraction of all requests in the window
    pub share: f64,
}

/// Filters and paging for the request log query.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LogQuery {
    /// Page number, starting at 1
    pub page: Option<u32>,
    /// Entries per page, 1 to 100 (default 20)
    pub page_size: Option<u32>,
    /// Inclusive lower time bound, RFC 3339 or unix seconds
    pub start: Option<String>,
    /// Inclusive upper time bound, RFC 3339 or unix seconds
    pub end: Option<String>,
    pub success: Option<bool>,
    /// chat_completions, responses or messages
    pub request_type: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LogPage {
    /// Entries matching the filters, across all pages
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub items: Vec<RequestLogEntry>,
}

pub struct StatsService {
    store: Arc<dyn RequestLogStore>,
    accountant: Arc<ConnectionAccountant>,
    trim_low: f64,
    trim_high: f64,
}

impl StatsService {
    pub fn new(
        store: Arc<dyn RequestLogStore>,
        accountant: Arc<ConnectionAccountant>,
        config: &StatsConfig,
    ) -> Self {
        Self {
            store,
            accountant,
            trim_low: config.trim_low,
            trim_high: config.trim_high,
        }
    }

    async fn window(&self, duration: &str) -> Result<Vec<RequestLogEntry>> {
        let span = parse_duration(duration)?;
        let since = Utc::now().checked_sub_signed(span).ok_or_else(|| {
            AppError::BadRequest(format!("Duration out of range: '{}'", duration))
        })?;
        Ok(self.store.entries_between(Some(since), None).await)
    }

    /// Totals, success rate and trimmed-mean first-byte latency for the window.
    pub async fn overview(&self, duration: Option<&str>) -> Result<OverviewStats> {
        let duration = duration.unwrap_or(DEFAULT_DURATION);
        let entries = self.window(duration).await?;

        let total = entries.len() as u64;
        let success = entries.iter().filter(|e| e.success).count() as u64;
        let samples: Vec<f64> = entries
            .iter()
            .filter_map(|e| e.first_byte_ms)
            .map(|ms| ms as f64)
            .collect();

        Ok(OverviewStats {
            duration: duration.to_string(),
            total,
            success,
            failure: total - success,
            success_rate: ratio(success, total),
            avg_first_byte_ms: trimmed_mean(&samples, self.trim_low, self.trim_high),
            latency_samples: samples.len() as u64,
        })
    }

    /// Live figures straight from the connection accountant.
    pub fn realtime(&self) -> RealtimeStats {
        RealtimeStats {
            active_connections: self.accountant.current_active_connections(),
            requests_last_minute: self.accountant.requests_in_last_minute(),
            total_requests: self.accountant.total_requests(),
        }
    }

    /// Top partitions by request count. Equal counts are ordered by name.
    pub async fn rank(&self, duration: Option<&str>, dimension: RankDimension) -> Result<Vec<RankItem>> {
        let entries = self.window(duration.unwrap_or(DEFAULT_DURATION)).await?;
        Ok(rank_entries(&entries, dimension))
    }

    /// Filtered request log, newest first.
    pub async fn logs(&self, query: &LogQuery) -> Result<LogPage> {
        let start = query.start.as_deref().map(parse_time).transpose()?;
        let end = query.end.as_deref().map(parse_time).transpose()?;
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(AppError::BadRequest("start must not be after end".to_string()));
            }
        }
        let request_type = query
            .request_type
            .as_deref()
            .map(|rt| rt.parse::<RequestType>().map_err(AppError::BadRequest))
            .transpose()?;

        let mut entries: Vec<RequestLogEntry> = self
            .store
            .entries_between(start, end)
            .await
            .into_iter()
            .filter(|e| query.success.map_or(true, |s| e.success == s))
            .filter(|e| request_type.map_or(true, |rt| e.request_type == rt))
            .filter(|e| query.model.as_deref().map_or(true, |m| e.model == m))
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

        let page = query.page.unwrap_or(1).max(1);
        let page_size = query
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = (page as usize - 1).saturating_mul(page_size as usize);

        Ok(LogPage {
            total: entries.len() as u64,
            page,
            page_size,
            items: entries
                .into_iter()
                .skip(offset)
                .take(page_size as usize)
                .collect(),
        })
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Group entries by `dimension` and keep the ten busiest groups.
pub fn rank_entries(entries: &[RequestLogEntry], dimension: RankDimension) -> Vec<RankItem> {
    let mut groups: HashMap<&str, (u64, u64)> = HashMap::new();
    for entry in entries {
        let key = match dimension {
            RankDimension::Model => entry.model.as_str(),
            RankDimension::Platform => entry.platform.as_str(),
        };
        let slot = groups.entry(key).or_default();
        slot.0 += 1;
        if entry.success {
            slot.1 += 1;
        }
    }

    let total = entries.len() as u64;
    let mut items: Vec<RankItem> = groups
        .into_iter()
        .map(|(name, (count, success))| RankItem {
            name: name.to_string(),
            count,
            success_rate: ratio(success, count),
            share: ratio(count, total),
        })
        .collect();
    items.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    items.truncate(RANK_LIMIT);
    items
}

/// Mean of `samples` after dropping the lowest `low` and highest `high`
/// fractions. Returns 0 when nothing is left.
pub fn trimmed_mean(samples: &[f64], low: f64, high: f64) -> f64 {
    let n = samples.len();
    if n == 0 {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    // The epsilon keeps e.g. 100 * 0.1 from flooring to 9
    let drop_low = ((n as f64) * low.max(0.0) + 1e-9).floor() as usize;
    let drop_high = ((n as f64) * high.max(0.0) + 1e-9).floor() as usize;
    if drop_low + drop_high >= n {
        return 0.0;
    }

    let kept = &sorted[drop_low..n - drop_high];
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Parse a look-back window such as `90s`, `30m`, `1h`, `24h` or `7d`.
/// A bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return parse_duration(DEFAULT_DURATION);
    }
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => raw.split_at(pos),
        None => (raw, "s"),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid duration '{}'", raw)))?;
    if value <= 0 {
        return Err(AppError::BadRequest(format!("Duration must be positive: '{}'", raw)));
    }
    let duration = match unit {
        "s" => Duration::try_seconds(value),
        "m" => Duration::try_minutes(value),
        "h" => Duration::try_hours(value),
        "d" => Duration::try_days(value),
        _ => None,
    };
    duration.ok_or_else(|| AppError::BadRequest(format!("Invalid duration '{}'", raw)))
}

/// Parse an RFC 3339 timestamp or unix seconds.
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| AppError::BadRequest(format!("Invalid timestamp '{}'", raw)));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| AppError::BadRequest(format!("Invalid timestamp '{}'", raw)))
}
