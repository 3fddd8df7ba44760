//! Stats aggregation over a seeded request log.

use std::sync::Arc;

use chrono::{Duration, Utc};
use llm_relay::core::config::StatsConfig;
use llm_relay::core::{AppError, ConnectionAccountant, InMemoryRequestLogStore, RequestLogEntry};
use llm_relay::services::stats::{trimmed_mean, LogQuery, RankDimension, StatsService};
use llm_relay::transformer::RequestType;
use pretty_assertions::assert_eq;

fn service(store: Arc<InMemoryRequestLogStore>) -> StatsService {
    StatsService::new(
        store,
        Arc::new(ConnectionAccountant::new()),
        &StatsConfig::default(),
    )
}

fn entry(model: &str, success: bool, first_byte_ms: Option<u64>, minutes_ago: i64) -> RequestLogEntry {
    RequestLogEntry {
        timestamp: Utc::now() - Duration::minutes(minutes_ago),
        model: model.to_string(),
        platform: "default".to_string(),
        success,
        first_byte_ms,
        duration_ms: first_byte_ms.unwrap_or(0) + 10,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_overview_trimmed_mean_drops_tails() {
    let store = Arc::new(InMemoryRequestLogStore::new(1000));
    for i in 1..=100u64 {
        store.push(entry("m", true, Some(i * 10), 1));
    }
    let stats = service(store).overview(Some("1h")).await.unwrap();

    assert_eq!(stats.total, 100);
    assert_eq!(stats.latency_samples, 100);
    // mean of 110..=900 in steps of 10
    assert!((stats.avg_first_byte_ms - 505.0).abs() < 1e-9);
    assert_eq!(stats.success_rate, 1.0);
    assert_eq!(stats.duration, "1h");
}

#[tokio::test]
async fn test_overview_counts_failures_and_window() {
    let store = Arc::new(InMemoryRequestLogStore::new(100));
    store.push(entry("m", true, Some(100), 5));
    store.push(entry("m", false, None, 5));
    store.push(entry("m", false, None, 5));
    store.push(entry("m", true, Some(100), 5));
    // outside a one hour window
    store.push(entry("m", true, Some(100), 120));

    let stats = service(store).overview(Some("1h")).await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.success, 2);
    assert_eq!(stats.failure, 2);
    assert!((stats.success_rate - 0.5).abs() < 1e-9);
    assert_eq!(stats.latency_samples, 2);
}

#[tokio::test]
async fn test_overview_empty_window_is_zero() {
    let stats = service(Arc::new(InMemoryRequestLogStore::new(10)))
        .overview(None)
        .await
        .unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.success_rate, 0.0);
    assert_eq!(stats.avg_first_byte_ms, 0.0);
    assert_eq!(stats.duration, "24h");
}

#[tokio::test]
async fn test_overview_rejects_bad_duration() {
    let result = service(Arc::new(InMemoryRequestLogStore::new(10)))
        .overview(Some("soon"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_oversized_duration_is_bad_request() {
    let stats = service(Arc::new(InMemoryRequestLogStore::new(10)));
    // parses as a valid span but reaches before the earliest representable time
    let overview = stats.overview(Some("100000000d")).await;
    assert!(matches!(overview, Err(AppError::BadRequest(_))));

    let rank = stats.rank(Some("100000000d"), RankDimension::Model).await;
    assert!(matches!(rank, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn test_rank_shares_and_success_rates() {
    let store = Arc::new(InMemoryRequestLogStore::new(1000));
    for i in 0..70 {
        store.push(entry("model-a", i < 65, Some(50), 1));
    }
    for _ in 0..30 {
        store.push(entry("model-b", true, Some(50), 1));
    }

    let rank = service(store).rank(None, RankDimension::Model).await.unwrap();
    assert_eq!(rank.len(), 2);
    assert_eq!(rank[0].name, "model-a");
    assert_eq!(rank[0].count, 70);
    assert!((rank[0].share - 0.7).abs() < 1e-9);
    assert!((rank[0].success_rate - 65.0 / 70.0).abs() < 1e-9);
    assert_eq!(rank[1].name, "model-b");
    assert!((rank[1].share - 0.3).abs() < 1e-9);
    assert_eq!(rank[1].success_rate, 1.0);
}

#[tokio::test]
async fn test_rank_keeps_top_ten_with_name_tie_break() {
    let store = Arc::new(InMemoryRequestLogStore::new(1000));
    for m in 0..12 {
        store.push(entry(&format!("m{:02}", m), true, None, 1));
    }
    let rank = service(store).rank(Some("24h"), RankDimension::Model).await.unwrap();
    assert_eq!(rank.len(), 10);
    let names: Vec<&str> = rank.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names[0], "m00");
    assert_eq!(names[9], "m09");
}

#[tokio::test]
async fn test_rank_by_platform() {
    let store = Arc::new(InMemoryRequestLogStore::new(100));
    let mut e = entry("m", true, None, 1);
    e.platform = "east".to_string();
    store.push(e.clone());
    store.push(e);
    store.push(entry("m", true, None, 1));

    let rank = service(store).rank(None, RankDimension::Platform).await.unwrap();
    assert_eq!(rank[0].name, "east");
    assert_eq!(rank[0].count, 2);
    assert_eq!(rank[1].name, "default");
}

#[tokio::test]
async fn test_logs_pagination_newest_first() {
    let store = Arc::new(InMemoryRequestLogStore::new(100));
    for i in 0..25 {
        // entry i is i minutes old
        let mut e = entry("m", true, None, i);
        e.request_id = format!("req-{}", i);
        store.push(e);
    }
    let stats = service(store);

    let page2 = stats
        .logs(&LogQuery {
            page: Some(2),
            page_size: Some(10),
            ..Default::default()
        })
        .await
        .unwrap();
    let page3 = stats
        .logs(&LogQuery {
            page: Some(3),
            page_size: Some(10),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(page3.total, 25);
    assert_eq!(page3.items.len(), 5);
    assert_eq!(page2.items.len(), 10);
    let newest_on_3 = page3.items.first().unwrap().timestamp;
    let oldest_on_2 = page2.items.last().unwrap().timestamp;
    assert!(newest_on_3 < oldest_on_2);
    assert_eq!(page3.items.last().unwrap().request_id, "req-24");
}

#[tokio::test]
async fn test_logs_filters() {
    let store = Arc::new(InMemoryRequestLogStore::new(100));
    let mut messages = entry("claude", false, None, 1);
    messages.request_type = RequestType::Messages;
    store.push(messages);
    store.push(entry("gpt", true, None, 1));
    store.push(entry("gpt", false, None, 1));
    let stats = service(store);

    let failed = stats
        .logs(&LogQuery {
            success: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.total, 2);

    let by_type = stats
        .logs(&LogQuery {
            request_type: Some("messages".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_type.total, 1);
    assert_eq!(by_type.items[0].model, "claude");

    let by_model = stats
        .logs(&LogQuery {
            model: Some("gpt".to_string()),
            success: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_model.total, 1);
}

#[tokio::test]
async fn test_logs_rejects_inverted_range_and_clamps_page_size() {
    let stats = service(Arc::new(InMemoryRequestLogStore::new(10)));
    let err = stats
        .logs(&LogQuery {
            start: Some("2026-01-02T00:00:00Z".to_string()),
            end: Some("2026-01-01T00:00:00Z".to_string()),
            ..Default::default()
        })
        .await;
    assert!(err.is_err());

    let page = stats
        .logs(&LogQuery {
            page: Some(0),
            page_size: Some(1000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.page, 1);
    assert_eq!(page.page_size, 100);
}

#[test]
fn test_trimmed_mean_matches_plain_mean_without_trim() {
    let samples = [3.0, 1.0, 2.0];
    assert_eq!(trimmed_mean(&samples, 0.0, 0.0), 2.0);
}
