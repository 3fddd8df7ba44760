//! Exactly-once connection accounting across every way a stream can end.

use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use futures::StreamExt;
use llm_relay::api::relay::{
    spawn_relay, ChannelSink, MemorySink, RelayContext, RelayOutcome, RelayServices,
};
use llm_relay::core::config::RequestLogConfig;
use llm_relay::core::middleware::RequestContext;
use llm_relay::core::{
    ConnectionAccountant, InMemoryRequestLogStore, Metrics, RequestLogStore, RequestLogger,
    StreamCancelHandle,
};
use llm_relay::services::EventStream;
use llm_relay::transformer::{BackendError, FinishReason, InternalEvent, RequestType};

#[derive(Clone, Copy, Debug)]
enum Scenario {
    Complete,
    BackendError,
    WriteFailure,
    Panic,
    Cancel,
}

const SCENARIOS: [Scenario; 5] = [
    Scenario::Complete,
    Scenario::BackendError,
    Scenario::WriteFailure,
    Scenario::Panic,
    Scenario::Cancel,
];

fn events_for(scenario: Scenario) -> EventStream {
    let text = || InternalEvent::text("id", "m", "tok");
    match scenario {
        Scenario::Complete | Scenario::WriteFailure => EventStream::from_events(vec![
            text(),
            text(),
            text(),
            InternalEvent::finish("id", "m", FinishReason::Stop),
        ]),
        Scenario::BackendError => EventStream::from_events(vec![
            text(),
            InternalEvent::error(BackendError::new("upstream failed")),
        ]),
        Scenario::Panic => EventStream::new(
            Box::pin(futures::stream::iter(vec![text()]).chain(futures::stream::poll_fn(
                |_| -> Poll<Option<InternalEvent>> { panic!("relay bug") },
            ))),
            StreamCancelHandle::new(),
        ),
        Scenario::Cancel => EventStream::new(
            Box::pin(futures::stream::pending()),
            StreamCancelHandle::new(),
        ),
    }
}

fn context(i: usize) -> RelayContext {
    RelayContext {
        request_id: format!("req-{}", i),
        request_type: RequestType::ChatCompletions,
        model: "m".to_string(),
        platform: "p".to_string(),
        started: Instant::now(),
        request: RequestContext::new("POST", "/v1/chat/completions", b"{}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_outcomes_return_to_baseline() {
    llm_relay::core::middleware::install_panic_hook();
    let accountant = Arc::new(ConnectionAccountant::new());
    let store = Arc::new(InMemoryRequestLogStore::new(1000));
    let logger = Arc::new(RequestLogger::new(store.clone(), &RequestLogConfig::default()));
    let services = RelayServices {
        metrics: Arc::new(Metrics::new().unwrap()),
        logger: logger.clone(),
    };

    let rounds = 20;
    let mut tasks = Vec::new();
    let mut cancels = Vec::new();
    for round in 0..rounds {
        for (k, scenario) in SCENARIOS.iter().enumerate() {
            let i = round * SCENARIOS.len() + k;
            let events = events_for(*scenario);
            if matches!(scenario, Scenario::Cancel) {
                cancels.push(events.cancel_handle());
            }
            let guard = accountant.begin();
            let task = match scenario {
                Scenario::WriteFailure => spawn_relay(
                    events,
                    MemorySink::failing_after(1),
                    guard,
                    context(i),
                    services.clone(),
                ),
                _ => {
                    // Dropping the body stream here would read as a disconnect,
                    // so keep it alive in the task list.
                    let (sink, body) = ChannelSink::channel(64);
                    let task = spawn_relay(events, sink, guard, context(i), services.clone());
                    tokio::spawn(async move {
                        let _ = body.collect::<Vec<_>>().await;
                    });
                    task
                }
            };
            tasks.push((*scenario, task));
        }
    }

    let total = (rounds * SCENARIOS.len()) as u64;
    assert_eq!(accountant.total_requests(), total);

    tokio::time::sleep(Duration::from_millis(20)).await;
    for handle in &cancels {
        handle.cancel();
    }

    for (scenario, task) in tasks {
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("every relay must finish")
            .expect("relay task must not panic");
        match scenario {
            Scenario::Complete => assert_eq!(outcome, RelayOutcome::Completed),
            Scenario::BackendError => assert_matches!(outcome, RelayOutcome::BackendError(_)),
            Scenario::WriteFailure => assert_eq!(outcome, RelayOutcome::ClientDisconnected),
            Scenario::Panic => assert_matches!(outcome, RelayOutcome::Panicked(_)),
            Scenario::Cancel => assert_eq!(outcome, RelayOutcome::Cancelled),
        }
    }

    assert_eq!(accountant.current_active_connections(), 0);
    assert_eq!(accountant.total_requests(), total);

    logger.flush().await;
    let entries = store.entries_between(None, None).await;
    assert_eq!(entries.len() as u64, total);
    assert_eq!(entries.iter().filter(|e| e.success).count(), rounds);
}

#[tokio::test]
async fn test_guard_released_when_task_aborted() {
    let accountant = Arc::new(ConnectionAccountant::new());
    let store = Arc::new(InMemoryRequestLogStore::new(10));
    let services = RelayServices {
        metrics: Arc::new(Metrics::new().unwrap()),
        logger: Arc::new(RequestLogger::new(store, &RequestLogConfig::default())),
    };

    let events = EventStream::new(Box::pin(futures::stream::pending()), StreamCancelHandle::new());
    let (sink, _body) = ChannelSink::channel(4);
    let task = spawn_relay(events, sink, accountant.begin(), context(0), services);
    assert_eq!(accountant.current_active_connections(), 1);

    task.abort();
    let _ = task.await;
    assert_eq!(accountant.current_active_connections(), 0);
}

#[test]
fn test_requests_in_window() {
    let accountant = Arc::new(ConnectionAccountant::with_horizon(Duration::from_millis(50)));
    for _ in 0..3 {
        drop(accountant.begin());
    }
    assert_eq!(accountant.requests_in_last_minute(), 3);
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(accountant.requests_in_last_minute(), 0);
    assert_eq!(accountant.total_requests(), 3);
}
