//! Completed-request log.
//!
//! Request handlers hand finished [`RequestLogEntry`] records to the
//! [`RequestLogger`], which queues them on a bounded channel and writes them
//! in batches to a [`RequestLogStore`]. The store is the source of truth for
//! the stats service.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use utoipa::ToSchema;

use crate::core::config::RequestLogConfig;
use crate::transformer::RequestType;

/// One completed request. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RequestLogEntry {
    /// Store-assigned sequence id
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub model: String,
    pub platform: String,
    #[schema(value_type = String, example = "chat_completions")]
    pub request_type: RequestType,
    pub is_stream: bool,
    pub success: bool,
    /// Milliseconds from request start to the first byte sent; absent when
    /// nothing was ever sent
    pub first_byte_ms: Option<u64>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

impl Default for RequestLogEntry {
    fn default() -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            request_id: String::new(),
            model: String::new(),
            platform: String::new(),
            request_type: RequestType::default(),
            is_stream: false,
            success: false,
            first_byte_ms: None,
            duration_ms: 0,
            error_message: None,
        }
    }
}

/// Append-only storage for request log entries.
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn append_batch(&self, entries: Vec<RequestLogEntry>);

    /// Entries with `start <= timestamp <= end`; open bounds are unbounded.
    async fn entries_between(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<RequestLogEntry>;

    async fn count(&self) -> usize;
}

/// Capacity-bounded in-memory store; the oldest entries are evicted first.
pub struct InMemoryRequestLogStore {
    entries: RwLock<VecDeque<RequestLogEntry>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl InMemoryRequestLogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Synchronous append, used to seed fixtures.
    pub fn push(&self, mut entry: RequestLogEntry) {
        entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

#[async_trait]
impl RequestLogStore for InMemoryRequestLogStore {
    async fn append_batch(&self, entries: Vec<RequestLogEntry>) {
        for entry in entries {
            self.push(entry);
        }
    }

    async fn entries_between(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<RequestLogEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| start.map_or(true, |s| e.timestamp >= s))
            .filter(|e| end.map_or(true, |t| e.timestamp <= t))
            .cloned()
            .collect()
    }

    async fn count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

enum LogCommand {
    Record(Box<RequestLogEntry>),
    Flush(oneshot::Sender<()>),
}

/// Batching front-end for a [`RequestLogStore`].
pub struct RequestLogger {
    tx: mpsc::Sender<LogCommand>,
}

impl RequestLogger {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn RequestLogStore>, config: &RequestLogConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        tokio::spawn(Self::writer_task(
            rx,
            store,
            config.batch_size.max(1),
            Duration::from_millis(config.flush_interval_ms.max(1)),
        ));
        Self { tx }
    }

    /// Queue an entry. Never blocks; drops the entry when the queue is full.
    pub fn log(&self, entry: RequestLogEntry) {
        if let Err(e) = self.tx.try_send(LogCommand::Record(Box::new(entry))) {
            tracing::warn!("Request log channel full, dropping record: {}", e);
        }
    }

    /// Wait until every entry queued before this call is in the store.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(ack_tx)).await.is_err() {
            tracing::warn!("Request logger writer task is gone; nothing to flush");
            return;
        }
        if tokio::time::timeout(Duration::from_secs(5), ack_rx).await.is_err() {
            tracing::warn!("Timed out waiting for request log flush");
        }
    }

    async fn writer_task(
        mut rx: mpsc::Receiver<LogCommand>,
        store: Arc<dyn RequestLogStore>,
        batch_size: usize,
        flush_interval: Duration,
    ) {
        let mut buffer: Vec<RequestLogEntry> = Vec::with_capacity(batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(LogCommand::Record(entry)) => {
                        buffer.push(*entry);
                        if buffer.len() >= batch_size {
                            Self::write(&*store, &mut buffer).await;
                        }
                    }
                    Some(LogCommand::Flush(ack)) => {
                        Self::write(&*store, &mut buffer).await;
                        let _ = ack.send(());
                    }
                    None => {
                        // Channel closed: flush remaining records
                        Self::write(&*store, &mut buffer).await;
                        break;
                    }
                },
                _ = interval.tick() => {
                    Self::write(&*store, &mut buffer).await;
                }
            }
        }

        tracing::info!("Request logger writer task stopped");
    }

    async fn write(store: &dyn RequestLogStore, buffer: &mut Vec<RequestLogEntry>) {
        if buffer.is_empty() {
            return;
        }
        let batch: Vec<RequestLogEntry> = buffer.drain(..).collect();
        tracing::trace!(count = batch.len(), "Writing request log batch");
        store.append_batch(batch).await;
    }
}
