use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Handle for cancelling backend work when a stream must stop early.
///
/// Cloned into every party that may trigger or observe cancellation: the relay,
/// the response body wrapper and the backend producer.
#[derive(Clone)]
pub struct StreamCancelHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    /// Set once the stream ended normally; later cancel calls are no-ops
    completed: Arc<AtomicBool>,
    /// Number of cancel calls that actually signalled the producer
    signals: Arc<AtomicUsize>,
}

impl StreamCancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            completed: Arc::new(AtomicBool::new(false)),
            signals: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mark the stream as completed normally.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Signal cancellation (only if not already completed).
    ///
    /// Never blocks and never waits for the producer to acknowledge.
    pub fn cancel(&self) {
        if self.is_completed() {
            return;
        }
        let first = self.sender.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
        if first {
            self.signals.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// How many times cancellation transitioned from "running" to "cancelled" (0 or 1).
    pub fn signal_count(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }

    /// Get a receiver for use in select!
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }

    /// Resolve once cancellation has been signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.subscribe();
        // wait_for checks the current value first
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for StreamCancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
