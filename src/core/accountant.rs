//! Process-wide connection accounting.
//!
//! [`ConnectionAccountant`] is constructed once at startup and shared through
//! the application state. Every accepted request takes a [`ConnectionGuard`];
//! dropping the guard is the only way the active-connection count goes down,
//! so each request decrements exactly once no matter how it ends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Soft cap on retained timestamps before a write-side prune kicks in.
const WINDOW_PRUNE_THRESHOLD: usize = 4096;

pub struct ConnectionAccountant {
    total_requests: AtomicU64,
    active_connections: AtomicI64,
    window: Mutex<VecDeque<Instant>>,
    horizon: Duration,
}

impl ConnectionAccountant {
    pub fn new() -> Self {
        Self::with_horizon(Duration::from_secs(60))
    }

    /// Create an accountant whose rolling rate covers `horizon`.
    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            window: Mutex::new(VecDeque::new()),
            horizon,
        }
    }

    /// Count a newly accepted request.
    pub fn record_request_start(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::SeqCst);

        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back(now);
        if window.len() > WINDOW_PRUNE_THRESHOLD {
            prune(&mut window, now, self.horizon);
        }
    }

    /// Release one active connection.
    ///
    /// Callers must pair this with exactly one [`record_request_start`](Self::record_request_start).
    /// Prefer [`begin`](Self::begin), which enforces the pairing.
    pub fn record_request_end(&self) {
        let previous = self.active_connections.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            tracing::error!(
                active = previous - 1,
                "Active connection count went negative; unpaired request end"
            );
        }
    }

    /// Start accounting for a request and return the guard that ends it.
    pub fn begin(self: &Arc<Self>) -> ConnectionGuard {
        self.record_request_start();
        ConnectionGuard {
            accountant: Arc::clone(self),
        }
    }

    pub fn current_active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Requests accepted within the rolling horizon (one minute by default).
    pub fn requests_in_last_minute(&self) -> u64 {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut window, now, self.horizon);
        window.len() as u64
    }
}

impl Default for ConnectionAccountant {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, horizon: Duration) {
    while let Some(oldest) = window.front() {
        if now.duration_since(*oldest) >= horizon {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Holds one active connection; releases it on drop.
#[must_use = "dropping the guard immediately ends the connection"]
pub struct ConnectionGuard {
    accountant: Arc<ConnectionAccountant>,
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard").finish_non_exhaustive()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.accountant.record_request_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_pairs_start_and_end() {
        let accountant = Arc::new(ConnectionAccountant::new());
        {
            let _a = accountant.begin();
            let _b = accountant.begin();
            assert_eq!(accountant.current_active_connections(), 2);
        }
        assert_eq!(accountant.current_active_connections(), 0);
        assert_eq!(accountant.total_requests(), 2);
    }

    #[test]
    fn test_total_requests_is_monotonic() {
        let accountant = Arc::new(ConnectionAccountant::new());
        for _ in 0..5 {
            drop(accountant.begin());
        }
        assert_eq!(accountant.total_requests(), 5);
        assert_eq!(accountant.current_active_connections(), 0);
    }

    #[test]
    fn test_guard_released_on_panic_unwind() {
        let accountant = Arc::new(ConnectionAccountant::new());
        let cloned = accountant.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.begin();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(accountant.current_active_connections(), 0);
    }

    #[test]
    fn test_rolling_window_prunes_old_entries() {
        let accountant = ConnectionAccountant::with_horizon(Duration::from_millis(50));
        accountant.record_request_start();
        accountant.record_request_start();
        assert_eq!(accountant.requests_in_last_minute(), 2);

        std::thread::sleep(Duration::from_millis(80));
        accountant.record_request_start();
        assert_eq!(accountant.requests_in_last_minute(), 1);
    }

    #[test]
    fn test_concurrent_guards_return_to_zero() {
        let accountant = Arc::new(ConnectionAccountant::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let accountant = accountant.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = accountant.begin();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(accountant.current_active_connections(), 0);
        assert_eq!(accountant.total_requests(), 1600);
    }
}
