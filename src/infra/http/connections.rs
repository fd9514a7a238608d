//! Live connection accounting for the status endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::gauge;

pub(crate) const METRIC_ACTIVE_CONNECTIONS: &str = "gateway_active_connections";

/// Shared count of open client connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounter {
    active: Arc<AtomicUsize>,
}

impl ConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Register a connection; it stays counted until the guard drops.
    pub fn open(&self) -> ConnectionGuard {
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!(METRIC_ACTIVE_CONNECTIONS).set(active as f64);
        ConnectionGuard {
            active: self.active.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        gauge!(METRIC_ACTIVE_CONNECTIONS).set(active as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_release_their_slot() {
        let counter = ConnectionCounter::new();
        let first = counter.open();
        let second = counter.clone().open();
        assert_eq!(counter.active(), 2);
        drop(first);
        assert_eq!(counter.active(), 1);
        drop(second);
        assert_eq!(counter.active(), 0);
    }
}
