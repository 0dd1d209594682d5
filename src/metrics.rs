//! Minimal in-process metrics snapshot (§10). This is process-local
//! introspection for the admin listener, not the cluster-wide background
//! statistics job this deployment excludes — counters reset on restart and
//! are never aggregated across nodes.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    lock_acquisitions: AtomicU64,
    lock_failures: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_rejected: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lock_acquired(&self) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_failed(&self) {
        self.lock_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_rejected(&self) {
        self.notifications_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders a plain-text snapshot; `active_sessions`/`in_flight_requests`
    /// are gauges computed by the caller at read time rather than tracked
    /// here, since they're already held live in `AppState`.
    pub fn render(&self, active_sessions: usize, in_flight_requests: usize) -> String {
        format!(
            "active_sessions {active_sessions}\n\
             in_flight_requests {in_flight_requests}\n\
             lock_acquisitions_total {}\n\
             lock_failures_total {}\n\
             notifications_sent_total {}\n\
             notifications_rejected_total {}\n",
            self.lock_acquisitions.load(Ordering::Relaxed),
            self.lock_failures.load(Ordering::Relaxed),
            self.notifications_sent.load(Ordering::Relaxed),
            self.notifications_rejected.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_reflects_recorded_counts() {
        let metrics = Metrics::new();
        metrics.record_lock_acquired();
        metrics.record_lock_acquired();
        metrics.record_lock_failed();
        metrics.record_notification_sent();
        metrics.record_notification_rejected();

        let snapshot = metrics.render(2, 5);
        assert!(snapshot.contains("active_sessions 2"));
        assert!(snapshot.contains("in_flight_requests 5"));
        assert!(snapshot.contains("lock_acquisitions_total 2"));
        assert!(snapshot.contains("lock_failures_total 1"));
        assert!(snapshot.contains("notifications_sent_total 1"));
        assert!(snapshot.contains("notifications_rejected_total 1"));
    }
}
