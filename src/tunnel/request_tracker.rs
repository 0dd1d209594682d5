//! RequestTracker (component D): per-session registry of in-flight client
//! requests awaiting a framed response from the site. Touched by two
//! producers — the tunnel's frame-read loop and the dispatcher's request/
//! disconnect handling — so the map lives behind a synchronous
//! `parking_lot::Mutex` that is never held across an `.await` or I/O call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::protocol::RequestId;

/// A chunk of the response as it streams back from the site.
#[derive(Debug)]
pub enum ResponseEvent {
    Header { status: u16, headers: HashMap<String, String> },
    Body(Vec<u8>),
    Finished,
    /// Synthesized by `cleanup_stale` when an entry exceeds `requestMaxAge`
    /// before the site ever finished it (§4.G: "dispatcher cancels, sends
    /// error to client, removes entry"). Distinct from `Finished` so the
    /// dispatcher can choose a 504 instead of treating it as a normal close.
    TimedOut,
}

pub struct InFlightRequest {
    pub sink: mpsc::UnboundedSender<ResponseEvent>,
    pub created_at: Instant,
    pub headers_sent: bool,
    pub finished: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("no in-flight request for id {0}")]
pub struct NotFound(pub RequestId);

pub struct RequestTracker {
    next_id: AtomicU64,
    inner: Mutex<HashMap<RequestId, InFlightRequest>>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add(&self, id: RequestId, req: InFlightRequest) {
        self.inner.lock().insert(id, req);
    }

    pub fn has(&self, id: RequestId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    /// Runs `f` with the tracked request, if present. Used for the
    /// low-traffic header/body dispatch path so the lock scope is explicit
    /// and never escapes into an `.await`.
    pub fn with<R>(&self, id: RequestId, f: impl FnOnce(&mut InFlightRequest) -> R) -> Option<R> {
        let mut guard = self.inner.lock();
        guard.get_mut(&id).map(f)
    }

    pub fn remove(&self, id: RequestId) -> Option<InFlightRequest> {
        self.inner.lock().remove(&id)
    }

    /// Like `remove`, but reports success as a bool instead of the removed
    /// value — used where the caller only cares whether an entry existed
    /// (dispatcher cleanup paths), per §4.D's `safeRemove`.
    pub fn safe_remove(&self, id: RequestId) -> bool {
        self.inner.lock().remove(&id).is_some()
    }

    pub fn mark_headers_sent(&self, id: RequestId) -> Result<(), NotFound> {
        let mut guard = self.inner.lock();
        let req = guard.get_mut(&id).ok_or(NotFound(id))?;
        req.headers_sent = true;
        Ok(())
    }

    pub fn mark_finished(&self, id: RequestId) -> Result<(), NotFound> {
        let mut guard = self.inner.lock();
        let req = guard.get_mut(&id).ok_or(NotFound(id))?;
        req.finished = true;
        Ok(())
    }

    /// Removes entries already flagged finished (post-teardown sweeping).
    pub fn cleanup_orphaned(&self) -> usize {
        let mut guard = self.inner.lock();
        let before = guard.len();
        guard.retain(|_, req| !req.finished);
        before - guard.len()
    }

    /// Removes entries older than `max_age`, returning their ids so the
    /// caller can tell the site to stop (a `cancel` frame). Each removed
    /// entry's sink also receives `ResponseEvent::TimedOut` before being
    /// dropped, so a dispatcher task awaiting a response on it resolves to a
    /// 504 immediately rather than hanging until it notices the channel
    /// closed.
    pub fn cleanup_stale(&self, max_age: Duration) -> Vec<RequestId> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let stale_ids: Vec<RequestId> = guard
            .iter()
            .filter(|(_, req)| now.duration_since(req.created_at) > max_age)
            .map(|(id, _)| *id)
            .collect();
        let removed: Vec<InFlightRequest> = stale_ids
            .iter()
            .filter_map(|id| guard.remove(id))
            .collect();
        drop(guard);
        for req in removed {
            let _ = req.sink.send(ResponseEvent::TimedOut);
        }
        stale_ids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every entry, e.g. on session teardown, so each can be failed
    /// with a 503 by the caller.
    pub fn drain_all(&self) -> Vec<(RequestId, InFlightRequest)> {
        self.inner.lock().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> (InFlightRequest, mpsc::UnboundedReceiver<ResponseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            InFlightRequest {
                sink: tx,
                created_at: Instant::now(),
                headers_sent: false,
                finished: false,
            },
            rx,
        )
    }

    #[test]
    fn acquire_id_is_monotonic() {
        let tracker = RequestTracker::new();
        let a = tracker.acquire_id();
        let b = tracker.acquire_id();
        assert!(b > a);
    }

    #[test]
    fn unknown_id_operations_report_failure_not_panic() {
        let tracker = RequestTracker::new();
        assert!(matches!(tracker.mark_finished(99), Err(NotFound(99))));
        assert!(!tracker.safe_remove(99));
        assert!(tracker.remove(99).is_none());
    }

    #[test]
    fn cleanup_stale_evicts_only_expired_entries() {
        let tracker = RequestTracker::new();
        let (req, _rx) = entry();
        tracker.add(1, req);
        assert!(tracker.cleanup_stale(Duration::from_secs(120)).is_empty());
        assert_eq!(tracker.len(), 1);

        let stale = tracker.cleanup_stale(Duration::from_nanos(0));
        assert_eq!(stale, vec![1]);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn cleanup_stale_notifies_the_sink_before_dropping_it() {
        let tracker = RequestTracker::new();
        let (req, mut rx) = entry();
        tracker.add(1, req);
        let stale = tracker.cleanup_stale(Duration::from_nanos(0));
        assert_eq!(stale, vec![1]);
        assert!(matches!(rx.try_recv(), Ok(ResponseEvent::TimedOut)));
    }

    #[test]
    fn cleanup_orphaned_removes_finished_entries_only() {
        let tracker = RequestTracker::new();
        let (req_a, _a) = entry();
        let (req_b, _b) = entry();
        tracker.add(1, req_a);
        tracker.add(2, req_b);
        tracker.mark_finished(1).unwrap();

        let removed = tracker.cleanup_orphaned();
        assert_eq!(removed, 1);
        assert!(!tracker.has(1));
        assert!(tracker.has(2));
    }
}
