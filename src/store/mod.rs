//! Shared State Store abstraction (component A).
//!
//! Backs connection locks and auth-failure rate-limit markers. The trait
//! exposes exactly the optimistic-concurrency primitives ConnectionManager
//! needs — create-if-absent, renew-with-ownership-check, and
//! delete-with-ownership-check — rather than a generic get/set surface,
//! so callers can never accidentally race a read-modify-write.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("shared state store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a compare-and-delete or compare-and-touch: whether the caller's
/// expected value/owner was still current when the store checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    Stale,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `key` to `value` with `ttl`, only if absent. Returns `true` if this
    /// call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Fetch the current raw value for `key`, if present (and unexpired).
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remaining TTL for `key`, if present.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Atomically: if the current value at `key` equals `expected`, refresh its
    /// TTL and return `Applied`; otherwise leave it untouched and return `Stale`.
    /// If the key is absent, returns `Stale`.
    async fn compare_and_touch(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<CasOutcome>;

    /// Atomically: if the current value at `key` equals `expected`, delete it
    /// and return `Applied`; otherwise leave it untouched and return `Stale`.
    /// If the key is absent, returns `Applied` (already gone is a success for
    /// the caller's purposes).
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<CasOutcome>;

    /// Liveness probe used by the health endpoint.
    async fn ping(&self) -> StoreResult<()>;
}

/// Retries a single store operation once after a short fixed backoff before
/// letting the caller surface `StoreUnavailable` (§7: lock operations are
/// "retried once with short backoff, then surfaced"). A transient blip
/// (redeploy, failover) resolves inside this window; anything else fails
/// exactly as before, just 100ms later.
pub async fn retry_once<T, F, Fut>(mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(_) => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            op().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_the_first_attempt_works() {
        let attempts = AtomicU32::new(0);
        let result = retry_once(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, StoreError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_exactly_once_then_surfaces_the_second_failure() {
        let attempts = AtomicU32::new(0);
        let result = retry_once(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StoreError::Unavailable("down".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recovers_on_the_retry_attempt() {
        let attempts = AtomicU32::new(0);
        let result = retry_once(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(StoreError::Unavailable("down".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
