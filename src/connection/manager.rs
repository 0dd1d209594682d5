//! ConnectionManager (component C): enforces "at most one active connection
//! per site" across cluster nodes using the Shared State Store. All
//! multi-step operations lean on the store's compare-and-touch /
//! compare-and-delete primitives rather than get-then-set, so races resolve
//! the way the design mandates: `acquire_lock` is pure create-if-absent,
//! never read-modify-write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{instrument, warn};

use crate::connection::lock::{block_key, ConnectionLock};
use crate::store::{CasOutcome, KvStore};

#[derive(Debug, Clone, Copy)]
pub struct BlockStatus {
    pub blocked: bool,
    pub ttl: Option<Duration>,
}

#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(ConnectionLock),
    AlreadyConnected { holder: Option<ConnectionLock> },
}

pub struct ConnectionManager {
    store: Arc<dyn KvStore>,
    lock_ttl: Duration,
    block_ttl: Duration,
}

impl ConnectionManager {
    pub fn new(store: Arc<dyn KvStore>, lock_ttl: Duration, block_ttl: Duration) -> Self {
        Self {
            store,
            lock_ttl,
            block_ttl,
        }
    }

    /// Reads the block-entry TTL. Store errors are treated as "not blocked" —
    /// this is a rate-limit read, and fails open by design (§7: "ignored for
    /// rate-limit read (fail-open)").
    #[instrument(skip(self))]
    pub async fn is_blocked(&self, uuid: &str) -> BlockStatus {
        match self.store.ttl(&block_key(uuid)).await {
            Ok(Some(ttl)) => BlockStatus {
                blocked: true,
                ttl: Some(ttl),
            },
            Ok(None) => BlockStatus {
                blocked: false,
                ttl: None,
            },
            Err(e) => {
                warn!(error = %e, uuid, "store unavailable while checking auth block; failing open");
                BlockStatus {
                    blocked: false,
                    ttl: None,
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn record_auth_failure(&self, uuid: &str, version: u32) {
        if let Err(e) = self
            .store
            .set_nx(&block_key(uuid), &version.to_string(), self.block_ttl)
            .await
        {
            warn!(error = %e, uuid, "failed to record auth failure block");
        }
    }

    #[instrument(skip(self))]
    pub async fn acquire_lock(
        &self,
        site_id: i64,
        connection_id: &str,
        site_version: u32,
        node_address: &str,
    ) -> Result<AcquireOutcome, crate::store::StoreError> {
        let key = ConnectionLock::key(site_id);
        let lock = ConnectionLock {
            node_address: node_address.to_string(),
            connection_id: connection_id.to_string(),
            granted_at: Utc::now(),
            site_version,
        };
        let acquired = self.store.set_nx(&key, &lock.encode(), self.lock_ttl).await?;
        if acquired {
            return Ok(AcquireOutcome::Acquired(lock));
        }
        let holder = self
            .store
            .get(&key)
            .await?
            .and_then(|raw| ConnectionLock::decode(&raw));
        Ok(AcquireOutcome::AlreadyConnected { holder })
    }

    /// Renews the lock, extending its TTL. Returns `false` if the lock no
    /// longer matches this connection — ownership has moved to a peer and
    /// the caller must terminate its session (transition to DEGRADED).
    #[instrument(skip(self, expected))]
    pub async fn renew_lock(
        &self,
        site_id: i64,
        expected: &ConnectionLock,
    ) -> Result<bool, crate::store::StoreError> {
        let key = ConnectionLock::key(site_id);
        let outcome = self
            .store
            .compare_and_touch(&key, &expected.encode(), self.lock_ttl)
            .await?;
        Ok(outcome == CasOutcome::Applied)
    }

    /// Releases the lock iff it still matches this connection, and bumps the
    /// directory's `last_online`. If a takeover already happened, this is a
    /// no-op — the lock isn't ours to delete.
    #[instrument(skip(self, expected))]
    pub async fn release_lock(
        &self,
        site_id: i64,
        expected: &ConnectionLock,
        directory: &dyn crate::directory::Directory,
    ) {
        let key = ConnectionLock::key(site_id);
        match self.store.compare_and_delete(&key, &expected.encode()).await {
            Ok(CasOutcome::Applied) => {
                if let Err(e) = directory.bump_last_online(site_id, Utc::now()).await {
                    warn!(error = %e, site_id, "failed to bump last_online on clean disconnect");
                }
            }
            Ok(CasOutcome::Stale) => {
                warn!(site_id, "release_lock found a different owner; not releasing");
            }
            Err(e) => warn!(error = %e, site_id, "store unavailable while releasing lock"),
        }
    }

    #[instrument(skip(self))]
    pub async fn peek_lock(
        &self,
        site_id: i64,
    ) -> Result<Option<ConnectionLock>, crate::store::StoreError> {
        let raw = self.store.get(&ConnectionLock::key(site_id)).await?;
        Ok(raw.and_then(|r| ConnectionLock::decode(&r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::memory::InMemoryDirectory;
    use crate::store::memory::MemoryStore;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(45),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn second_acquire_is_rejected_while_first_holds() {
        let mgr = manager();
        let first = mgr.acquire_lock(1, "conn-a", 1, "node-1").await.unwrap();
        assert!(matches!(first, AcquireOutcome::Acquired(_)));

        let second = mgr.acquire_lock(1, "conn-b", 1, "node-2").await.unwrap();
        match second {
            AcquireOutcome::AlreadyConnected { holder } => {
                assert_eq!(holder.unwrap().connection_id, "conn-a");
            }
            _ => panic!("expected AlreadyConnected"),
        }
    }

    #[tokio::test]
    async fn acquire_then_release_restores_prior_state() {
        let mgr = manager();
        let lock = match mgr.acquire_lock(1, "conn-a", 1, "node-1").await.unwrap() {
            AcquireOutcome::Acquired(l) => l,
            _ => panic!("expected acquisition"),
        };
        let directory = InMemoryDirectory::new();
        mgr.release_lock(1, &lock, &directory).await;
        assert!(mgr.peek_lock(1).await.unwrap().is_none());

        let reacquired = mgr.acquire_lock(1, "conn-c", 1, "node-1").await.unwrap();
        assert!(matches!(reacquired, AcquireOutcome::Acquired(_)));
    }

    #[tokio::test]
    async fn renew_fails_once_ownership_moves() {
        let mgr = manager();
        let lock = match mgr.acquire_lock(1, "conn-a", 1, "node-1").await.unwrap() {
            AcquireOutcome::Acquired(l) => l,
            _ => panic!("expected acquisition"),
        };
        assert!(mgr.renew_lock(1, &lock).await.unwrap());

        // Simulate takeover: directly overwrite via a fresh store record.
        let directory = InMemoryDirectory::new();
        mgr.release_lock(1, &lock, &directory).await;
        let _ = mgr.acquire_lock(1, "conn-b", 1, "node-2").await.unwrap();

        assert!(!mgr.renew_lock(1, &lock).await.unwrap());
    }

    #[tokio::test]
    async fn auth_failure_blocks_until_ttl() {
        let mgr = manager();
        assert!(!mgr.is_blocked("abc").await.blocked);
        mgr.record_auth_failure("abc", 1).await;
        assert!(mgr.is_blocked("abc").await.blocked);
    }
}
