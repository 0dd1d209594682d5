//! In-process `KvStore` used by the in-memory `Directory` test double and by
//! unit/integration tests that exercise `ConnectionManager` without a real
//! Redis-compatible backend.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CasOutcome, KvStore, StoreResult};

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(e) if e.expires_at > Instant::now() => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut entries = self.entries.lock();
        if Self::live(&mut entries, key).is_none() {
            return Ok(None);
        }
        let remaining = entries
            .get(key)
            .map(|e| e.expires_at.saturating_duration_since(Instant::now()));
        Ok(remaining)
    }

    async fn compare_and_touch(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<CasOutcome> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(current) if current == expected => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: current,
                        expires_at: Instant::now() + ttl,
                    },
                );
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Stale),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<CasOutcome> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(current) if current == expected => {
                entries.remove(key);
                Ok(CasOutcome::Applied)
            }
            Some(_) => Ok(CasOutcome::Stale),
            None => Ok(CasOutcome::Applied),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "v1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx("k", "v2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("v1".to_string()));
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_owner() {
        let store = MemoryStore::new();
        store.set_nx("k", "owner-a", Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            store.compare_and_delete("k", "owner-b").await.unwrap(),
            CasOutcome::Stale
        );
        assert_eq!(
            store.compare_and_delete("k", "owner-a").await.unwrap(),
            CasOutcome::Applied
        );
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_delete_absent_key_is_applied() {
        let store = MemoryStore::new();
        assert_eq!(
            store.compare_and_delete("missing", "anything").await.unwrap(),
            CasOutcome::Applied
        );
    }

    #[tokio::test]
    async fn compare_and_touch_rejects_stale_owner() {
        let store = MemoryStore::new();
        store.set_nx("k", "owner-a", Duration::from_millis(50)).await.unwrap();
        assert_eq!(
            store
                .compare_and_touch("k", "owner-b", Duration::from_secs(5))
                .await
                .unwrap(),
            CasOutcome::Stale
        );
        assert_eq!(
            store
                .compare_and_touch("k", "owner-a", Duration::from_secs(5))
                .await
                .unwrap(),
            CasOutcome::Applied
        );
    }

    #[tokio::test]
    async fn expired_entries_are_treated_as_absent() {
        let store = MemoryStore::new();
        store.set_nx("k", "v", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_nx("k", "v2", Duration::from_secs(5)).await.unwrap());
    }
}
