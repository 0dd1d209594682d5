//! NotificationService (component I): validates, persists, and fans out push
//! payloads to device tokens.

pub mod fcm;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::errors::NotificationError;
use fcm::PushProvider;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: uuid::Uuid,
    pub user_id: i64,
    pub message: Option<String>,
    pub icon: Option<String>,
    pub tag: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// External persistence collaborator (out of core scope per §1; specified
/// here only at its call boundary). 30-day retention is the persistence
/// layer's concern, not this trait's.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn persist(&self, record: &NotificationRecord) -> Result<(), NotificationError>;
}

pub struct InMemoryNotificationStore {
    records: parking_lot::Mutex<Vec<NotificationRecord>>,
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self {
            records: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<NotificationRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn persist(&self, record: &NotificationRecord) -> Result<(), NotificationError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

pub struct NotificationService {
    push: Arc<dyn PushProvider>,
    store: Arc<dyn NotificationStore>,
    max_payload_bytes: usize,
}

impl NotificationService {
    pub fn new(push: Arc<dyn PushProvider>, max_payload_bytes: usize) -> Self {
        Self::with_store(push, Arc::new(InMemoryNotificationStore::new()), max_payload_bytes)
    }

    pub fn with_store(
        push: Arc<dyn PushProvider>,
        store: Arc<dyn NotificationStore>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            push,
            store,
            max_payload_bytes,
        }
    }

    /// `payload` is the opaque JSON the site sent over the tunnel, stored
    /// verbatim in the resulting `NotificationRecord` (§8's round-trip
    /// invariant: the stored `payload` field equals what the site sent).
    /// `message`/`icon`/`tag` are pulled out as display fields without being
    /// removed from `payload`; the legacy `severity` alias is normalized into
    /// the record's `tag` field only, never written back into `payload`.
    #[instrument(skip(self, payload), fields(user_id))]
    pub async fn send(
        &self,
        user_id: i64,
        payload: serde_json::Value,
    ) -> Result<(), NotificationError> {
        let encoded = serde_json::to_vec(&payload)
            .map_err(|_| NotificationError::PersistenceUnavailable)?;
        if encoded.len() > self.max_payload_bytes {
            warn!(
                user_id,
                size = encoded.len(),
                limit = self.max_payload_bytes,
                "notification payload exceeds configured limit; rejecting"
            );
            return Err(NotificationError::PayloadTooLarge);
        }

        let str_field = |key: &str| payload.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let tag = str_field("tag").or_else(|| str_field("severity"));

        let record = NotificationRecord {
            id: uuid::Uuid::new_v4(),
            user_id,
            message: str_field("message"),
            icon: str_field("icon"),
            tag,
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        self.store.persist(&record).await?;

        if self.push.is_configured() {
            if let Err(e) = self.push.send_batch(user_id, &record).await {
                // Per-token/provider failures never fail the call; they're
                // logged and swallowed (§4.I step 5).
                warn!(user_id, error = %e, "push provider failed to deliver notification");
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn hide(&self, user_id: i64, notification_id: uuid::Uuid) {
        if self.push.is_configured() {
            if let Err(e) = self.push.send_hide(user_id, notification_id).await {
                warn!(user_id, error = %e, "push provider failed to deliver hide marker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcm::tests::NullPushProvider;

    fn service(max_bytes: usize) -> NotificationService {
        NotificationService::new(Arc::new(NullPushProvider::default()), max_bytes)
    }

    #[tokio::test]
    async fn payload_at_exactly_the_limit_succeeds() {
        // `{"a":"...."}`  — pad so the encoded JSON is exactly at the limit.
        let limit = 64;
        let pad_len = limit - r#"{"a":""}"#.len();
        let payload = serde_json::json!({ "a": "x".repeat(pad_len) });
        let encoded_len = serde_json::to_vec(&payload).unwrap().len();
        assert_eq!(encoded_len, limit);

        let svc = service(limit);
        assert!(svc.send(1, payload).await.is_ok());
    }

    #[tokio::test]
    async fn payload_one_byte_over_the_limit_is_rejected() {
        let limit = 64;
        let pad_len = limit - r#"{"a":""}"#.len() + 1;
        let payload = serde_json::json!({ "a": "x".repeat(pad_len) });

        let svc = service(limit);
        assert!(matches!(
            svc.send(1, payload).await,
            Err(NotificationError::PayloadTooLarge)
        ));
    }

    #[tokio::test]
    async fn severity_aliases_into_tag_when_tag_absent() {
        let push = Arc::new(NullPushProvider::default());
        let store = Arc::new(InMemoryNotificationStore::new());
        let svc = NotificationService::with_store(push, store.clone(), 1_000_000);
        let payload = serde_json::json!({ "message": "hi", "severity": "warning" });
        svc.send(1, payload).await.unwrap();
        let records = store.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tag.as_deref(), Some("warning"));
    }

    #[tokio::test]
    async fn explicit_tag_is_not_overridden_by_severity() {
        let push = Arc::new(NullPushProvider::default());
        let store = Arc::new(InMemoryNotificationStore::new());
        let svc = NotificationService::with_store(push, store.clone(), 1_000_000);
        let payload = serde_json::json!({ "tag": "custom", "severity": "warning" });
        svc.send(1, payload).await.unwrap();
        assert_eq!(store.snapshot()[0].tag.as_deref(), Some("custom"));
    }

    #[tokio::test]
    async fn stored_payload_round_trips_verbatim() {
        let push = Arc::new(NullPushProvider::default());
        let store = Arc::new(InMemoryNotificationStore::new());
        let svc = NotificationService::with_store(push, store.clone(), 1_000_000);
        let payload = serde_json::json!({ "message": "hi", "severity": "warning", "extra": {"k": 1} });
        svc.send(1, payload.clone()).await.unwrap();
        assert_eq!(store.snapshot()[0].payload, payload);
    }
}
