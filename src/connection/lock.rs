use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value stored at `connection:{siteId}` in the shared state store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionLock {
    pub node_address: String,
    pub connection_id: String,
    pub granted_at: DateTime<Utc>,
    pub site_version: u32,
}

impl ConnectionLock {
    pub fn key(site_id: i64) -> String {
        format!("connection:{site_id}")
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("ConnectionLock serializes infallibly")
    }

    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

pub fn block_key(uuid: &str) -> String {
    format!("blocked:{uuid}")
}
