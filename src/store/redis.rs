//! Redis-compatible `KvStore` implementation, the production-facing Shared
//! State Store backend. Built on `fred`, the same client family used for the
//! connection/route registries this module's CAS helpers are modeled on.
//!
//! `compare_and_touch`/`compare_and_delete` need "read current value, then
//! conditionally mutate" to happen atomically from Redis's point of view.
//! Rather than the client-side WATCH/MULTI/EXEC dance (which needs a
//! dedicated connection per transaction), both are expressed as small
//! server-side Lua scripts via `EVAL` — the standard way to get
//! compare-and-swap semantics out of a pooled Redis client.

use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;

use super::{CasOutcome, KvStore, StoreError, StoreResult};

const COMPARE_AND_TOUCH: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("PEXPIRE", KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

const COMPARE_AND_DELETE: &str = r#"
local current = redis.call("GET", KEYS[1])
if current == false then
    return 1
elseif current == ARGV[1] then
    redis.call("DEL", KEYS[1])
    return 1
else
    return 0
end
"#;

pub struct RedisStore {
    client: RedisClient,
}

impl RedisStore {
    pub async fn connect(connection_string: &str) -> anyhow::Result<Self> {
        let config = RedisConfig::from_url(connection_string)?;
        let client = Builder::from_config(config)
            .with_connection_config(|c| {
                c.connection_timeout = Duration::from_secs(5);
            })
            .build()?;
        client.connect();
        client.wait_for_connect().await?;
        Ok(Self { client })
    }

    fn map_err(e: fred::error::RedisError) -> StoreError {
        StoreError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let opts = SetOptions::NX;
        let expire = Some(Expiration::PX(ttl.as_millis() as i64));
        let result: Option<String> = self
            .client
            .set(key, value, expire, Some(opts), false)
            .await
            .map_err(Self::map_err)?;
        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.client.get(key).await.map_err(Self::map_err)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let millis: i64 = self.client.pttl(key).await.map_err(Self::map_err)?;
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(millis as u64)))
        }
    }

    async fn compare_and_touch(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<CasOutcome> {
        let applied: i64 = self
            .client
            .eval(
                COMPARE_AND_TOUCH,
                vec![key.to_string()],
                vec![expected.to_string(), ttl.as_millis().to_string()],
            )
            .await
            .map_err(Self::map_err)?;
        Ok(if applied == 1 {
            CasOutcome::Applied
        } else {
            CasOutcome::Stale
        })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<CasOutcome> {
        let applied: i64 = self
            .client
            .eval(
                COMPARE_AND_DELETE,
                vec![key.to_string()],
                vec![expected.to_string()],
            )
            .await
            .map_err(Self::map_err)?;
        Ok(if applied == 1 {
            CasOutcome::Applied
        } else {
            CasOutcome::Stale
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        self.client.ping(None).await.map_err(Self::map_err)
    }
}
