//! Process configuration (§6 "Configuration (recognized options)", §11).
//!
//! Layered the way the rest of the ambient stack is: a single `clap::Parser`
//! struct defines every option, each overridable by an environment variable
//! of the same name upper-cased and prefixed `TUNNELGW_`. clap's own `env`
//! attribute is the single source of precedence (CLI flag > env var >
//! compiled default) — there is no separate TOML-file layer, since this
//! process has no interactive setup wizard or self-upgrade concern to
//! persist state for.

use std::time::Duration;

use clap::Parser;

/// openHAB Cloud tunnel gateway: authenticates site connections, tracks
/// in-flight request/response pairs, forwards client HTTP/WebSocket traffic
/// across tunnels, and coordinates one-site-one-active-connection across a
/// horizontally scaled cluster.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address the public client-facing listener binds to.
    #[arg(long, env = "TUNNELGW_LISTEN_ADDRESS", default_value = "0.0.0.0:3000")]
    pub listen_address: String,

    /// Address the admin listener (health, metrics) binds to. Never exposed
    /// on the public client-facing port.
    #[arg(long, env = "TUNNELGW_ADMIN_LISTEN_ADDRESS", default_value = "127.0.0.1:3001")]
    pub admin_listen_address: String,

    /// This node's externally reachable address, recorded in the
    /// ConnectionLock so peer nodes know where to proxy requests for sites
    /// this node owns.
    #[arg(long, env = "TUNNELGW_NODE_ADDRESS")]
    pub node_address: String,

    /// Connection string for the Shared State Store (component A).
    /// A `memory://` value selects the in-process test double instead of Redis.
    #[arg(long, env = "TUNNELGW_STORE_CONNECTION")]
    pub store_connection: String,

    /// Connection string for the Directory (component B).
    /// A `memory://` value selects the in-process test double instead of Postgres.
    #[arg(long, env = "TUNNELGW_DIRECTORY_CONNECTION")]
    pub directory_connection: String,

    /// FCM server key. Omit to run with push notifications disabled
    /// (`NotificationService` still persists and validates, just skips send).
    #[arg(long, env = "TUNNELGW_FCM_SERVER_KEY")]
    pub fcm_server_key: Option<String>,

    /// ConnectionLock TTL in seconds. Must be at least 3x `ping_interval`
    /// so a single missed renewal never expires a live session's lock.
    #[arg(long = "connection-lock-ttl", env = "TUNNELGW_CONNECTION_LOCK_TTL", default_value_t = 45)]
    pub connection_lock_ttl_secs: u64,

    /// Heartbeat ping interval in seconds.
    #[arg(long = "ping-interval", env = "TUNNELGW_PING_INTERVAL", default_value_t = 10)]
    pub ping_interval_secs: u64,

    /// How long to wait for a pong before counting it as missed, in seconds.
    #[arg(long = "ping-timeout", env = "TUNNELGW_PING_TIMEOUT", default_value_t = 20)]
    pub ping_timeout_secs: u64,

    /// Maximum age of an in-flight request before the sweeper fails it with
    /// a timeout, in seconds.
    #[arg(long = "request-max-age", env = "TUNNELGW_REQUEST_MAX_AGE", default_value_t = 120)]
    pub request_max_age_secs: u64,

    /// Auth-failure rate-limit block TTL in seconds.
    #[arg(long = "block-ttl", env = "TUNNELGW_BLOCK_TTL", default_value_t = 60)]
    pub block_ttl_secs: u64,

    /// Maximum encoded notification payload size in bytes.
    #[arg(long, env = "TUNNELGW_MAX_NOTIFICATION_PAYLOAD_BYTES", default_value_t = 1_048_576)]
    pub max_notification_payload_bytes: usize,

    /// Honor `X-Forwarded-*` for client IP/scheme. Enable only behind a
    /// trusted reverse proxy that strips these headers from untrusted input.
    #[arg(long, env = "TUNNELGW_TRUST_PROXY", default_value_t = false)]
    pub trust_proxy: bool,

    /// Log format: "pretty" (human-readable) or "json".
    #[arg(long, env = "TUNNELGW_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Log level filter, e.g. "info", "tunnelgw=debug,tower_http=info".
    #[arg(long, env = "TUNNELGW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// How long graceful shutdown waits for in-flight work to drain before
    /// hard-closing, in seconds.
    #[arg(long = "shutdown-grace", env = "TUNNELGW_SHUTDOWN_GRACE", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Number of retries when connecting to the store/directory at startup
    /// before giving up.
    #[arg(long, env = "TUNNELGW_STARTUP_RETRY_ATTEMPTS", default_value_t = 5)]
    pub startup_retry_attempts: u32,

    /// Base delay between startup connection retries, in milliseconds
    /// (doubled each attempt, capped at 30s).
    #[arg(long, env = "TUNNELGW_STARTUP_RETRY_BASE_DELAY_MS", default_value_t = 500)]
    pub startup_retry_base_delay_ms: u64,
}

impl Config {
    pub fn connection_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_lock_ttl_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn request_max_age(&self) -> Duration {
        Duration::from_secs(self.request_max_age_secs)
    }

    pub fn block_ttl(&self) -> Duration {
        Duration::from_secs(self.block_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Validates cross-field invariants that clap's per-arg validation can't
    /// express (§4.A: "Lock TTL is always larger than heartbeat interval by
    /// at least 3x").
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_lock_ttl_secs < self.ping_interval_secs * 3 {
            anyhow::bail!(
                "connection_lock_ttl ({}) must be at least 3x ping_interval ({})",
                self.connection_lock_ttl_secs,
                self.ping_interval_secs
            );
        }
        if self.ping_timeout_secs <= self.ping_interval_secs {
            anyhow::bail!(
                "ping_timeout ({}) must be greater than ping_interval ({})",
                self.ping_timeout_secs,
                self.ping_interval_secs
            );
        }
        if self.node_address.trim().is_empty() {
            anyhow::bail!("node_address must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "tunnel-gateway",
            "--node-address",
            "https://node1.example.com",
            "--store-connection",
            "memory://",
            "--directory-connection",
            "memory://",
        ]
    }

    #[test]
    fn defaults_satisfy_the_lock_ttl_heartbeat_invariant() {
        let config = Config::parse_from(base_args());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lock_ttl_below_3x_ping_interval_is_rejected() {
        let mut args = base_args();
        args.extend(["--connection-lock-ttl", "20", "--ping-interval", "10"]);
        let config = Config::parse_from(args);
        assert!(config.validate().is_err());
    }

    #[test]
    fn ping_timeout_must_exceed_ping_interval() {
        let mut args = base_args();
        args.extend(["--ping-interval", "20", "--ping-timeout", "10"]);
        let config = Config::parse_from(args);
        assert!(config.validate().is_err());
    }
}
