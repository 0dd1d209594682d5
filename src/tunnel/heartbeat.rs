//! Heartbeat task: sends `ping` on a fixed interval, renews the cluster-wide
//! ConnectionLock alongside it, and watches for missed `pong`s. Two
//! consecutive missed pongs, or a failed lock renewal (ownership moved to a
//! peer — a takeover), both terminate the session; the session never
//! recovers from either condition (§4.F: DEGRADED has no return arrow).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::connection::{ConnectionLock, ConnectionManager};

use super::protocol::Frame;
use super::writer::FrameSender;

pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

/// Runs until the frame channel closes or a shutdown condition is hit. The
/// caller observes termination via `shutdown_rx` rather than this task's
/// join handle, since either the heartbeat or the read loop may be the one
/// to detect the session should end.
pub fn spawn(
    frame_tx: FrameSender,
    conn_mgr: Arc<ConnectionManager>,
    site_id: i64,
    lock: ConnectionLock,
    config: HeartbeatConfig,
    last_pong: Arc<Mutex<Instant>>,
    shutdown: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut missed_pongs = 0u32;
        let mut interval = tokio::time::interval(config.ping_interval);
        interval.tick().await; // first tick fires immediately; skip it

        loop {
            interval.tick().await;
            if *shutdown.borrow() {
                return;
            }

            if frame_tx.send(Frame::Ping).is_err() {
                info!(site_id, "frame channel closed; stopping heartbeat");
                let _ = shutdown.send(true);
                return;
            }

            match crate::store::retry_once(|| conn_mgr.renew_lock(site_id, &lock)).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(site_id, "lock renewal lost ownership; takeover in progress");
                    let _ = shutdown.send(true);
                    return;
                }
                Err(e) => {
                    warn!(site_id, error = %e, "store unavailable while renewing lock");
                    // transient store errors don't by themselves prove takeover;
                    // retry next tick, but still count toward the pong timeout.
                }
            }

            let since_pong = last_pong.lock().elapsed();
            if since_pong > config.ping_timeout {
                missed_pongs += 1;
                warn!(site_id, missed_pongs, "missed pong within timeout window");
                if missed_pongs >= 2 {
                    warn!(site_id, "two consecutive missed pongs; closing session");
                    let _ = shutdown.send(true);
                    return;
                }
            } else {
                missed_pongs = 0;
            }
        }
    })
}
