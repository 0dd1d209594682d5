//! TunnelSession (component F): the per-site stateful connection object.
//!
//! State machine: `NEW → AUTHENTICATING → LOCK_PENDING → READY ⇄ DEGRADED →
//! CLOSED`. NEW/AUTHENTICATING are realized as pre-upgrade checks in the
//! axum handler below — the handshake's `uuid`/`secret`/`version` arrive as
//! query parameters on the WebSocket upgrade request itself (per the design
//! doc's "out-of-band parameters... with the transport's standard query
//! string"), so a blocked or invalid-credentials site never completes the
//! upgrade at all rather than being upgraded and then immediately closed.
//! LOCK_PENDING/READY/DEGRADED/CLOSED are realized in `run` below, after the
//! WebSocket is established, mirroring the accept-loop shape used for other
//! inbound WebSocket gateways in this codebase's lineage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::connection::{AcquireOutcome, ConnectionLock};
use crate::errors::AuthError;
use crate::state::AppState;

use super::heartbeat::{self, HeartbeatConfig};
use super::protocol::{Frame, RequestId};
use super::request_tracker::{RequestTracker, ResponseEvent};
use super::writer::{self, FrameSender};
use super::ws_tracker::WebSocketTracker;

#[derive(Debug, Deserialize)]
pub struct HandshakeParams {
    pub uuid: Uuid,
    pub secret: String,
    #[serde(default)]
    pub version: u32,
}

/// Handle to a READY session, held in `AppState::local_sessions` and
/// borrowed by HTTPDispatcher/WSDispatcher for the duration of one request.
pub struct TunnelHandle {
    pub site_id: i64,
    pub site_uuid: Uuid,
    pub account_id: i64,
    pub connection_id: String,
    pub node_address: String,
    pub frame_tx: FrameSender,
    pub requests: RequestTracker,
    pub websockets: WebSocketTracker,
    /// Lets an external caller (process shutdown) terminate this session the
    /// same way an internal takeover/heartbeat failure would. Sending `true`
    /// wakes both the read loop's `select!` and the writer task, which closes
    /// the transport with reason "shutdown" before the read loop tears down.
    pub shutdown: watch::Sender<bool>,
}

pub async fn accept(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    State(app): State<Arc<AppState>>,
) -> Response {
    let uuid_str = params.uuid.to_string();

    if app.connection_manager.is_blocked(&uuid_str).await.blocked {
        info!(uuid = %uuid_str, "rejecting tunnel handshake: uuid is rate-limited");
        return axum::http::StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let gateway = crate::auth::AuthGateway::new(app.directory.clone(), app.sessions.clone());
    let site = match gateway.authenticate_site(params.uuid, &params.secret).await {
        Ok(site) => site,
        Err(AuthError::DirectoryUnavailable) => {
            return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        Err(_) => {
            app.connection_manager
                .record_auth_failure(&uuid_str, params.version)
                .await;
            warn!(uuid = %uuid_str, "tunnel handshake rejected: invalid credentials");
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| run(socket, app, site, params.version))
}

#[instrument(skip(socket, app, site), fields(site_id = site.id, uuid = %site.uuid))]
async fn run(socket: WebSocket, app: Arc<AppState>, site: crate::directory::Site, version: u32) {
    let connection_id = Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();

    let lock = match crate::store::retry_once(|| {
        app.connection_manager
            .acquire_lock(site.id, &connection_id, version, &app.config.node_address)
    })
    .await
    {
        Ok(AcquireOutcome::Acquired(lock)) => {
            app.metrics.record_lock_acquired();
            lock
        }
        Ok(AcquireOutcome::AlreadyConnected { .. }) => {
            app.metrics.record_lock_failed();
            info!(site_id = site.id, "closing: another connection already holds the lock");
            close_with_reason(sink, "already connected").await;
            return;
        }
        Err(e) => {
            warn!(site_id = site.id, error = %e, "store unavailable while acquiring lock");
            close_with_reason(sink, "store unavailable").await;
            return;
        }
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (frame_tx, writer_handle) = writer::spawn(sink, shutdown_tx.subscribe());
    let handle = Arc::new(TunnelHandle {
        site_id: site.id,
        site_uuid: site.uuid,
        account_id: site.account_id,
        connection_id: connection_id.clone(),
        node_address: app.config.node_address.clone(),
        frame_tx: frame_tx.clone(),
        requests: RequestTracker::new(),
        websockets: WebSocketTracker::new(),
        shutdown: shutdown_tx.clone(),
    });
    app.local_sessions.insert(site.id, handle.clone());
    info!(site_id = site.id, connection_id = %connection_id, "session READY");

    let last_pong = Arc::new(SyncMutex::new(Instant::now()));
    let heartbeat_handle = heartbeat::spawn(
        frame_tx.clone(),
        app.connection_manager.clone(),
        site.id,
        lock.clone(),
        HeartbeatConfig {
            ping_interval: app.config.ping_interval(),
            ping_timeout: app.config.ping_timeout(),
        },
        last_pong.clone(),
        shutdown_tx.clone(),
    );

    let sweep_handle = spawn_sweeper(handle.clone(), app.config.request_max_age(), shutdown_tx.subscribe());

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_incoming(&handle, &app, &text, &last_pong).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong frames at the transport level are ignored; heartbeat is app-level
                    Some(Err(e)) => {
                        warn!(site_id = site.id, error = %e, "transport error reading from site");
                        break;
                    }
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    heartbeat_handle.abort();
    sweep_handle.abort();
    writer_handle.abort();
    teardown(&app, &handle, &lock).await;
}

async fn handle_incoming(
    handle: &Arc<TunnelHandle>,
    app: &Arc<AppState>,
    text: &str,
    last_pong: &Arc<SyncMutex<Instant>>,
) {
    let frame = match Frame::from_json(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(site_id = handle.site_id, error = %e, "malformed frame; dropping");
            return;
        }
    };

    match frame {
        Frame::Pong => {
            *last_pong.lock() = Instant::now();
        }
        Frame::Ping => {
            let _ = handle.frame_tx.send(Frame::Pong);
        }
        Frame::ResponseHeader { id, status, headers } => {
            route_response(handle, id, ResponseEvent::Header { status, headers });
        }
        Frame::ResponseBody { id, bytes } => match Frame::decode_body(&bytes) {
            Ok(decoded) => {
                // A request that has already been upgraded to a tunneled
                // WebSocket moves off the RequestTracker and onto the
                // WebSocketTracker (component E); body frames for it land
                // here too, so fall through to the socket registry.
                if !route_response(handle, id, ResponseEvent::Body(decoded.clone())) {
                    handle.websockets.send(id, Message::Binary(decoded));
                }
            }
            Err(e) => warn!(site_id = handle.site_id, error = %e, "malformed responseBody; dropping"),
        },
        Frame::ResponseFinished { id } => {
            if !route_response(handle, id, ResponseEvent::Finished) {
                if let Some(socket) = handle.websockets.remove(id) {
                    let _ = socket.to_client.send(Message::Close(None));
                }
            }
        }
        Frame::WsClose { id } => {
            if let Some(socket) = handle.websockets.remove(id) {
                let _ = socket.to_client.send(Message::Close(None));
            }
        }
        Frame::Notification { user_id, payload } => {
            match app.notifications.send(user_id, payload).await {
                Ok(()) => app.metrics.record_notification_sent(),
                Err(e) => {
                    app.metrics.record_notification_rejected();
                    warn!(site_id = handle.site_id, error = %e, "notification rejected");
                }
            }
        }
        Frame::ItemUpdate { .. } | Frame::Command { .. } => {
            // State-propagation frames are forwarded to subscribers when any
            // are registered; there are none in this deployment's core scope
            // (§4.F: "out of core scope except to forward to subscribers if
            // any"), so these are intentionally no-ops here.
        }
        Frame::Request { .. } | Frame::UpgradeRequest { .. } | Frame::RequestBodyContinuation { .. } => {
            // These are dispatcher → site frames; a site sending one back is
            // a protocol violation from the remote end. Log and drop rather
            // than closing the session.
            warn!(site_id = handle.site_id, "received a dispatcher-originated frame kind from the site; dropping");
        }
    }
}

/// Returns `true` if `id` was a known RequestTracker entry (whether or not
/// the event was actually delivered to it — duplicate headers and
/// post-finish frames are still "known", just dropped). `false` means the
/// caller should check the WebSocketTracker instead, or give up (unknown
/// id — site is responding to an already-cancelled/timed-out request).
fn route_response(handle: &Arc<TunnelHandle>, id: RequestId, event: ResponseEvent) -> bool {
    let is_header = matches!(event, ResponseEvent::Header { .. });
    let is_finished_event = matches!(event, ResponseEvent::Finished);

    handle
        .requests
        .with(id, move |req| {
            if req.finished {
                return; // late frame after finish; drop
            }
            if is_header && req.headers_sent {
                return; // duplicate responseHeader: protocol violation, drop, keep session open
            }
            if is_header {
                req.headers_sent = true;
            }
            let _ = req.sink.send(event);
            if is_finished_event {
                req.finished = true;
            }
        })
        .is_some()
}

fn spawn_sweeper(
    handle: Arc<TunnelHandle>,
    max_age: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    let stale = handle.requests.cleanup_stale(max_age);
                    for id in stale {
                        warn!(site_id = handle.site_id, request_id = id, "request exceeded max age; failing with timeout");
                        let _ = handle.frame_tx.send(Frame::Cancel { id });
                    }
                    handle.requests.cleanup_orphaned();
                }
            }
        }
    })
}

async fn teardown(app: &Arc<AppState>, handle: &Arc<TunnelHandle>, lock: &ConnectionLock) {
    app.local_sessions.remove(&handle.site_id);

    for (_, req) in handle.requests.drain_all() {
        let _ = req.sink.send(ResponseEvent::Finished);
    }
    for (_, socket) in handle.websockets.close_all() {
        let _ = socket.to_client.send(Message::Close(None));
    }

    app.connection_manager
        .release_lock(handle.site_id, lock, app.directory.as_ref())
        .await;
    info!(site_id = handle.site_id, connection_id = %handle.connection_id, "session CLOSED");
}

async fn close_with_reason<S>(mut sink: S, reason: &'static str)
where
    S: futures_util::Sink<Message> + Unpin,
{
    use futures_util::SinkExt;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: reason.into(),
        })))
        .await;
}
