//! WSDispatcher (component H): upgrades a client connection and relays it
//! over the tunnel as a pair of request/response id'd frame streams, so a
//! single site-facing WebSocket multiplexes both plain HTTP traffic and any
//! number of tunneled client WebSockets.
//!
//! Cross-node WebSocket upgrades are not proxied: a peer node can forward a
//! plain HTTP request-response over its own HTTP client (see `http.rs`), but
//! there is no equivalent one-shot primitive for a long-lived duplex byte
//! stream. Only the node that holds the site's tunnel serves WS upgrades for
//! it; `SiteLocation::Peer` is reported as `SiteOffline` here (an Open
//! Question resolved this way — see the design notes).

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use super::SiteLocation;
use crate::dispatch;
use crate::errors::DispatchError;
use crate::state::AppState;
use crate::tunnel::protocol::Frame;
use crate::tunnel::request_tracker::{InFlightRequest, ResponseEvent};
use crate::tunnel::ws_tracker::TunneledWebSocket;
use crate::tunnel::TunnelHandle;

/// How long to wait for the site's confirmatory `responseHeader(id, 101,
/// ...)` before giving up on the upgrade (§4.H). Reuses the same budget as a
/// plain request header wait rather than inventing a separate config knob.
const UPGRADE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(20);

#[instrument(skip(app, req))]
pub async fn dispatch(State(app): State<Arc<AppState>>, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();

    let principal = match dispatch::authenticate(&app, &parts.headers).await {
        Ok(principal) => principal,
        Err(e) => return e.into_response(),
    };
    let site = match dispatch::resolve_site(&app, principal.account_id()).await {
        Ok(site) => site,
        Err(e) => return e.into_response(),
    };
    let location = match dispatch::locate(&app, site.id).await {
        Ok(loc) => loc,
        Err(e) => return e.into_response(),
    };

    let handle = match location {
        SiteLocation::Local(handle) => handle,
        SiteLocation::Peer(_) => return DispatchError::SiteOffline.into_response(),
        SiteLocation::Offline => return DispatchError::SiteOffline.into_response(),
    };

    let path = super::http::strip_remote_prefix(&parts.uri);
    let method = parts.method.clone();
    let headers = dispatch::headers_to_map(&parts.headers);

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &app).await {
        Ok(upgrade) => upgrade,
        Err(e) => return e.into_response(),
    };

    upgrade.on_upgrade(move |socket| run(socket, handle, method.to_string(), path, headers))
}

async fn run(
    socket: WebSocket,
    handle: Arc<TunnelHandle>,
    method: String,
    path: String,
    headers: std::collections::HashMap<String, String>,
) {
    let id = handle.requests.acquire_id();
    let (confirm_tx, mut confirm_rx) = mpsc::unbounded_channel::<ResponseEvent>();
    handle.requests.add(
        id,
        InFlightRequest {
            sink: confirm_tx,
            created_at: Instant::now(),
            headers_sent: false,
            finished: false,
        },
    );

    let frame = Frame::UpgradeRequest { id, method, url: path, headers };
    if handle.frame_tx.send(frame).is_err() {
        handle.requests.safe_remove(id);
        close_client(socket, "site offline").await;
        return;
    }

    let confirmed = tokio::time::timeout(UPGRADE_CONFIRM_TIMEOUT, async {
        loop {
            match confirm_rx.recv().await {
                Some(ResponseEvent::Header { status, .. }) => return status == 101,
                Some(ResponseEvent::Body(_)) => continue,
                Some(ResponseEvent::Finished) | Some(ResponseEvent::TimedOut) | None => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    handle.requests.safe_remove(id);

    if !confirmed {
        warn!(site_id = handle.site_id, request_id = id, "site declined websocket upgrade");
        close_client(socket, "upgrade declined").await;
        return;
    }

    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<Message>();
    handle.websockets.add(id, TunneledWebSocket { to_client: to_client_tx, created_at: Instant::now() });

    let (mut client_sink, mut client_stream) = socket.split();

    let forward_to_client = tokio::spawn(async move {
        while let Some(message) = to_client_rx.recv().await {
            if client_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        match client_stream.next().await {
            Some(Ok(Message::Binary(bytes))) => {
                let frame = Frame::RequestBodyContinuation { id, bytes: Frame::encode_body(&bytes) };
                if handle.frame_tx.send(frame).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Text(text))) => {
                let frame = Frame::RequestBodyContinuation { id, bytes: Frame::encode_body(text.as_bytes()) };
                if handle.frame_tx.send(frame).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // ping/pong frames at the transport level; no app-level meaning for a tunneled socket
            Some(Err(e)) => {
                warn!(site_id = handle.site_id, request_id = id, error = %e, "client websocket transport error");
                break;
            }
        }
    }

    let _ = handle.frame_tx.send(Frame::WsClose { id });
    handle.websockets.remove(id);
    forward_to_client.abort();
}

async fn close_client(socket: WebSocket, reason: &'static str) {
    use axum::extract::ws::CloseFrame;
    let (mut sink, _stream) = socket.split();
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: reason.into(),
        })))
        .await;
}
