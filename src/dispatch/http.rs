//! HTTPDispatcher (component G): authenticates the user, resolves the
//! site, forwards across the correct TunnelSession (local) or proxies to a
//! peer node, and streams the response back.
//!
//! The redirect-vs-proxy tradeoff in §4.G is resolved in favor of
//! server-side proxying for every method, not just a 302 for GET-equivalent
//! traffic: a redirect can't preserve a non-idempotent request body, and
//! this dispatcher has no way to know in advance which of a site's routes
//! are idempotent, so it always proxies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tower::timeout::TimeoutLayer;
use tower::util::ServiceExt;
use tower::ServiceBuilder;
use tracing::{instrument, warn};

use super::{HOP_BY_HOP, SiteLocation};
use crate::dispatch;
use crate::errors::DispatchError;
use crate::state::AppState;
use crate::tunnel::protocol::Frame;
use crate::tunnel::request_tracker::{InFlightRequest, ResponseEvent};
use crate::tunnel::TunnelHandle;

const REMOTE_PREFIX: &str = "/remote";

/// Strips the optional `/remote` prefix the client-facing listener uses to
/// namespace proxied traffic (§6). Paths without the prefix pass through
/// unchanged — the prefix is optional, not mandatory.
pub fn strip_remote_prefix(uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    match path_and_query.strip_prefix(REMOTE_PREFIX) {
        Some(rest) if rest.is_empty() => "/".to_string(),
        Some(rest) if rest.starts_with('/') || rest.starts_with('?') => rest.to_string(),
        _ => path_and_query.to_string(),
    }
}

#[instrument(skip(app, req))]
pub async fn dispatch(State(app): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

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

    let path = strip_remote_prefix(&parts.uri);

    match location {
        SiteLocation::Offline => DispatchError::SiteOffline.into_response(),
        SiteLocation::Local(handle) => {
            forward_local(&app, &handle, parts.method, &path, parts.headers, body).await
        }
        SiteLocation::Peer(node_address) => {
            forward_peer(&app, &node_address, parts.method, &path, parts.headers, body).await
        }
    }
}

/// Keeps the InFlightRequest's cancel contract: if this guard drops before
/// `finish()` is called, the client gave up (write error, disconnect, or a
/// dropped streaming body) before `responseFinished` arrived. §4.G step 4d:
/// send `cancel(id)`, leave the entry flagged finished for the sweeper.
struct RequestGuard {
    handle: Arc<TunnelHandle>,
    id: u64,
    done: bool,
}

impl RequestGuard {
    fn finish(&mut self) {
        self.done = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.handle.frame_tx.send(Frame::Cancel { id: self.id });
            let _ = self.handle.requests.mark_finished(self.id);
        }
    }
}

async fn forward_local(
    app: &AppState,
    handle: &Arc<TunnelHandle>,
    method: Method,
    path: &str,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(site_id = handle.site_id, error = %e, "failed to read client request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let id = handle.requests.acquire_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<ResponseEvent>();
    handle.requests.add(
        id,
        InFlightRequest {
            sink: tx,
            created_at: Instant::now(),
            headers_sent: false,
            finished: false,
        },
    );

    let frame = Frame::Request {
        id,
        method: method.to_string(),
        url: path.to_string(),
        headers: dispatch::headers_to_map(&headers),
        body: if body_bytes.is_empty() {
            None
        } else {
            Some(Frame::encode_body(&body_bytes))
        },
    };
    if handle.frame_tx.send(frame).is_err() {
        handle.requests.safe_remove(id);
        return DispatchError::SiteOffline.into_response();
    }

    let max_age = app.config.request_max_age();
    let guard = RequestGuard {
        handle: handle.clone(),
        id,
        done: false,
    };

    match await_header(&mut rx, max_age).await {
        HeaderWait::Ready(status, resp_headers) => {
            build_streaming_response(status, resp_headers, rx, guard)
        }
        HeaderWait::Ended => {
            drop(guard);
            handle.requests.safe_remove(id);
            DispatchError::SiteOffline.into_response()
        }
        HeaderWait::TimedOut => {
            drop(guard);
            handle.requests.safe_remove(id);
            DispatchError::TunnelTimeout.into_response()
        }
    }
}

enum HeaderWait {
    Ready(u16, std::collections::HashMap<String, String>),
    Ended,
    TimedOut,
}

async fn await_header(rx: &mut mpsc::UnboundedReceiver<ResponseEvent>, max_age: Duration) -> HeaderWait {
    let wait = tokio::time::timeout(max_age, async {
        loop {
            match rx.recv().await {
                Some(ResponseEvent::Header { status, headers }) => return Some((status, headers)),
                Some(ResponseEvent::Body(_)) => continue, // arrived before header; defensive, keep waiting
                Some(ResponseEvent::Finished) | Some(ResponseEvent::TimedOut) | None => return None,
            }
        }
    })
    .await;

    match wait {
        Ok(Some((status, headers))) => HeaderWait::Ready(status, headers),
        Ok(None) => HeaderWait::Ended,
        Err(_) => HeaderWait::TimedOut,
    }
}

fn build_streaming_response(
    status: u16,
    resp_headers: std::collections::HashMap<String, String>,
    rx: mpsc::UnboundedReceiver<ResponseEvent>,
    guard: RequestGuard,
) -> Response {
    let body_stream = stream::unfold((rx, guard), |(mut rx, mut guard)| async move {
        loop {
            match rx.recv().await {
                Some(ResponseEvent::Body(bytes)) => {
                    return Some((Ok::<Bytes, std::io::Error>(Bytes::from(bytes)), (rx, guard)));
                }
                Some(ResponseEvent::Finished) => {
                    guard.finish();
                    let _ = guard.handle.requests.safe_remove(guard.id);
                    return None;
                }
                Some(ResponseEvent::TimedOut) => {
                    guard.finish();
                    return None;
                }
                // A second responseHeader for this id is a protocol
                // violation (§4.G: "drop the second"); never reaches here
                // because the site-facing loop only emits Header once per
                // id before this stream is built, but keep looping
                // defensively rather than ending the stream on it.
                Some(ResponseEvent::Header { .. }) => continue,
                None => return None,
            }
        }
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = dispatch::map_to_headers(&resp_headers);
    response
}

async fn forward_peer(
    app: &AppState,
    node_address: &str,
    method: Method,
    path: &str,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(node_address, error = %e, "failed to read client request body for peer proxy");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let url = match url::Url::parse(node_address).and_then(|base| base.join(path)) {
        Ok(url) => url,
        Err(e) => {
            warn!(node_address, path, error = %e, "peer node_address/path did not form a valid url");
            return DispatchError::SiteOffline.into_response();
        }
    };

    let mut builder = app.http_client.request(reqwest_method, url);
    for (name, value) in dispatch::headers_to_map(&headers) {
        builder = builder.header(name, value);
    }
    let request = match builder.body(body_bytes).build() {
        Ok(request) => request,
        Err(e) => {
            warn!(node_address, error = %e, "failed to build peer proxy request");
            return DispatchError::SiteOffline.into_response();
        }
    };

    let client = app.http_client.clone();
    let peer_service = ServiceBuilder::new()
        .layer(TimeoutLayer::new(app.config.request_max_age()))
        .service(tower::util::service_fn(move |req: reqwest::Request| {
            let client = client.clone();
            async move { client.execute(req).await }
        }));

    match peer_service.oneshot(request).await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut out_headers = HeaderMap::new();
            for (name, value) in resp.headers() {
                if HOP_BY_HOP.contains(&name.as_str().to_lowercase().as_str()) {
                    continue;
                }
                if let (Ok(n), Ok(v)) = (
                    axum::http::HeaderName::try_from(name.as_str()),
                    axum::http::HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    out_headers.insert(n, v);
                }
            }
            let body = Body::from_stream(resp.bytes_stream());
            let mut out = Response::new(body);
            *out.status_mut() = status;
            *out.headers_mut() = out_headers;
            out
        }
        Err(e) => {
            warn!(node_address, error = %e, "peer proxy request failed");
            DispatchError::SiteOffline.into_response()
        }
    }
}
