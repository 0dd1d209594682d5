//! Shared authentication/resolution plumbing for HTTPDispatcher (component
//! G) and WSDispatcher (component H). Both are stateless callers that
//! borrow a `TunnelHandle` for the duration of one request (§3's ownership
//! summary); neither owns any session state itself.

pub mod http;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::directory::{OAuthClient, Site, User};
use crate::errors::{AuthError, DispatchError};
use crate::state::AppState;
use crate::tunnel::TunnelHandle;

/// Name of the session cookie an external sign-in page (out of core, §1)
/// is expected to set. Validating it is this crate's job; issuing it isn't.
pub const SESSION_COOKIE_NAME: &str = "ohc.sid";

/// Either side of the auth chain's three validators can terminate a
/// request: a human user (cookie or Basic or Bearer) or a confidential
/// OAuth2 client acting on its own account's behalf (§4.J).
pub enum Principal {
    User(User),
    OAuthClient(OAuthClient),
}

impl Principal {
    pub fn account_id(&self) -> i64 {
        match self {
            Principal::User(u) => u.account_id,
            Principal::OAuthClient(c) => c.account_id,
        }
    }
}

/// Headers that only make sense on the hop they were set for; stripped in
/// both directions so the proxied exchange doesn't inherit a mismatched
/// transport's framing.
pub(crate) const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str().to_lowercase().as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

pub fn map_to_headers(map: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in map {
        if HOP_BY_HOP.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name.as_str()),
            axum::http::HeaderValue::try_from(value.as_str()),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

/// Session cookie, then Basic (falling back to an OAuth2 confidential
/// client if the Basic credentials aren't a user account), then Bearer
/// (§4.G step 1, §4.J). Issuing the session cookie is the external sign-in
/// page's job (out of core, §1) — this only ever validates one handed back.
pub async fn authenticate(app: &AppState, headers: &HeaderMap) -> Result<Principal, DispatchError> {
    let gateway = crate::auth::AuthGateway::new(app.directory.clone(), app.sessions.clone());

    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
        let user = gateway
            .authenticate_cookie(cookie.value())
            .await
            .map_err(DispatchError::Auth)?;
        return Ok(Principal::User(user));
    }

    if let Some(auth_header) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(encoded) = auth_header.strip_prefix("Basic ") {
            let decoded = BASE64
                .decode(encoded.trim())
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
                .ok_or(AuthError::MissingCredentials)?;
            let (identifier, secret) = decoded
                .split_once(':')
                .ok_or(AuthError::MissingCredentials)?;
            return match gateway.authenticate_basic(identifier, secret).await {
                Ok(user) => Ok(Principal::User(user)),
                Err(AuthError::InvalidCredentials) => gateway
                    .authenticate_oauth_client(identifier, secret)
                    .await
                    .map(Principal::OAuthClient)
                    .map_err(DispatchError::Auth),
                Err(e) => Err(DispatchError::Auth(e)),
            };
        }
        if let Some(token) = auth_header.strip_prefix("Bearer ") {
            let (user, _scopes) = gateway
                .authenticate_bearer(token)
                .await
                .map_err(DispatchError::Auth)?;
            return Ok(Principal::User(user));
        }
    }
    Err(DispatchError::Auth(AuthError::MissingCredentials))
}

/// Every account has at most one site in this deployment (§3); absence is
/// an invariant violation, not a normal "not found".
pub async fn resolve_site(app: &AppState, account_id: i64) -> Result<Site, DispatchError> {
    app.directory
        .find_site_for_account(account_id)
        .await
        .map_err(|_| DispatchError::DirectoryUnavailable)?
        .ok_or(DispatchError::NoSiteForAccount)
}

pub enum SiteLocation {
    Local(Arc<TunnelHandle>),
    Peer(String),
    Offline,
}

/// Checks this node's own session registry first (cheap, no store round
/// trip); falls back to `peekLock` only when the site isn't owned locally,
/// which is also how a peer node discovers a redirect/proxy target.
pub async fn locate(app: &AppState, site_id: i64) -> Result<SiteLocation, DispatchError> {
    if let Some(handle) = app.local_sessions.get(&site_id) {
        return Ok(SiteLocation::Local(handle.clone()));
    }
    let lock = crate::store::retry_once(|| app.connection_manager.peek_lock(site_id))
        .await
        .map_err(|_| DispatchError::StoreUnavailable)?;
    match lock {
        Some(lock) => Ok(SiteLocation::Peer(lock.node_address)),
        None => Ok(SiteLocation::Offline),
    }
}

/// Public listener entry point: every client request, proxied or upgraded,
/// lands here first. Routed to WSDispatcher when the request carries the
/// `Connection: Upgrade` / `Upgrade: websocket` pair (§6 "Upgrade... triggers
/// WSDispatcher"), otherwise to HTTPDispatcher. A single fallback route
/// (rather than a dedicated axum route per dispatcher) is used because the
/// upgrade can arrive on any proxied path, not just a fixed one.
pub async fn entry(State(app): State<Arc<AppState>>, req: axum::extract::Request) -> axum::response::Response {
    if is_websocket_upgrade(req.headers()) {
        ws::dispatch(State(app), req).await
    } else {
        http::dispatch(State(app), req).await
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade_token = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let is_websocket = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    has_upgrade_token && is_websocket
}
