//! Error taxonomy for the gateway's client-facing boundaries.
//!
//! Each enum here maps to the table in the design doc: a fixed set of
//! observable failure kinds, not exception types. Internal-only causes
//! (takeover, malformed frames) never appear here — they are handled
//! entirely inside the component that raises them and never reach a client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown user or incorrect password")]
    InvalidCredentials,
    #[error("account is not active")]
    Inactive,
    #[error("missing or malformed credentials")]
    MissingCredentials,
    #[error("directory unavailable")]
    DirectoryUnavailable,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::DirectoryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        };
        json_error(status, "unauthorized")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("no site registered for this account")]
    NoSiteForAccount,
    #[error("site is offline")]
    SiteOffline,
    #[error("request timed out waiting for the site")]
    TunnelTimeout,
    #[error("directory unavailable")]
    DirectoryUnavailable,
    #[error("shared state store unavailable")]
    StoreUnavailable,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match self {
            DispatchError::Auth(e) => e.into_response(),
            DispatchError::NoSiteForAccount => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "no site for account")
            }
            DispatchError::SiteOffline => json_error(StatusCode::SERVICE_UNAVAILABLE, "site offline"),
            DispatchError::TunnelTimeout => json_error(StatusCode::GATEWAY_TIMEOUT, "tunnel timeout"),
            DispatchError::DirectoryUnavailable | DispatchError::StoreUnavailable => {
                json_error(StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification payload exceeds the configured size limit")]
    PayloadTooLarge,
    #[error("persistence collaborator unavailable")]
    PersistenceUnavailable,
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        match self {
            NotificationError::PayloadTooLarge => {
                json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
            }
            NotificationError::PersistenceUnavailable => {
                json_error(StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable")
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn json_error(status: StatusCode, message: &'static str) -> Response {
    (status, axum::Json(ErrorBody { error: message })).into_response()
}
