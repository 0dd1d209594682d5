//! Tunnel frame protocol.
//!
//! Replaces the source's dynamic event-emitter callbacks with a tagged
//! variant (sum type) carried one-per-WebSocket-message as JSON. Every frame
//! kind is listed here; unknown `type` values deserialize to `Err` and the
//! caller logs-and-drops rather than closing the session (§4.F failure
//! semantics: "Malformed frame: log, drop, do not close the session").
//!
//! Body bytes are base64-encoded in the `bytes` field since the transport is
//! a WebSocket text channel; this is the one place that encoding is chosen,
//! rather than re-deriving it at each call site.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub type RequestId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    #[serde(rename = "request")]
    Request {
        id: RequestId,
        method: String,
        url: String,
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<String>,
    },
    /// The upgrade-request variant of `request`, per §4.H: carries the same
    /// method/url/headers but signals the site to respond with a 101.
    #[serde(rename = "upgradeRequest")]
    UpgradeRequest {
        id: RequestId,
        method: String,
        url: String,
        headers: HashMap<String, String>,
    },
    #[serde(rename = "responseHeader")]
    ResponseHeader {
        id: RequestId,
        status: u16,
        headers: HashMap<String, String>,
    },
    #[serde(rename = "responseBody")]
    ResponseBody { id: RequestId, bytes: String },
    #[serde(rename = "responseFinished")]
    ResponseFinished { id: RequestId },
    #[serde(rename = "requestBodyContinuation")]
    RequestBodyContinuation { id: RequestId, bytes: String },
    #[serde(rename = "cancel")]
    Cancel { id: RequestId },
    #[serde(rename = "wsClose")]
    WsClose { id: RequestId },
    #[serde(rename = "notification")]
    Notification {
        user_id: i64,
        payload: serde_json::Value,
    },
    #[serde(rename = "itemupdate")]
    ItemUpdate {
        name: String,
        value: serde_json::Value,
    },
    #[serde(rename = "command")]
    Command {
        name: String,
        value: serde_json::Value,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl Frame {
    pub fn encode_body(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    pub fn decode_body(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(encoded)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Frame serializes infallibly")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
