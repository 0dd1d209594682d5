//! End-to-end scenarios from the design doc's testable-properties section,
//! driven against a real bound listener: a genuine WebSocket tunnel client
//! standing in for a site, and `reqwest` standing in for an Internet client.
//! Everything below talks to the actual `axum::Router` this crate serves in
//! production — no mocked dispatcher, no fabricated frames bypassing the
//! wire format.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use openhab_tunnel_gateway::auth::{hash_password, EmptySessionStore};
use openhab_tunnel_gateway::config::Config;
use openhab_tunnel_gateway::connection::ConnectionManager;
use openhab_tunnel_gateway::directory::memory::InMemoryDirectory;
use openhab_tunnel_gateway::directory::{Directory, Site, User};
use openhab_tunnel_gateway::notification::fcm::{EmptyDeviceTokenStore, FcmProvider, PushProvider};
use openhab_tunnel_gateway::state::AppState;
use openhab_tunnel_gateway::store::memory::MemoryStore;
use openhab_tunnel_gateway::{dispatch, tunnel};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

struct TestGateway {
    base_url: String,
    directory: Arc<InMemoryDirectory>,
}

impl TestGateway {
    fn ws_url(&self, path_and_query: &str) -> String {
        format!("{}{path_and_query}", self.base_url.replacen("http://", "ws://", 1))
    }
}

/// Boots the real public router (the same wiring `app::run` assembles) on an
/// ephemeral loopback port backed by the in-memory store/directory doubles.
async fn spawn_gateway() -> TestGateway {
    spawn_gateway_with_extra_args(&[]).await
}

async fn spawn_gateway_with_extra_args(extra: &[&str]) -> TestGateway {
    let mut args = vec![
        "tunnel-gateway",
        "--node-address",
        "http://node-under-test.local",
        "--store-connection",
        "memory://",
        "--directory-connection",
        "memory://",
    ];
    args.extend_from_slice(extra);
    let config = Arc::new(Config::parse_from(args));

    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let connection_manager = Arc::new(ConnectionManager::new(
        store.clone(),
        config.connection_lock_ttl(),
        config.block_ttl(),
    ));
    let push_provider: Arc<dyn PushProvider> = Arc::new(FcmProvider::new(
        reqwest::Client::new(),
        None,
        Arc::new(EmptyDeviceTokenStore),
    ));

    let app_state = Arc::new(AppState::new(
        config,
        directory.clone() as Arc<dyn Directory>,
        store,
        connection_manager,
        push_provider,
        Arc::new(EmptySessionStore),
    ));

    let router = Router::new()
        .route("/tunnel", get(tunnel::accept))
        .fallback(dispatch::entry)
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binds an ephemeral loopback port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestGateway {
        base_url: format!("http://{addr}"),
        directory,
    }
}

async fn register_user_and_site(gw: &TestGateway, account_id: i64, site_uuid: Uuid, secret: &str) {
    gw.directory
        .insert_user(User {
            id: account_id,
            account_id,
            username: "alice".to_string(),
            password_hash: Some(hash_password("correct horse")),
            active: true,
            verified_email: true,
        })
        .await;
    gw.directory
        .insert_site(Site {
            id: account_id,
            uuid: site_uuid,
            secret_hash: hash_password(secret),
            account_id,
            last_online: None,
        })
        .await;
}

#[tokio::test]
async fn unauthenticated_client_request_is_rejected() {
    let gw = spawn_gateway().await;
    let response = reqwest::Client::new()
        .get(format!("{}/rest/items", gw.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

/// Scenario 3 in the design doc: the site never connects a tunnel, so the
/// dispatcher has no session and no peer lock to route to.
#[tokio::test]
async fn authenticated_user_with_no_connected_site_sees_offline() {
    let gw = spawn_gateway().await;
    register_user_and_site(&gw, 1, Uuid::new_v4(), "tunnel-secret").await;

    let response = reqwest::Client::new()
        .get(format!("{}/rest/items", gw.base_url))
        .basic_auth("alice", Some("correct horse"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "site offline");
}

/// Scenario 5: a wrong-secret handshake is rejected with the generic
/// "invalid credentials" outcome, and a second attempt within `blockTTL` is
/// rejected purely on the rate-limit check, before any directory lookup.
#[tokio::test]
async fn repeated_bad_tunnel_credentials_are_rate_limited() {
    let gw = spawn_gateway().await;
    let site_uuid = Uuid::new_v4();
    gw.directory
        .insert_site(Site {
            id: 2,
            uuid: site_uuid,
            secret_hash: hash_password("the-real-secret"),
            account_id: 2,
            last_online: None,
        })
        .await;

    let url = gw.ws_url(&format!("/tunnel?uuid={site_uuid}&secret=wrong&version=1"));

    let first_attempt = tokio_tungstenite::connect_async(&url).await;
    let first_status = match first_attempt {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => response.status(),
        other => panic!("expected the handshake to be rejected at the HTTP layer, got {other:?}"),
    };
    assert_eq!(first_status, axum::http::StatusCode::UNAUTHORIZED);

    let second_attempt = tokio_tungstenite::connect_async(&url).await;
    let second_status = match second_attempt {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => response.status(),
        other => panic!("expected the handshake to be rejected at the HTTP layer, got {other:?}"),
    };
    assert_eq!(second_status, axum::http::StatusCode::TOO_MANY_REQUESTS);
}

/// Scenario 2 (takeover): a second tunnel handshake with the same site
/// credentials is closed with "already connected" while the first stays up.
#[tokio::test]
async fn second_tunnel_connection_is_closed_already_connected() {
    let gw = spawn_gateway().await;
    let site_uuid = Uuid::new_v4();
    register_user_and_site(&gw, 3, site_uuid, "tunnel-secret").await;
    let url = gw.ws_url(&format!("/tunnel?uuid={site_uuid}&secret=tunnel-secret&version=1"));

    let (mut first, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("first connection acquires the lock and upgrades");

    let (mut second, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("second connection also upgrades before being closed");

    let closing = tokio::time::timeout(Duration::from_secs(2), second.next())
        .await
        .expect("second connection should receive a frame before the test timeout")
        .expect("stream yields an item")
        .expect("not a transport error");
    assert!(closing.is_close());
    let debug = format!("{closing:?}");
    assert!(
        debug.contains("already connected"),
        "expected the close reason to mention the takeover, got: {debug}"
    );

    // The first connection is untouched by the second's rejection.
    let first_still_open = tokio::time::timeout(Duration::from_millis(300), first.next()).await;
    assert!(
        first_still_open.is_err(),
        "first connection should still be open while the second is rejected"
    );

    let _ = first.close(None).await;
}

/// Scenario 1 (happy path): a client request is framed across the tunnel,
/// answered by the simulated site, and streamed back to the client.
#[tokio::test]
async fn happy_path_request_round_trips_through_the_tunnel() {
    let gw = spawn_gateway().await;
    let site_uuid = Uuid::new_v4();
    register_user_and_site(&gw, 4, site_uuid, "tunnel-secret").await;
    let url = gw.ws_url(&format!("/tunnel?uuid={site_uuid}&secret=tunnel-secret&version=1"));

    let (mut site, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("site tunnel connects");

    let client = reqwest::Client::new();
    let request_future = client
        .get(format!("{}/rest/items", gw.base_url))
        .basic_auth("alice", Some("correct horse"))
        .send();

    let forwarded = tokio::time::timeout(Duration::from_secs(2), site.next())
        .await
        .expect("site should observe the forwarded request frame")
        .expect("stream yields an item")
        .expect("not a transport error");
    let frame: serde_json::Value =
        serde_json::from_str(forwarded.to_text().expect("frame is text")).unwrap();
    assert_eq!(frame["type"], "request");
    assert_eq!(frame["method"], "GET");
    assert_eq!(frame["url"], "/rest/items");
    let id = frame["id"].as_u64().unwrap();

    site.send(Message::text(format!(
        r#"{{"type":"responseHeader","id":{id},"status":200,"headers":{{"content-type":"application/json"}}}}"#
    )))
    .await
    .unwrap();
    site.send(Message::text(format!(
        r#"{{"type":"responseBody","id":{id},"bytes":"{}"}}"#,
        BASE64.encode(b"[]")
    )))
    .await
    .unwrap();
    site.send(Message::text(format!(r#"{{"type":"responseFinished","id":{id}}}"#)))
        .await
        .unwrap();

    let response = request_future.await.expect("client request completes");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let body = response.text().await.unwrap();
    assert_eq!(body, "[]");
}

/// Scenario 4 (timeout): if the site never answers, `await_header`'s own
/// `request_max_age` deadline fires and the client sees a 504 rather than
/// hanging forever. Uses a 1-second `request-max-age` so this resolves well
/// inside the test timeout instead of waiting out the real 120s default.
#[tokio::test]
async fn unanswered_request_times_out_with_504() {
    let gw = spawn_gateway_with_extra_args(&["--request-max-age", "1"]).await;
    let site_uuid = Uuid::new_v4();
    register_user_and_site(&gw, 5, site_uuid, "tunnel-secret").await;
    let ws_url = gw.ws_url(&format!("/tunnel?uuid={site_uuid}&secret=tunnel-secret&version=1"));

    let (_site, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("site tunnel connects");

    // The site never answers; `await_header`'s 1s `request_max_age` deadline
    // fails the request well before this generous outer test timeout.
    let response = tokio::time::timeout(
        Duration::from_secs(10),
        reqwest::Client::new()
            .get(format!("{}/rest/items", gw.base_url))
            .basic_auth("alice", Some("correct horse"))
            .send(),
    )
    .await
    .expect("dispatcher should resolve before the test timeout")
    .expect("request completes with a response, not a transport error");

    assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
}
