//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::EmptySessionStore;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::directory::memory::InMemoryDirectory;
use crate::directory::postgres::PostgresDirectory;
use crate::directory::Directory;
use crate::notification::fcm::{EmptyDeviceTokenStore, FcmProvider, PushProvider};
use crate::state::AppState;
use crate::store::memory::MemoryStore;
use crate::store::redis::RedisStore;
use crate::store::KvStore;
use crate::{admin, dispatch, tunnel};

/// Distinguishes why the process is exiting, per §11's exit-code contract.
#[derive(Debug)]
pub enum StartupError {
    Config(anyhow::Error),
    CollaboratorUnreachable(anyhow::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 2,
            StartupError::CollaboratorUnreachable(_) => 3,
        }
    }
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "configuration error: {e}"),
            StartupError::CollaboratorUnreachable(e) => write!(f, "collaborator unreachable at startup: {e}"),
        }
    }
}

pub async fn run(config: Config) -> Result<(), StartupError> {
    config.validate().map_err(StartupError::Config)?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_address = %config.node_address,
        "tunnel gateway starting"
    );

    let config = Arc::new(config);

    let store = connect_store(&config)
        .await
        .map_err(StartupError::CollaboratorUnreachable)?;
    let directory = connect_directory(&config)
        .await
        .map_err(StartupError::CollaboratorUnreachable)?;

    let connection_manager = Arc::new(ConnectionManager::new(
        store.clone(),
        config.connection_lock_ttl(),
        config.block_ttl(),
    ));

    let push_provider: Arc<dyn PushProvider> = Arc::new(FcmProvider::new(
        reqwest::Client::new(),
        config.fcm_server_key.clone(),
        Arc::new(EmptyDeviceTokenStore),
    ));

    let app_state = Arc::new(AppState::new(
        config.clone(),
        directory.clone(),
        store.clone(),
        connection_manager,
        push_provider,
        Arc::new(EmptySessionStore),
    ));

    // Startup liveness latch (§10): each collaborator must answer its own
    // probe before `/internal/healthz` reports it ready, not merely "the
    // initial connect attempt succeeded" — a collaborator can accept a TCP
    // connection and still fail a query.
    match store.ping().await {
        Ok(()) => app_state.store_ready.store(true, Ordering::Relaxed),
        Err(e) => warn!(error = %e, "store failed its post-connect liveness probe"),
    }
    match directory.ping().await {
        Ok(()) => app_state.directory_ready.store(true, Ordering::Relaxed),
        Err(e) => warn!(error = %e, "directory failed its post-connect liveness probe"),
    }

    let public_router = Router::new()
        .route("/tunnel", get(tunnel::accept))
        .fallback(dispatch::entry)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state.clone());

    let admin_router = admin::router(app_state.clone());

    let public_listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("binding public listener on {}", config.listen_address))
        .map_err(StartupError::CollaboratorUnreachable)?;
    let admin_listener = tokio::net::TcpListener::bind(&config.admin_listen_address)
        .await
        .with_context(|| format!("binding admin listener on {}", config.admin_listen_address))
        .map_err(StartupError::CollaboratorUnreachable)?;

    info!(address = %config.listen_address, "public listener bound");
    info!(address = %config.admin_listen_address, "admin listener bound");

    let (shutdown_tx, _) = tokio::sync::watch::channel(false);

    let public_shutdown = shutdown_signal(shutdown_tx.subscribe());
    let admin_shutdown = shutdown_signal(shutdown_tx.subscribe());

    let public_server = tokio::spawn(async move {
        axum::serve(public_listener, public_router)
            .with_graceful_shutdown(public_shutdown)
            .await
    });
    let admin_server = tokio::spawn(async move {
        axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(admin_shutdown)
            .await
    });

    wait_for_shutdown().await;
    info!("shutdown signal received, draining...");
    let _ = shutdown_tx.send(true);

    // §5: "send close frames to all sessions with reason shutdown". Each
    // session's own shutdown watch drives its writer to send a transport
    // close and its read loop to tear down (release lock, fail in-flight
    // requests with 503, close tunneled websockets) independently of the
    // axum listener drain below.
    let active_sessions: Vec<_> = app_state.local_sessions.iter().map(|e| e.value().clone()).collect();
    info!(count = active_sessions.len(), "signalling active tunnel sessions to close for shutdown");
    for session in active_sessions {
        let _ = session.shutdown.send(true);
    }

    let grace = config.shutdown_grace();
    let drain = async {
        let _ = public_server.await;
        let _ = admin_server.await;
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "graceful shutdown grace period elapsed; exiting anyway");
    }

    info!("tunnel gateway stopped");
    Ok(())
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    if config.store_connection == "memory://" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    retry_with_backoff(config, "store", || {
        let connection = config.store_connection.clone();
        async move {
            let store = RedisStore::connect(&connection).await?;
            Ok::<Arc<dyn KvStore>, anyhow::Error>(Arc::new(store))
        }
    })
    .await
}

async fn connect_directory(config: &Config) -> anyhow::Result<Arc<dyn Directory>> {
    if config.directory_connection == "memory://" {
        return Ok(Arc::new(InMemoryDirectory::new()));
    }
    retry_with_backoff(config, "directory", || {
        let connection = config.directory_connection.clone();
        async move {
            let directory = PostgresDirectory::connect(&connection).await?;
            Ok::<Arc<dyn Directory>, anyhow::Error>(Arc::new(directory))
        }
    })
    .await
}

/// Bounded exponential backoff for the two collaborator connections at
/// startup (§11: "each with a bounded number of connection retries and
/// exponential backoff before giving up").
async fn retry_with_backoff<T, F, Fut>(config: &Config, label: &str, mut connect: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut delay = Duration::from_millis(config.startup_retry_base_delay_ms);
    let max_delay = Duration::from_secs(30);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(value) => {
                info!(collaborator = label, attempt, "connected");
                return Ok(value);
            }
            Err(e) if attempt >= config.startup_retry_attempts => {
                return Err(e).with_context(|| {
                    format!("failed to connect to {label} after {attempt} attempts")
                });
            }
            Err(e) => {
                warn!(collaborator = label, attempt, error = %e, "connection attempt failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
        }
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal(mut rx: tokio::sync::watch::Receiver<bool>) {
    let _ = rx.changed().await;
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
