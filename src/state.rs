//! Shared application state passed to every handler and background task.
//!
//! Process-wide state is deliberately narrow, per the re-architecture note
//! in the design doc: the configured listeners, the sweep-job scheduler, and
//! the shutdown signal are the only things that live outside an explicit
//! constructor parameter. Everything else — store client, directory client,
//! push provider — is threaded through as an `Arc` so every component's
//! dependencies are visible in its constructor rather than reached for via a
//! global.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dashmap::DashMap;

use crate::auth::SessionStore;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::directory::Directory;
use crate::metrics::Metrics;
use crate::notification::fcm::PushProvider;
use crate::notification::NotificationService;
use crate::store::KvStore;
use crate::tunnel::session::TunnelHandle;

pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<dyn Directory>,
    pub store: Arc<dyn KvStore>,
    pub connection_manager: Arc<ConnectionManager>,
    pub notifications: Arc<NotificationService>,
    pub sessions: Arc<dyn SessionStore>,
    pub http_client: reqwest::Client,
    pub metrics: Arc<Metrics>,
    /// Latched true the first time the store/directory each answer a
    /// liveness probe after startup; read by `/internal/healthz` (§10).
    pub store_ready: Arc<AtomicBool>,
    pub directory_ready: Arc<AtomicBool>,
    /// Sessions owned by this node, keyed by site id. HTTPDispatcher and
    /// WSDispatcher consult this before falling back to a peer redirect.
    pub local_sessions: DashMap<i64, Arc<TunnelHandle>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        directory: Arc<dyn Directory>,
        store: Arc<dyn KvStore>,
        connection_manager: Arc<ConnectionManager>,
        push_provider: Arc<dyn PushProvider>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .build()
            .expect("reqwest client builds with default settings");
        let notifications = Arc::new(NotificationService::new(
            push_provider,
            config.max_notification_payload_bytes,
        ));
        Self {
            config,
            directory,
            store,
            connection_manager,
            notifications,
            sessions,
            http_client,
            metrics: Arc::new(Metrics::new()),
            store_ready: Arc::new(AtomicBool::new(false)),
            directory_ready: Arc::new(AtomicBool::new(false)),
            local_sessions: DashMap::new(),
        }
    }

    /// Total in-flight client requests across every session this node owns,
    /// for the metrics gauge.
    pub fn in_flight_requests(&self) -> usize {
        self.local_sessions.iter().map(|entry| entry.value().requests.len()).sum()
    }
}
