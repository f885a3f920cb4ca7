use axum::{http::HeaderValue, routing::get, Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;

use crate::auth::auth::JwtAuthenticator;
use crate::config::Config;
use crate::db::{AccessChecker, DocumentStore, EventLog, InMemoryEventLog, InMemoryStore, PgStore, ScopeAccessChecker};
use crate::docs::ApiDoc;
use crate::routes::create_api_routes;
use crate::services::{CollabService, DocStateService, PresenceService};
use crate::websocket::{websocket_handler, EventRouter};
use crate::ws::{PoolManager, PubSubTransport, RoomManager};

/// The persistence collaborators the core runs against
#[derive(Clone)]
pub struct Collaborators {
    pub documents: Arc<dyn DocumentStore>,
    pub events: Arc<dyn EventLog>,
    pub database: Option<Arc<PgStore>>,
}

impl Collaborators {
    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            documents: store.clone(),
            events: store.clone(),
            database: Some(store),
        }
    }

    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            documents: store,
            events: Arc::new(InMemoryEventLog::new()),
            database: None,
        }
    }
}

/// Everything a request or socket handler needs, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub authenticator: Arc<JwtAuthenticator>,
    pub rooms: Arc<RoomManager>,
    pub pool: Arc<PoolManager>,
    pub presence: Arc<PresenceService>,
    pub state: Arc<DocStateService>,
    pub collab: Arc<CollabService>,
    pub router: Arc<EventRouter>,
    pub database: Option<Arc<PgStore>>,
}

impl AppState {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let authenticator = Arc::new(JwtAuthenticator::new(
            config.jwt_auth_token_secret.clone(),
            config.jwt_audience.clone(),
            config.jwt_issuer.clone(),
        ));
        if config.jwt_auth_token_secret.is_none() {
            warn!("JWT_AUTH_TOKEN_SECRET not set - every WebSocket connection will be rejected");
        }

        let access: Arc<dyn AccessChecker> = Arc::new(ScopeAccessChecker::new(
            collaborators.documents.clone(),
            Duration::from_secs(config.access_cache_ttl_secs),
        ));
        let rooms = Arc::new(RoomManager::new(config.resolved_instance_id()));
        let pool = Arc::new(PoolManager::new(config.pool_config()));
        let presence = Arc::new(PresenceService::new(rooms.clone(), access, config.presence_config()));
        let state = Arc::new(DocStateService::new(collaborators.documents, config.state_config()));
        let collab = Arc::new(CollabService::new(rooms.clone(), state.clone(), collaborators.events));
        let router = Arc::new(EventRouter::new(
            rooms.clone(),
            presence.clone(),
            collab.clone(),
            config.max_message_bytes,
        ));

        Self {
            config: Arc::new(config),
            authenticator,
            rooms,
            pool,
            presence,
            state,
            collab,
            router,
            database: collaborators.database,
        }
    }

    /// Connect the room manager to other instances. On failure the instance
    /// keeps serving its local rooms only.
    pub async fn enable_distributed(&self, transport: Arc<dyn PubSubTransport>) -> bool {
        self.rooms
            .enable_distributed(transport, self.config.transport_max_retries)
            .await
    }

    /// Start the flush, idle sweep and pool cleanup timers
    pub fn start_background(&self) {
        self.state.spawn_flush_loop();
        self.presence.spawn_idle_sweep();
        self.pool.spawn_cleanup();
    }

    /// Stop every timer, close sockets, then save what is still dirty
    pub async fn shutdown(&self) {
        info!("Shutting down collaboration services...");
        self.state.shutdown().await;
        self.presence.shutdown();
        self.pool.shutdown();

        let report = self.state.flush_dirty().await;
        if !report.failed.is_empty() {
            warn!("{} documents could not be saved on shutdown: {:?}", report.failed.len(), report.failed);
        }
        info!("Final flush saved {} documents", report.saved.len());

        self.rooms.shutdown();
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| o.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Build the HTTP + WebSocket router
pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/ws", get(websocket_handler))
        // Mount API routes
        .nest("/api", create_api_routes(state.clone()))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .layer(cors)
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
