use flow_collab::app::{create_app, AppState, Collaborators};
use flow_collab::config::Config;
use flow_collab::db::{InMemoryStore, PgStore};
use std::panic;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "flow_collab=debug,tower_http=debug,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Initialize database connection if URL is provided
    let collaborators = match &config.db_url {
        Some(db_url) => match PgStore::connect(db_url).await {
            Ok(store) => {
                info!("Database initialized successfully");
                Collaborators::postgres(store)
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            warn!("No database URL configured - documents are kept in memory only");
            Collaborators::in_memory(Arc::new(InMemoryStore::new()))
        }
    };

    let address = config.server_address();
    let state = AppState::new(config, collaborators);
    enable_fanout(&state).await;
    state.start_background();

    let app_routes = create_app(state.clone());

    // Start the HTTP/API server
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", address));

    info!("🚀 Server running on http://{}", address);
    info!("📡 WebSocket available at ws://{}/ws", address);
    info!("📚 OpenAPI spec available at http://{}/api-docs/openapi.json", address);

    let signal_state = state.clone();
    let serve = axum::serve(listener, app_routes).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        // Upgraded sockets hold the server open until they close
        signal_state.pool.shutdown();
    });
    if let Err(e) = serve.await {
        error!("Server error: {}", e);
    }

    state.shutdown().await;
    info!("Server stopped");
}

#[cfg(feature = "redis")]
async fn enable_fanout(state: &AppState) {
    use flow_collab::ws::RedisPubSub;

    let Some(url) = state.config.redis_url.clone() else {
        info!("REDIS_URL not set - running in single-instance mode");
        return;
    };
    match RedisPubSub::new(&url) {
        Ok(transport) => {
            state.enable_distributed(Arc::new(transport)).await;
        }
        Err(e) => error!("Invalid Redis configuration, running in single-instance mode: {}", e),
    }
}

#[cfg(not(feature = "redis"))]
async fn enable_fanout(state: &AppState) {
    if state.config.redis_url.is_some() {
        warn!("REDIS_URL is set but the server was built without the `redis` feature");
    }
    info!("Running in single-instance mode");
}
