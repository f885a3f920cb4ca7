use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, warn};

use crate::app::AppState;
use crate::models::{ErrorResponse, HealthResponse};

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint. Fails while the database cannot be reached.
pub async fn ready_check(
    State(app): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Readiness check requested");
    if let Some(db) = &app.database {
        if let Err(e) = db.ping().await {
            warn!("Readiness check failed: {}", e);
            return Err(ErrorResponse::with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                "Database unavailable",
            ));
        }
    }
    let message = if app.rooms.is_distributed() {
        "Service is ready"
    } else {
        "Service is ready (single instance)"
    };
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        message: message.to_string(),
    }))
}
