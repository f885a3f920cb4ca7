use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{debug, error};

use crate::app::AppState;
use crate::auth::auth::{get_auth_token, AuthError};

/// Require a valid login token and expose the `AuthUser` to downstream handlers
pub async fn auth_middleware(
    State(app): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // 1. Get the auth token from the request
    let token = get_auth_token(req.headers(), req.uri().query());

    // 2. Validate Token
    let user = match app.authenticator.authenticate(token.as_deref()) {
        Ok(user) => user,
        Err(AuthError::MissingSecret) => {
            error!("JWT secret not configured");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(e) => {
            debug!("Rejected API request: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    // 3. Set the user into request extensions for downstream handlers
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
