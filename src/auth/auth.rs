use axum::http::{self, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::AuthUser;
use crate::validation::is_valid_session_id;

pub const TOKEN_COOKIE: &str = "token";
pub const SESSION_COOKIE: &str = "ws_session_id";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No authentication token provided")]
    MissingToken,

    #[error("No JWT secret configured")]
    MissingSecret,

    #[error("JWT validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

/// Claims carried by the login token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    #[serde(alias = "sub")]
    pub id: String,
    #[serde(default, alias = "name")]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub active_workspace_id: Option<String>,
    #[serde(default)]
    pub workspace_ids: Vec<String>,
    pub aud: String,
    pub iss: String,
    pub exp: u64,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        let mut workspace_ids = claims.workspace_ids;
        if let Some(active) = &claims.active_workspace_id {
            if !workspace_ids.contains(active) {
                workspace_ids.push(active.clone());
            }
        }
        AuthUser {
            id: claims.id,
            name: claims.username,
            email: claims.email,
            active_workspace_id: claims.active_workspace_id,
            workspace_ids,
        }
    }
}

fn find_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie_header = headers.get(http::header::COOKIE)?.to_str().ok()?;
    cookie::Cookie::split_parse(cookie_header)
        .flatten()
        .find(|c| c.name() == name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

/// Get the auth token from an upgrade request: cookie, then `?token=`, then a Bearer header
pub fn get_auth_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    // 1. Cookie
    if let Some(token) = find_cookie(headers, TOKEN_COOKIE) {
        return Some(token);
    }

    // 2. Query parameter, for clients that cannot set cookies
    if let Some(token) = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, value)| *key == "token" && !value.is_empty())
            .map(|(_, value)| value.to_string())
    }) {
        return Some(token);
    }

    // 3. Authorization header
    let auth_str = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    auth_str
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .filter(|t| !t.is_empty())
}

/// Session id from the `ws_session_id` cookie, or a generated `server-<millis>-<random>` one
pub fn get_session_id(headers: &HeaderMap) -> String {
    match find_cookie(headers, SESSION_COOKIE) {
        Some(session_id) if is_valid_session_id(&session_id) => session_id,
        other => {
            let generated = format!(
                "server-{}-{}",
                Utc::now().timestamp_millis(),
                &Uuid::new_v4().simple().to_string()[..9]
            );
            if other.is_some() {
                warn!("Ignoring malformed session cookie, generated {}", generated);
            } else {
                debug!("No sessionId in cookie, generated fallback: {}", generated);
            }
            generated
        }
    }
}

// Validate a JWT token and return the token data
pub fn validate_jwt(
    token: &str,
    secret: &str,
    audience: &str,
    issuer: &str,
) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[audience]);
    validation.set_issuer(&[issuer]);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<Claims>(token, &decoding_key, &validation)
}

/// Verifies login tokens with the configured HS256 secret
#[derive(Clone)]
pub struct JwtAuthenticator {
    secret: Option<String>,
    audience: String,
    issuer: String,
}

impl JwtAuthenticator {
    pub fn new(secret: Option<String>, audience: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            secret,
            audience: audience.into(),
            issuer: issuer.into(),
        }
    }

    pub fn authenticate(&self, token: Option<&str>) -> Result<AuthUser, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let secret = self.secret.as_deref().ok_or(AuthError::MissingSecret)?;
        let data = validate_jwt(token, secret, &self.audience, &self.issuer)?;
        Ok(data.claims.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(aud: &str, exp_offset: i64) -> String {
        let claims = Claims {
            id: "u1".to_string(),
            username: Some("Alice".to_string()),
            email: None,
            active_workspace_id: Some("ws-1".to_string()),
            workspace_ids: vec![],
            aud: aud.to_string(),
            iss: "ISSUER".to_string(),
            exp: (Utc::now().timestamp() + exp_offset) as u64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn authenticator() -> JwtAuthenticator {
        JwtAuthenticator::new(Some(SECRET.to_string()), "AUDIENCE", "ISSUER")
    }

    #[test]
    fn valid_token_becomes_user() {
        let user = authenticator().authenticate(Some(&token("AUDIENCE", 3600))).unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.name.as_deref(), Some("Alice"));
        assert!(user.in_scope("ws-1"));
    }

    #[test]
    fn wrong_audience_expired_and_missing_are_rejected() {
        let auth = authenticator();
        assert!(matches!(auth.authenticate(Some(&token("OTHER", 3600))), Err(AuthError::InvalidToken(_))));
        assert!(matches!(auth.authenticate(Some(&token("AUDIENCE", -3600))), Err(AuthError::InvalidToken(_))));
        assert!(matches!(auth.authenticate(None), Err(AuthError::MissingToken)));

        let unconfigured = JwtAuthenticator::new(None, "AUDIENCE", "ISSUER");
        assert!(matches!(
            unconfigured.authenticate(Some("x")),
            Err(AuthError::MissingSecret)
        ));
    }

    #[test]
    fn token_sources_in_priority_order() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(get_auth_token(&headers, None).as_deref(), Some("from-header"));
        assert_eq!(get_auth_token(&headers, Some("a=1&token=from-query")).as_deref(), Some("from-query"));

        headers.insert(http::header::COOKIE, HeaderValue::from_static("other=1; token=from-cookie"));
        assert_eq!(get_auth_token(&headers, Some("token=from-query")).as_deref(), Some("from-cookie"));
        assert_eq!(get_auth_token(&HeaderMap::new(), None), None);
    }

    #[test]
    fn session_cookie_or_generated_id() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::COOKIE, HeaderValue::from_static("ws_session_id=tab-42"));
        assert_eq!(get_session_id(&headers), "tab-42");

        let generated = get_session_id(&HeaderMap::new());
        assert!(generated.starts_with("server-"));
        assert!(is_valid_session_id(&generated));

        headers.insert(http::header::COOKIE, HeaderValue::from_static("ws_session_id=<bad>"));
        assert!(get_session_id(&headers).starts_with("server-"));
    }
}
