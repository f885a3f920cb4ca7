use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifier of this process in the pub/sub fan-out.
    /// Falls back to HOSTNAME, then to a random id.
    pub instance_id: Option<String>,
    pub hostname: Option<String>,

    /// Database URL
    pub db_url: Option<String>,

    /// Redis URL for cross-instance fan-out
    pub redis_url: Option<String>,

    /// JWT settings
    pub jwt_auth_token_secret: Option<String>,
    #[serde(default = "default_jwt_audience")]
    pub jwt_audience: String,
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,

    // Collaboration timings
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: i64,
    #[serde(default = "default_away_timeout_ms")]
    pub away_timeout_ms: i64,

    // Limits
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_transport_max_retries")]
    pub transport_max_retries: u32,
    #[serde(default = "default_ws_max_connections")]
    pub ws_max_connections: usize,
    #[serde(default = "default_ws_max_connections_per_user")]
    pub ws_max_connections_per_user: usize,
    #[serde(default = "default_ws_message_rate_limit")]
    pub ws_message_rate_limit: u32,
    #[serde(default = "default_ws_message_rate_window")]
    pub ws_message_rate_window: u32,
    #[serde(default = "default_access_cache_ttl_secs")]
    pub access_cache_ttl_secs: u64,
}

/// Timings for the document state service
#[derive(Debug, Clone, Copy)]
pub struct StateConfig {
    pub save_interval: Duration,
}

/// Timings for presence tracking. Timeouts are in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub idle_check_interval: Duration,
    pub idle_timeout_ms: i64,
    pub away_timeout_ms: i64,
}

/// Limits enforced per connection by the pool manager
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_connections_per_user: usize,
    pub message_rate_limit: u32,
    pub message_rate_window: u32,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Resolve the pub/sub instance id
    pub fn resolved_instance_id(&self) -> String {
        if let Some(id) = self.instance_id.as_ref().filter(|id| !id.is_empty()) {
            return id.clone();
        }
        match self.hostname.as_ref().filter(|h| !h.is_empty()) {
            Some(host) => format!("ws-{}", host),
            None => format!("ws-{}", &uuid::Uuid::new_v4().simple().to_string()[..9]),
        }
    }

    pub fn state_config(&self) -> StateConfig {
        StateConfig {
            save_interval: Duration::from_millis(self.save_interval_ms),
        }
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            idle_check_interval: Duration::from_millis(self.idle_check_interval_ms),
            idle_timeout_ms: self.idle_timeout_ms,
            away_timeout_ms: self.away_timeout_ms,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.ws_max_connections,
            max_connections_per_user: self.ws_max_connections_per_user,
            message_rate_limit: self.ws_message_rate_limit,
            message_rate_window: self.ws_message_rate_window.max(1),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            instance_id: None,
            hostname: None,
            db_url: None,
            redis_url: None,
            jwt_auth_token_secret: None,
            jwt_audience: default_jwt_audience(),
            jwt_issuer: default_jwt_issuer(),
            save_interval_ms: default_save_interval_ms(),
            idle_check_interval_ms: default_idle_check_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            away_timeout_ms: default_away_timeout_ms(),
            max_message_bytes: default_max_message_bytes(),
            transport_max_retries: default_transport_max_retries(),
            ws_max_connections: default_ws_max_connections(),
            ws_max_connections_per_user: default_ws_max_connections_per_user(),
            ws_message_rate_limit: default_ws_message_rate_limit(),
            ws_message_rate_window: default_ws_message_rate_window(),
            access_cache_ttl_secs: default_access_cache_ttl_secs(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Config::default().state_config()
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Config::default().presence_config()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Config::default().pool_config()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[from] envy::Error),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_jwt_audience() -> String {
    "AUDIENCE".to_string()
}

fn default_jwt_issuer() -> String {
    "ISSUER".to_string()
}

fn default_save_interval_ms() -> u64 {
    5_000
}

fn default_idle_check_interval_ms() -> u64 {
    60_000
}

fn default_idle_timeout_ms() -> i64 {
    60_000
}

fn default_away_timeout_ms() -> i64 {
    300_000
}

fn default_max_message_bytes() -> usize {
    crate::validation::MAX_MESSAGE_BYTES
}

fn default_transport_max_retries() -> u32 {
    3
}

fn default_ws_max_connections() -> usize {
    1000
}

fn default_ws_max_connections_per_user() -> usize {
    10
}

fn default_ws_message_rate_limit() -> u32 {
    100
}

fn default_ws_message_rate_window() -> u32 {
    1
}

fn default_access_cache_ttl_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_collaboration_timings() {
        let config = Config::default();
        assert_eq!(config.presence_config().idle_timeout_ms, 60_000);
        assert_eq!(config.presence_config().away_timeout_ms, 300_000);
        assert_eq!(config.state_config().save_interval, Duration::from_secs(5));
        assert_eq!(config.max_message_bytes, 1024 * 1024);
    }

    #[test]
    fn instance_id_prefers_explicit_then_hostname() {
        let mut config = Config::default();
        config.hostname = Some("pod-7".to_string());
        assert_eq!(config.resolved_instance_id(), "ws-pod-7");

        config.instance_id = Some("custom".to_string());
        assert_eq!(config.resolved_instance_id(), "custom");

        config.instance_id = None;
        config.hostname = None;
        assert!(config.resolved_instance_id().starts_with("ws-"));
    }
}
