use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connctx::{ConnCtx, ConnId};
use crate::config::PoolConfig;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const STALE_THRESHOLD: Duration = Duration::from_secs(3600);

/// Why a new connection was turned away
#[derive(Debug, Error, PartialEq)]
pub enum AdmissionError {
    #[error("Server at maximum capacity. Please try again later.")]
    ServerFull,

    #[error("Maximum {0} connections per user exceeded.")]
    UserLimit(usize),

    #[error("Session {0} is already connected.")]
    DuplicateSession(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: u64 },
}

struct PooledConnection {
    conn: ConnCtx,
    connected_at: Instant,
    last_message_at: Instant,
    message_count: u64,
    tokens: f64,
    last_refill: Instant,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub active_connections: usize,
    pub unique_users: usize,
    pub max_connections: usize,
    pub utilization_percent: f64,
    pub total_messages: u64,
    pub average_messages_per_connection: f64,
    pub oldest_connection_age: u64,
    pub config: PoolConfig,
}

/// Admission control and per-connection rate limiting for the WebSocket endpoint
pub struct PoolManager {
    config: PoolConfig,
    connections: Mutex<HashMap<ConnId, PooledConnection>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            cleanup_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnId, PooledConnection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_caps(&self, connections: &HashMap<ConnId, PooledConnection>, user_id: &str) -> Result<(), AdmissionError> {
        if connections.len() >= self.config.max_connections {
            warn!("Max global connections reached ({})", self.config.max_connections);
            return Err(AdmissionError::ServerFull);
        }
        let per_user = connections.values().filter(|c| c.conn.user_id() == user_id).count();
        if per_user >= self.config.max_connections_per_user {
            warn!(
                "Max connections per user reached for {} ({})",
                user_id, self.config.max_connections_per_user
            );
            return Err(AdmissionError::UserLimit(self.config.max_connections_per_user));
        }
        Ok(())
    }

    /// Register a connection. Caps are re-checked under the same lock as the insert.
    pub fn add_connection(&self, conn: &ConnCtx) -> Result<(), AdmissionError> {
        let mut connections = self.lock();
        let user_id = conn.user_id();

        let duplicate = connections
            .values()
            .any(|c| c.conn.user_id() == user_id && c.conn.session_id == conn.session_id && c.conn.is_open());
        if duplicate {
            warn!(
                "Duplicate session {} detected for user {}. Rejecting new connection.",
                conn.session_id, user_id
            );
            return Err(AdmissionError::DuplicateSession(conn.session_id.clone()));
        }
        self.check_caps(&connections, user_id)?;

        let now = Instant::now();
        connections.insert(
            conn.conn_id,
            PooledConnection {
                conn: conn.clone(),
                connected_at: now,
                last_message_at: now,
                message_count: 0,
                tokens: self.config.message_rate_limit as f64,
                last_refill: now,
            },
        );
        let per_user = connections.values().filter(|c| c.conn.user_id() == user_id).count();
        info!(
            "Connection added. Total: {}, User {}: {}",
            connections.len(),
            user_id,
            per_user
        );
        Ok(())
    }

    pub fn remove_connection(&self, conn_id: ConnId) {
        let removed = self.lock().remove(&conn_id);
        if let Some(entry) = removed {
            info!(
                "Connection removed. User: {}, Duration: {}s, Messages: {}",
                entry.conn.user_id(),
                entry.connected_at.elapsed().as_secs(),
                entry.message_count
            );
        }
    }

    pub fn check_rate_limit(&self, conn_id: ConnId) -> RateDecision {
        self.check_rate_limit_at(conn_id, Instant::now())
    }

    /// Token bucket: `message_rate_limit` tokens refilled over `message_rate_window` seconds
    pub fn check_rate_limit_at(&self, conn_id: ConnId, now: Instant) -> RateDecision {
        let mut connections = self.lock();
        let Some(entry) = connections.get_mut(&conn_id) else {
            return RateDecision::Allowed;
        };

        let limit = self.config.message_rate_limit.max(1) as f64;
        let window = self.config.message_rate_window.max(1) as f64;

        let elapsed = now.saturating_duration_since(entry.last_refill).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * limit / window).min(limit);
        entry.last_refill = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            entry.message_count += 1;
            entry.last_message_at = now;
            return RateDecision::Allowed;
        }

        let needed = 1.0 - entry.tokens;
        let retry_after = ((needed * window) / limit).ceil().max(1.0) as u64;
        warn!(
            "Rate limit exceeded for user {}. Retry after: {}s",
            entry.conn.user_id(),
            retry_after
        );
        RateDecision::Limited { retry_after }
    }

    pub fn stats(&self) -> PoolStats {
        let connections = self.lock();
        let active = connections.len();
        let mut users: Vec<&str> = connections.values().map(|c| c.conn.user_id()).collect();
        users.sort_unstable();
        users.dedup();

        let total_messages: u64 = connections.values().map(|c| c.message_count).sum();
        let oldest = connections
            .values()
            .map(|c| c.connected_at.elapsed().as_secs())
            .max()
            .unwrap_or(0);
        let max = self.config.max_connections.max(1);

        PoolStats {
            active_connections: active,
            unique_users: users.len(),
            max_connections: self.config.max_connections,
            utilization_percent: (active as f64 / max as f64) * 100.0,
            total_messages,
            average_messages_per_connection: if active > 0 {
                total_messages as f64 / active as f64
            } else {
                0.0
            },
            oldest_connection_age: oldest,
            config: self.config,
        }
    }

    /// Drop entries whose socket is gone and which have been silent for longer than `threshold`
    pub fn sweep_stale(&self, now: Instant, threshold: Duration) -> usize {
        let mut connections = self.lock();
        let before = connections.len();
        connections.retain(|_, c| c.conn.is_open() || now.saturating_duration_since(c.last_message_at) <= threshold);
        let cleaned = before - connections.len();
        if cleaned > 0 {
            info!("Cleaned up {} stale connections", cleaned);
        }
        cleaned
    }

    pub fn spawn_cleanup(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else { return };
                pool.sweep_stale(Instant::now(), STALE_THRESHOLD);
                debug!("Pool stats: {:?}", pool.stats());
            }
        });
        if let Some(previous) = self.cleanup_task.lock().unwrap_or_else(PoisonError::into_inner).replace(task) {
            previous.abort();
        }
    }

    /// Close every connection with 1001 and forget them
    pub fn shutdown(&self) {
        if let Some(task) = self.cleanup_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        let mut connections = self.lock();
        for entry in connections.values() {
            entry.conn.close(1001, "Server shutting down");
        }
        connections.clear();
        info!("Connection pool shut down");
    }
}
