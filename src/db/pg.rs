use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Error as SqlxError;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::store::{DocumentStore, EventLog};
use crate::error::StoreError;
use crate::models::{AuthUser, StoredDocument};

/// Flow row from the `chat_flow` table
#[derive(Debug, Clone, sqlx::FromRow)]
struct ChatFlowRow {
    id: Uuid,
    workspace_id: Option<String>,
    flow_data: Option<String>,
}

/// Postgres-backed document store and audit log
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Cheap connectivity probe for the readiness endpoint
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn load_document(&self, document_id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let Ok(id) = Uuid::parse_str(document_id) else {
            return Ok(None);
        };

        let pool_idle = self.pool.num_idle() as u32;
        debug!(
            "Loading flow {}. Pool connections: {} idle, {} in use",
            document_id,
            pool_idle,
            self.pool.size().saturating_sub(pool_idle)
        );

        let row = sqlx::query_as::<_, ChatFlowRow>(
            r#"
            SELECT id, workspace_id, flow_data
            FROM chat_flow
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error loading flow '{}': {}", document_id, e);
            e
        })?;

        Ok(row.map(|row| StoredDocument {
            id: row.id.to_string(),
            scope_id: row.workspace_id.unwrap_or_default(),
            flow_data: row.flow_data.unwrap_or_default(),
        }))
    }

    async fn save_document(&self, document: &StoredDocument, actor: &AuthUser) -> Result<(), StoreError> {
        let id = Uuid::parse_str(&document.id).map_err(|e| StoreError::Malformed {
            document_id: document.id.clone(),
            message: e.to_string(),
        })?;

        let result = sqlx::query(
            r#"
            UPDATE chat_flow
            SET flow_data = $2, updated_date = NOW(), updated_by = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&document.flow_data)
        .bind(&actor.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Unavailable(format!("flow {} no longer exists", document.id)));
        }

        info!("Flow {} saved by {}", document.id, actor.id);
        Ok(())
    }
}

#[async_trait]
impl EventLog for PgStore {
    async fn append(&self, document_id: &str, event: Value) -> Result<(), StoreError> {
        let chatflow_id = Uuid::parse_str(document_id).map_err(|e| StoreError::Malformed {
            document_id: document_id.to_string(),
            message: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO chat_flow_event (id, chatflow_id, event, created_date)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(chatflow_id)
        .bind(Json(event))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
