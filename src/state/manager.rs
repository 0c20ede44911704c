//! PostgreSQL request store

use super::{apply_update, TransactionStore};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::tx::{TransactionRequest, TransactionStatus, TransactionUpdate};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

/// State manager for PostgreSQL persistence
///
/// Each request is stored as one JSONB document, with status and chain kept in
/// their own columns for the recovery query.
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_transactions (
                id TEXT PRIMARY KEY,
                chain_id BIGINT NOT NULL,
                status VARCHAR(20) NOT NULL,
                relayer_address VARCHAR(42),
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relay_transactions_status
            ON relay_transactions (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn decode(row: &sqlx::postgres::PgRow) -> RelayerResult<TransactionRequest> {
        let Json(request): Json<TransactionRequest> = row.try_get("record")?;
        Ok(request)
    }
}

#[async_trait]
impl TransactionStore for StateManager {
    async fn save(&self, request: &TransactionRequest) -> RelayerResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO relay_transactions (id, chain_id, status, relayer_address, record)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&request.id)
        .bind(request.chain_id as i64)
        .bind(request.status.as_str())
        .bind(request.relayer_address.map(|a| format!("{:?}", a)))
        .bind(Json(request))
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(RelayerError::Transaction(format!(
                "request {} already exists",
                request.id
            )));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: TransactionStatus,
        update: TransactionUpdate,
    ) -> RelayerResult<TransactionRequest> {
        // Row lock so concurrent writers serialize on the record.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT record FROM relay_transactions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RelayerError::TransactionNotFound {
                tx_id: id.to_string(),
            })?;

        let mut request = Self::decode(&row)?;
        apply_update(&mut request, status, update)?;

        sqlx::query(
            r#"
            UPDATE relay_transactions
            SET status = $2, relayer_address = $3, record = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(request.status.as_str())
        .bind(request.relayer_address.map(|a| format!("{:?}", a)))
        .bind(Json(&request))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Request {} is now {}", id, request.status);
        Ok(request)
    }

    async fn get_by_id(&self, id: &str) -> RelayerResult<Option<TransactionRequest>> {
        let row = sqlx::query("SELECT record FROM relay_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_unfinished(&self) -> RelayerResult<Vec<TransactionRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM relay_transactions
            WHERE status NOT IN ('SUCCESS', 'FAILED', 'DROPPED')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }

    /// Health check
    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
