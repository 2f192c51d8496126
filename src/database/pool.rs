//! Database Connection Pool using sqlx

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::database::transfers::TransferRepository;
use crate::reward::AuditSink;
use crate::reward::Transfer;

pub struct DatabasePool {
    pool: PgPool,
    transfers: TransferRepository,
}

impl DatabasePool {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, String> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .map_err(|e| format!("Failed to connect to PostgreSQL: {}", e))?;

        info!(max_connections, "Connected to PostgreSQL");

        let transfers = TransferRepository::new(pool.clone());

        Ok(Self { pool, transfers })
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        info!("Initializing database schema...");

        sqlx::query("CREATE SCHEMA IF NOT EXISTS rewards")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create rewards schema: {}", e))?;

        self.transfers.init_table().await?;

        info!("Database schema initialized");
        Ok(())
    }

    pub fn transfers(&self) -> &TransferRepository {
        &self.transfers
    }
}

#[async_trait]
impl AuditSink for DatabasePool {
    async fn record_submitted(&self, transfer: &Transfer) -> Result<(), String> {
        self.transfers.record_submitted(transfer).await
    }

    async fn record_transition(&self, transfer: &Transfer) -> Result<bool, String> {
        self.transfers.update_state(transfer).await
    }
}
