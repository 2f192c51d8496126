//! Transfer Repository - PostgreSQL audit rows for submitted transfers
//!
//! Amounts are `NUMERIC(78, 0)` columns, bound as text.

use sqlx::PgPool;
use tracing::debug;

use crate::reward::table::Transfer;

pub struct TransferRepository {
    pool: PgPool,
}

impl TransferRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_table(&self) -> Result<(), String> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rewards.transfers (
                transfer_ref VARCHAR(128) PRIMARY KEY,
                intent_id BIGINT NOT NULL,
                requester_id VARCHAR(255) NOT NULL,
                wallet_address VARCHAR(42) NOT NULL,
                amount NUMERIC(78, 0) NOT NULL,
                state VARCHAR(16) NOT NULL,
                submitted_at TIMESTAMP WITH TIME ZONE NOT NULL,
                last_checked_at TIMESTAMP WITH TIME ZONE,
                failure_reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create transfers table: {}", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transfers_requester ON rewards.transfers(requester_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create transfers index: {}", e))?;

        Ok(())
    }

    pub async fn record_submitted(&self, transfer: &Transfer) -> Result<(), String> {
        sqlx::query(
            r#"
            INSERT INTO rewards.transfers
            (transfer_ref, intent_id, requester_id, wallet_address, amount, state, submitted_at)
            VALUES ($1, $2, $3, $4, $5::numeric, $6, $7)
            ON CONFLICT (transfer_ref) DO NOTHING
            "#,
        )
        .bind(transfer.transfer_ref.as_str())
        .bind(transfer.intent_id as i64)
        .bind(&transfer.requester_id)
        .bind(&transfer.wallet_address)
        .bind(transfer.amount.to_string())
        .bind(transfer.state.as_str())
        .bind(transfer.submitted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to insert transfer: {}", e))?;

        debug!(transfer_ref = %transfer.transfer_ref, intent_id = transfer.intent_id, "Transfer recorded");
        Ok(())
    }

    /// Persist a state transition. Rows already in a terminal state are left alone.
    pub async fn update_state(&self, transfer: &Transfer) -> Result<bool, String> {
        let result = sqlx::query(
            r#"
            UPDATE rewards.transfers
            SET state = $2, last_checked_at = $3, failure_reason = $4
            WHERE transfer_ref = $1 AND state = 'submitted'
            "#,
        )
        .bind(transfer.transfer_ref.as_str())
        .bind(transfer.state.as_str())
        .bind(transfer.last_checked_at)
        .bind(&transfer.failure_reason)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to update transfer state: {}", e))?;

        Ok(result.rows_affected() > 0)
    }
}
