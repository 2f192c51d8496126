//! Balance Oracle
//!
//! Cached view of the custodial wallet's ledger balance. The cache is a
//! lock-free snapshot; refreshes go through the ledger (bounded by the ledger
//! timeout) and are coalesced so concurrent callers trigger one read.
//!
//! Sufficiency is judged against `observed - reserved`, where `reserved`
//! covers transfers submitted but not yet confirmed plus unresolved holds.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::table::TransferTable;
use crate::error::{RewardError, RewardResult};
use crate::ledger::LedgerView;
use crate::ledger::units::amount_string;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerBalanceSnapshot {
    #[serde(with = "amount_string")]
    pub observed_balance: u128,
    pub observed_at: DateTime<Utc>,
}

pub struct BalanceOracle {
    ledger: Arc<dyn LedgerView>,
    table: Arc<TransferTable>,
    snapshot: ArcSwapOption<LedgerBalanceSnapshot>,
    refresh_lock: Mutex<()>,
    freshness: ChronoDuration,
    ledger_timeout: Duration,
}

impl BalanceOracle {
    pub fn new(
        ledger: Arc<dyn LedgerView>,
        table: Arc<TransferTable>,
        freshness: Duration,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            table,
            snapshot: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
            freshness: ChronoDuration::from_std(freshness).unwrap_or(ChronoDuration::zero()),
            ledger_timeout,
        }
    }

    /// Ok when the custodial wallet can cover `amount` on top of everything
    /// already submitted.
    pub async fn check_sufficient(&self, amount: u128) -> RewardResult<()> {
        let snapshot = self.current_snapshot().await?;
        let available = self.available_from(&snapshot, Utc::now());

        if available < amount {
            debug!(
                requested = %amount,
                available = %available,
                observed = %snapshot.observed_balance,
                "Insufficient custodial balance"
            );
            return Err(RewardError::InsufficientBalance {
                requested: amount,
                available,
            });
        }

        Ok(())
    }

    /// Spendable amount according to the cached snapshot, if any.
    pub fn available(&self) -> Option<u128> {
        self.snapshot
            .load_full()
            .map(|snapshot| self.available_from(&snapshot, Utc::now()))
    }

    fn available_from(&self, snapshot: &LedgerBalanceSnapshot, now: DateTime<Utc>) -> u128 {
        snapshot
            .observed_balance
            .saturating_sub(self.table.reserved_amount(now))
    }

    /// The cached snapshot, unless it is stale or predates a settlement
    /// (a settled transfer no longer counts as reserved).
    fn fresh_snapshot(&self) -> Option<Arc<LedgerBalanceSnapshot>> {
        let settled_at = self.table.last_settled_at();
        self.snapshot.load_full().filter(|s| {
            Utc::now() - s.observed_at < self.freshness
                && settled_at.is_none_or(|settled| s.observed_at > settled)
        })
    }

    async fn current_snapshot(&self) -> RewardResult<Arc<LedgerBalanceSnapshot>> {
        if let Some(snapshot) = self.fresh_snapshot() {
            return Ok(snapshot);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(snapshot) = self.fresh_snapshot() {
            return Ok(snapshot);
        }

        self.refresh_locked().await
    }

    /// Force a ledger read and replace the cached snapshot.
    pub async fn refresh(&self) -> RewardResult<Arc<LedgerBalanceSnapshot>> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> RewardResult<Arc<LedgerBalanceSnapshot>> {
        let custodial = self.ledger.custodial_address();

        let balance = match tokio::time::timeout(self.ledger_timeout, self.ledger.get_balance(custodial)).await {
            Ok(Ok(balance)) => balance,
            Ok(Err(e)) => {
                warn!(error = %e, "Custodial balance read failed");
                return Err(RewardError::LedgerUnavailable(e.to_string()));
            }
            Err(_) => {
                warn!(timeout_ms = self.ledger_timeout.as_millis() as u64, "Custodial balance read timed out");
                return Err(RewardError::LedgerUnavailable("balance read timed out".to_string()));
            }
        };

        let snapshot = Arc::new(LedgerBalanceSnapshot {
            observed_balance: balance,
            observed_at: Utc::now(),
        });
        self.snapshot.store(Some(snapshot.clone()));

        info!(balance = %balance, "Custodial balance refreshed");
        Ok(snapshot)
    }

    /// Drop the cached snapshot; the next check reads the ledger.
    pub fn invalidate(&self) {
        self.snapshot.store(None);
    }

    pub fn snapshot(&self) -> Option<LedgerBalanceSnapshot> {
        self.snapshot.load_full().map(|s| (*s).clone())
    }

    /// Uncached balance of an arbitrary address.
    pub async fn balance_of(&self, address: &str) -> RewardResult<u128> {
        match tokio::time::timeout(self.ledger_timeout, self.ledger.get_balance(address)).await {
            Ok(Ok(balance)) => Ok(balance),
            Ok(Err(e)) => Err(RewardError::LedgerUnavailable(e.to_string())),
            Err(_) => Err(RewardError::LedgerUnavailable("balance read timed out".to_string())),
        }
    }
}
