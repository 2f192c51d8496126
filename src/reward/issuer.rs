//! Reward Issuer
//!
//! Wires the four stages together and exposes the `grant` operation:
//!
//! ```text
//! RewardRequest
//!     │ RequestValidator      (no I/O)
//!     ▼
//! ValidatedRequest
//!     │ BalanceOracle         (cached pre-check)
//!     ▼
//!     │ TransferSerializer    (FIFO, one ledger submission at a time)
//!     ▼
//! Transfer (Submitted)     ──► AuditTrail (best-effort)
//!     │ ConfirmationReporter  (later Confirmed / Failed)
//!     ▼
//! RewardOutcome
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::audit::{AuditSink, AuditTrail};
use super::oracle::{BalanceOracle, LedgerBalanceSnapshot};
use super::reporter::{ConfirmationReporter, RewardOutcome};
use super::serializer::{QueueStats, SerializerConfig, TransferSerializer};
use super::table::{TableCounts, Transfer, TransferTable};
use super::validator::{RequestValidator, RewardRequest};
use crate::error::{InvalidRequest, RewardError, RewardResult};
use crate::ledger::units::amount_string;
use crate::ledger::{LedgerClient, LedgerView, TransferRef, TransferState, normalize_address};

#[derive(Debug, Clone)]
pub struct IssuerSettings {
    pub max_amount: u128,
    pub snapshot_freshness: Duration,
    pub ledger_timeout: Duration,
    pub queue_timeout: Duration,
    pub queue_depth_warning: usize,
    /// Funds stay reserved this long after an unknown outcome
    pub unresolved_hold: Duration,
    pub confirmation_timeout: Duration,
    pub history_limit: usize,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            max_amount: 1_000_000_000_000_000_000_000,
            snapshot_freshness: Duration::from_secs(15),
            ledger_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(30),
            queue_depth_warning: 100,
            unresolved_hold: Duration::from_secs(600),
            confirmation_timeout: Duration::from_secs(600),
            history_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerStats {
    pub queue: QueueStats,
    pub transfers: TableCounts,
    #[serde(with = "amount_string")]
    pub reserved: u128,
    pub snapshot: Option<LedgerBalanceSnapshot>,
}

/// What is known about an intent, looked up by the id a caller was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum IntentStatus {
    /// The ledger accepted the transfer.
    Recorded(Transfer),
    /// The worker is submitting it right now.
    InFlight { intent_id: u64 },
    /// The submission may or may not have landed; its amount stays reserved
    /// until `expires_at`.
    Unresolved {
        intent_id: u64,
        #[serde(with = "amount_string")]
        amount: u128,
        expires_at: DateTime<Utc>,
    },
}

pub struct RewardIssuer {
    validator: RequestValidator,
    oracle: Arc<BalanceOracle>,
    serializer: TransferSerializer,
    reporter: Arc<ConfirmationReporter>,
    table: Arc<TransferTable>,
}

impl RewardIssuer {
    /// Build the pipeline around `ledger` and start the serializer worker.
    ///
    /// The submission capability goes to the serializer only; every other
    /// stage sees the ledger as read-only.
    pub fn start<L>(
        ledger: Arc<L>,
        settings: IssuerSettings,
        audit_sink: Option<Arc<dyn AuditSink>>,
    ) -> (Self, JoinHandle<()>)
    where
        L: LedgerClient + 'static,
    {
        let table = Arc::new(TransferTable::new(settings.history_limit));
        let view: Arc<dyn LedgerView> = ledger.clone();

        let oracle = Arc::new(BalanceOracle::new(
            view.clone(),
            table.clone(),
            settings.snapshot_freshness,
            settings.ledger_timeout,
        ));

        // The writer task stops on its own once the worker and reporter are gone.
        let audit = match audit_sink {
            Some(sink) => AuditTrail::spawn(sink).0,
            None => AuditTrail::disabled(),
        };

        let reporter = ConfirmationReporter::new(
            view,
            table.clone(),
            settings.ledger_timeout,
            settings.confirmation_timeout,
        )
        .with_audit(audit.clone());

        let (serializer, worker) = TransferSerializer::spawn(
            ledger,
            oracle.clone(),
            table.clone(),
            audit,
            SerializerConfig {
                queue_timeout: settings.queue_timeout,
                ledger_timeout: settings.ledger_timeout,
                unresolved_hold: settings.unresolved_hold,
                depth_warning: settings.queue_depth_warning,
            },
        );

        info!(
            max_amount = %settings.max_amount,
            audit = reporter.audits(),
            "Reward issuer ready"
        );

        let issuer = Self {
            validator: RequestValidator::new(settings.max_amount),
            oracle,
            serializer,
            reporter: Arc::new(reporter),
            table,
        };
        (issuer, worker)
    }

    /// Issue `request.amount` base units to `request.wallet_address`.
    ///
    /// Success means the ledger accepted the transfer (`Submitted`), not that
    /// it is final; follow up with [`poll_status`](Self::poll_status).
    pub async fn grant(&self, request: RewardRequest) -> RewardResult<RewardOutcome> {
        let validated = self.validator.validate(&request).inspect_err(|e| {
            debug!(error = %e, "Reward request rejected");
        })?;

        // Cheap early rejection; the serializer re-checks before submitting.
        self.oracle.check_sufficient(validated.amount()).await?;

        let transfer = self.serializer.submit(&validated).await.inspect_err(|e| {
            warn!(
                requester_id = %validated.requester_id(),
                amount = %validated.amount(),
                code = e.code(),
                error = %e,
                "Reward grant failed"
            );
        })?;

        Ok(self.reporter.record_and_return(&transfer))
    }

    pub async fn poll_status(&self, transfer_ref: &TransferRef) -> RewardResult<TransferState> {
        self.reporter.poll_status(transfer_ref).await
    }

    /// Token balance of any wallet, read straight from the ledger.
    pub async fn balance_of(&self, address: &str) -> RewardResult<u128> {
        let address = normalize_address(address)
            .ok_or_else(|| RewardError::Invalid(InvalidRequest::MalformedAddress(address.to_string())))?;
        self.oracle.balance_of(&address).await
    }

    /// Resolve an intent id, e.g. one returned with `OutcomeUnknown`.
    ///
    /// A recorded transfer is polled first, so its state is current.
    pub async fn transfer_by_intent(&self, intent_id: u64) -> RewardResult<IntentStatus> {
        if let Some(transfer) = self.table.get_by_intent(intent_id) {
            let refreshed = match self.reporter.poll_status(&transfer.transfer_ref).await {
                Ok(_) => self.table.get_by_intent(intent_id),
                // Evicted between the two reads
                Err(_) => None,
            };
            return Ok(IntentStatus::Recorded(refreshed.unwrap_or(transfer)));
        }

        if self.serializer.in_flight_intent() == Some(intent_id) {
            return Ok(IntentStatus::InFlight { intent_id });
        }

        if let Some(hold) = self.table.hold_for(intent_id, Utc::now()) {
            return Ok(IntentStatus::Unresolved {
                intent_id,
                amount: hold.amount,
                expires_at: hold.expires_at,
            });
        }

        // The worker may have recorded it after the first read
        self.table
            .get_by_intent(intent_id)
            .map(IntentStatus::Recorded)
            .ok_or_else(|| RewardError::TransferNotFound(format!("intent {}", intent_id)))
    }

    pub fn transfer(&self, transfer_ref: &TransferRef) -> Option<Transfer> {
        self.reporter.transfer(transfer_ref)
    }

    pub fn recent_transfers(&self, limit: usize) -> Vec<Transfer> {
        self.reporter.recent(limit)
    }

    pub fn reporter(&self) -> Arc<ConfirmationReporter> {
        self.reporter.clone()
    }

    pub fn stats(&self) -> IssuerStats {
        IssuerStats {
            queue: self.serializer.stats(),
            transfers: self.table.counts(),
            reserved: self.table.reserved_amount(Utc::now()),
            snapshot: self.oracle.snapshot(),
        }
    }
}
