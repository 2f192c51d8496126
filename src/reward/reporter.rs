//! Confirmation Reporter
//!
//! Returns the submission acknowledgement to the caller and later resolves
//! `Submitted` transfers to `Confirmed` or `Failed`, either on demand
//! (`poll_status`) or from the background confirmation loop.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::audit::AuditTrail;
use super::table::{Transfer, TransferTable, Transition};
use crate::error::{LedgerError, RewardError, RewardResult};
use crate::ledger::{LedgerView, TransferRef, TransferState};

/// What a successful grant hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardOutcome {
    pub transfer_ref: TransferRef,
    pub state: TransferState,
    pub intent_id: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub checked: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub pending: usize,
}

pub struct ConfirmationReporter {
    ledger: Arc<dyn LedgerView>,
    table: Arc<TransferTable>,
    audit: AuditTrail,
    ledger_timeout: Duration,
    confirmation_timeout: ChronoDuration,
}

impl ConfirmationReporter {
    pub fn new(
        ledger: Arc<dyn LedgerView>,
        table: Arc<TransferTable>,
        ledger_timeout: Duration,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            table,
            audit: AuditTrail::disabled(),
            ledger_timeout,
            confirmation_timeout: ChronoDuration::from_std(confirmation_timeout)
                .unwrap_or(ChronoDuration::MAX),
        }
    }

    /// Send state transitions to the audit trail
    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = audit;
        self
    }

    pub fn audits(&self) -> bool {
        self.audit.is_enabled()
    }

    /// Acknowledgement for the caller. The audit row was already queued by
    /// the serializer worker when the ledger accepted the transfer.
    pub fn record_and_return(&self, transfer: &Transfer) -> RewardOutcome {
        RewardOutcome {
            transfer_ref: transfer.transfer_ref.clone(),
            state: transfer.state,
            intent_id: transfer.intent_id,
        }
    }

    /// Current state of a transfer this process submitted.
    ///
    /// Terminal states are answered from the table without touching the
    /// ledger. A ledger read failure leaves the transfer `Submitted`.
    pub async fn poll_status(&self, transfer_ref: &TransferRef) -> RewardResult<TransferState> {
        let transfer = self
            .table
            .get(transfer_ref)
            .ok_or_else(|| RewardError::TransferNotFound(transfer_ref.to_string()))?;
        if transfer.state.is_terminal() {
            return Ok(transfer.state);
        }

        let now = Utc::now();
        let observed = self.read_status(transfer_ref).await;

        let (state, reason) = match observed {
            Some(TransferState::Confirmed) => (TransferState::Confirmed, None),
            Some(TransferState::Failed) => (TransferState::Failed, Some("ledger reported failure".to_string())),
            _ if now - transfer.submitted_at > self.confirmation_timeout => (
                TransferState::Failed,
                Some("no confirmation within timeout".to_string()),
            ),
            _ => (TransferState::Submitted, None),
        };

        let transition = self
            .table
            .observe(transfer_ref, state, reason, now)
            .ok_or_else(|| RewardError::TransferNotFound(transfer_ref.to_string()))?;

        if let Transition::Applied(updated) = &transition {
            info!(
                intent_id = updated.intent_id,
                transfer_ref = %updated.transfer_ref,
                state = %updated.state,
                reason = ?updated.failure_reason,
                "Transfer resolved"
            );
            self.audit.transitioned(updated);
        }

        Ok(transition.transfer().state)
    }

    async fn read_status(&self, transfer_ref: &TransferRef) -> Option<TransferState> {
        match tokio::time::timeout(self.ledger_timeout, self.ledger.get_transfer_status(transfer_ref)).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(LedgerError::UnknownTransfer(_))) => {
                // Not yet visible to the node we asked
                debug!(transfer_ref = %transfer_ref, "Ledger has no record of transfer yet");
                None
            }
            Ok(Err(e)) => {
                warn!(transfer_ref = %transfer_ref, error = %e, "Transfer status read failed");
                None
            }
            Err(_) => {
                warn!(transfer_ref = %transfer_ref, "Transfer status read timed out");
                None
            }
        }
    }

    /// Poll every transfer still awaiting confirmation and drop expired holds.
    pub async fn poll_pending(&self) -> PollSummary {
        let mut summary = PollSummary::default();

        for transfer in self.table.submitted() {
            summary.checked += 1;
            match self.poll_status(&transfer.transfer_ref).await {
                Ok(TransferState::Confirmed) => summary.confirmed += 1,
                Ok(TransferState::Failed) => summary.failed += 1,
                Ok(TransferState::Submitted) => summary.pending += 1,
                // Evicted between listing and polling
                Err(_) => {}
            }
        }

        let pruned = self.table.prune_holds(Utc::now());
        if pruned > 0 {
            info!(pruned, "Expired unresolved holds released");
        }

        summary
    }

    pub fn transfer(&self, transfer_ref: &TransferRef) -> Option<Transfer> {
        self.table.get(transfer_ref)
    }

    pub fn recent(&self, limit: usize) -> Vec<Transfer> {
        self.table.recent(limit)
    }
}

/// Resolve pending transfers every `interval` until the task is aborted.
pub async fn run_confirmation_loop(reporter: Arc<ConfirmationReporter>, interval: Duration) {
    info!(interval_ms = interval.as_millis() as u64, "Confirmation loop started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let summary = reporter.poll_pending().await;
        if summary.checked > 0 {
            debug!(
                checked = summary.checked,
                confirmed = summary.confirmed,
                failed = summary.failed,
                pending = summary.pending,
                "Confirmation sweep complete"
            );
        }
    }
}
