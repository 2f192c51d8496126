//! In-memory ledger
//!
//! Process-local stand-in for the token ledger, used in dev mode and tests.
//! Transfers are recorded the moment they are submitted and settle (debit the
//! custodial wallet, credit the recipient) on confirmation, like an on-chain
//! token whose `balanceOf` only moves once a transaction is mined.
//!
//! Fault injection lets callers simulate an unreachable ledger, slow or lost
//! acknowledgements and outright rejections.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{LedgerClient, LedgerView, TransferRef, TransferState};
use crate::error::{LedgerError, LedgerResult};

/// When submitted transfers become confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationMode {
    /// Settled as part of the submission.
    Immediate,
    /// Settled on the n-th status query.
    AfterPolls(u32),
    /// Settled only through [`InMemoryLedger::confirm`] / [`InMemoryLedger::fail`].
    Manual,
}

#[derive(Debug, Clone)]
struct TransferSnapshot {
    to: String,
    amount: u128,
    state: TransferState,
    polls: u32,
}

#[derive(Debug, Default)]
struct LedgerBook {
    balances: HashMap<String, u128>,
    transfers: HashMap<TransferRef, TransferSnapshot>,
    submit_calls: Vec<(String, u128)>,
    scripted_refs: VecDeque<String>,
    next_ref: u64,
    balance_reads: u64,
    status_reads: u64,
}

impl LedgerBook {
    fn balance(&self, address: &str) -> u128 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    /// Outgoing amount of custodial transfers that have not settled yet.
    fn unsettled_outgoing(&self) -> u128 {
        self.transfers
            .values()
            .filter(|t| t.state == TransferState::Submitted)
            .map(|t| t.amount)
            .sum()
    }

    fn settle(&mut self, custodial: &str, transfer_ref: &TransferRef) -> Option<TransferState> {
        let transfer = self.transfers.get(transfer_ref)?.clone();
        if transfer.state.is_terminal() {
            return Some(transfer.state);
        }

        let funds = self.balance(custodial);
        let state = if funds >= transfer.amount {
            self.balances
                .insert(custodial.to_string(), funds - transfer.amount);
            *self.balances.entry(transfer.to.clone()).or_insert(0) += transfer.amount;
            TransferState::Confirmed
        } else {
            TransferState::Failed
        };

        if let Some(entry) = self.transfers.get_mut(transfer_ref) {
            entry.state = state;
        }
        Some(state)
    }
}

#[derive(Debug, Clone, Default)]
struct FaultPlan {
    fail_balance_reads: bool,
    fail_status_reads: bool,
    balance_delay: Duration,
    ack_delay: Duration,
    reject_reason: Option<String>,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct InMemoryLedger {
    custodial_address: String,
    confirmation: ConfirmationMode,
    book: Arc<RwLock<LedgerBook>>,
    faults: Arc<RwLock<FaultPlan>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryLedger {
    /// Create a ledger whose custodial wallet holds `initial_balance`.
    pub fn new(custodial_address: impl Into<String>, initial_balance: u128) -> Self {
        let custodial_address = key(&custodial_address.into());
        let mut book = LedgerBook::default();
        book.balances.insert(custodial_address.clone(), initial_balance);

        info!(
            custodial = %custodial_address,
            balance = %initial_balance,
            "In-memory ledger initialized"
        );

        Self {
            custodial_address,
            confirmation: ConfirmationMode::AfterPolls(1),
            book: Arc::new(RwLock::new(book)),
            faults: Arc::new(RwLock::new(FaultPlan::default())),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_confirmation_mode(mut self, mode: ConfirmationMode) -> Self {
        self.confirmation = mode;
        self
    }

    pub async fn set_balance(&self, address: &str, amount: u128) {
        self.book.write().await.balances.insert(key(address), amount);
    }

    /// Hand out these references, in order, before falling back to generated ones.
    pub async fn script_transfer_refs<I, S>(&self, refs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut book = self.book.write().await;
        book.scripted_refs.extend(refs.into_iter().map(Into::into));
    }

    pub async fn fail_balance_reads(&self, fail: bool) {
        self.faults.write().await.fail_balance_reads = fail;
    }

    pub async fn fail_status_reads(&self, fail: bool) {
        self.faults.write().await.fail_status_reads = fail;
    }

    pub async fn set_balance_delay(&self, delay: Duration) {
        self.faults.write().await.balance_delay = delay;
    }

    /// Delay between a transfer being applied and its acknowledgement.
    pub async fn set_ack_delay(&self, delay: Duration) {
        self.faults.write().await.ack_delay = delay;
    }

    pub async fn reject_submissions(&self, reason: Option<String>) {
        self.faults.write().await.reject_reason = reason;
    }

    /// Settle a submitted transfer (manual confirmation mode).
    pub async fn confirm(&self, transfer_ref: &TransferRef) -> Option<TransferState> {
        let mut book = self.book.write().await;
        book.settle(&self.custodial_address, transfer_ref)
    }

    /// Mark a submitted transfer as failed without moving funds.
    pub async fn fail(&self, transfer_ref: &TransferRef) -> Option<TransferState> {
        let mut book = self.book.write().await;
        let transfer = book.transfers.get_mut(transfer_ref)?;
        if !transfer.state.is_terminal() {
            transfer.state = TransferState::Failed;
        }
        Some(transfer.state)
    }

    /// Every submission attempt that reached the ledger, in arrival order.
    pub async fn submit_calls(&self) -> Vec<(String, u128)> {
        self.book.read().await.submit_calls.clone()
    }

    pub async fn submit_count(&self) -> usize {
        self.book.read().await.submit_calls.len()
    }

    pub async fn balance_read_count(&self) -> u64 {
        self.book.read().await.balance_reads
    }

    pub async fn status_read_count(&self) -> u64 {
        self.book.read().await.status_reads
    }

    /// Highest number of submissions observed running at the same time.
    pub fn max_concurrent_submits(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total ever accepted for submission, whatever its state.
    pub async fn total_submitted_amount(&self) -> u128 {
        self.book.read().await.transfers.values().map(|t| t.amount).sum()
    }
}

fn key(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

#[async_trait]
impl LedgerView for InMemoryLedger {
    async fn get_balance(&self, address: &str) -> LedgerResult<u128> {
        let (fail, delay) = {
            let faults = self.faults.read().await;
            (faults.fail_balance_reads, faults.balance_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(LedgerError::Unreachable("injected balance read failure".to_string()));
        }

        let mut book = self.book.write().await;
        book.balance_reads += 1;
        Ok(book.balance(&key(address)))
    }

    async fn get_transfer_status(&self, transfer_ref: &TransferRef) -> LedgerResult<TransferState> {
        if self.faults.read().await.fail_status_reads {
            return Err(LedgerError::Unreachable("injected status read failure".to_string()));
        }

        let mut book = self.book.write().await;
        book.status_reads += 1;

        let polls = {
            let transfer = book
                .transfers
                .get_mut(transfer_ref)
                .ok_or_else(|| LedgerError::UnknownTransfer(transfer_ref.to_string()))?;
            if transfer.state.is_terminal() {
                return Ok(transfer.state);
            }
            transfer.polls += 1;
            transfer.polls
        };

        match self.confirmation {
            ConfirmationMode::AfterPolls(n) if polls >= n => book
                .settle(&self.custodial_address, transfer_ref)
                .ok_or_else(|| LedgerError::UnknownTransfer(transfer_ref.to_string())),
            _ => Ok(TransferState::Submitted),
        }
    }

    fn custodial_address(&self) -> &str {
        &self.custodial_address
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit_transfer(&self, to: &str, amount: u128) -> LedgerResult<TransferRef> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let (reject_reason, ack_delay) = {
            let faults = self.faults.read().await;
            (faults.reject_reason.clone(), faults.ack_delay)
        };

        let transfer_ref = {
            let mut book = self.book.write().await;
            book.submit_calls.push((key(to), amount));

            if let Some(reason) = reject_reason {
                warn!(to = %to, amount = %amount, reason = %reason, "Transfer rejected (in-memory)");
                return Err(LedgerError::Rejected(reason));
            }

            let spendable = book
                .balance(&self.custodial_address)
                .saturating_sub(book.unsettled_outgoing());
            if spendable < amount {
                return Err(LedgerError::Rejected(format!(
                    "transfer amount exceeds balance ({} < {})",
                    spendable, amount
                )));
            }

            let transfer_ref = match book.scripted_refs.pop_front() {
                Some(scripted) => TransferRef::new(scripted),
                None => {
                    book.next_ref += 1;
                    TransferRef::new(format!("0x{:064x}", book.next_ref))
                }
            };

            book.transfers.insert(
                transfer_ref.clone(),
                TransferSnapshot {
                    to: key(to),
                    amount,
                    state: TransferState::Submitted,
                    polls: 0,
                },
            );

            if self.confirmation == ConfirmationMode::Immediate {
                book.settle(&self.custodial_address, &transfer_ref);
            }

            transfer_ref
        };

        debug!(transfer_ref = %transfer_ref, to = %to, amount = %amount, "Transfer applied (in-memory)");

        // The transfer is already applied; only the acknowledgement is late.
        if !ack_delay.is_zero() {
            tokio::time::sleep(ack_delay).await;
        }

        Ok(transfer_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUSTODIAL: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
    const USER: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";

    #[tokio::test]
    async fn test_transfer_settles_after_poll() {
        let ledger = InMemoryLedger::new(CUSTODIAL, 1_000);

        let transfer_ref = ledger.submit_transfer(USER, 300).await.unwrap();
        // Not settled yet: balances unchanged
        assert_eq!(ledger.get_balance(CUSTODIAL).await.unwrap(), 1_000);

        let state = ledger.get_transfer_status(&transfer_ref).await.unwrap();
        assert_eq!(state, TransferState::Confirmed);
        assert_eq!(ledger.get_balance(CUSTODIAL).await.unwrap(), 700);
        assert_eq!(ledger.get_balance(USER).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_rejects_overspend_including_unsettled() {
        let ledger = InMemoryLedger::new(CUSTODIAL, 1_000).with_confirmation_mode(ConfirmationMode::Manual);

        ledger.submit_transfer(USER, 700).await.unwrap();
        let err = ledger.submit_transfer(USER, 500).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
        assert_eq!(ledger.submit_count().await, 2);
    }

    #[tokio::test]
    async fn test_scripted_refs_and_manual_confirmation() {
        let ledger = InMemoryLedger::new(CUSTODIAL, 10).with_confirmation_mode(ConfirmationMode::Manual);
        ledger.script_transfer_refs(["tx123"]).await;

        let transfer_ref = ledger.submit_transfer(USER, 1).await.unwrap();
        assert_eq!(transfer_ref.as_str(), "tx123");
        assert_eq!(
            ledger.get_transfer_status(&transfer_ref).await.unwrap(),
            TransferState::Submitted
        );

        assert_eq!(ledger.fail(&transfer_ref).await, Some(TransferState::Failed));
        // Terminal: confirm no longer changes it
        assert_eq!(ledger.confirm(&transfer_ref).await, Some(TransferState::Failed));
    }

    #[tokio::test]
    async fn test_unknown_transfer_status() {
        let ledger = InMemoryLedger::new(CUSTODIAL, 10);
        let err = ledger
            .get_transfer_status(&TransferRef::from("nope"))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::UnknownTransfer("nope".to_string()));
    }

    #[tokio::test]
    async fn test_injected_balance_failure() {
        let ledger = InMemoryLedger::new(CUSTODIAL, 10);
        ledger.fail_balance_reads(true).await;
        assert!(matches!(
            ledger.get_balance(CUSTODIAL).await,
            Err(LedgerError::Unreachable(_))
        ));
    }
}
