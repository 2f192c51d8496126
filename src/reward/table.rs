//! Transfer table
//!
//! Every transfer this process submitted, plus holds for submissions whose
//! outcome is unknown. Writers (the serializer worker inserting, the reporter
//! transitioning) mutate rows in place under a short write lock; readers copy
//! out what they need.
//!
//! Rows are indexed by transfer reference and by intent id. The amount still
//! awaiting confirmation is kept as a running total.
//!
//! The table keeps at most `history_limit` terminal transfers; transfers still
//! in `Submitted` are never evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::ledger::units::amount_string;
use crate::ledger::{TransferRef, TransferState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub intent_id: u64,
    pub transfer_ref: TransferRef,
    pub requester_id: String,
    pub wallet_address: String,
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub state: TransferState,
    pub submitted_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// Funds reserved for a submission that may or may not have landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedHold {
    pub intent_id: u64,
    pub amount: u128,
    pub expires_at: DateTime<Utc>,
}

/// Result of applying a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The transfer moved to a terminal state.
    Applied(Transfer),
    /// The transfer was already terminal; returned unchanged.
    AlreadyTerminal(Transfer),
    /// The transfer is still `Submitted`; only `last_checked_at` moved.
    Unchanged(Transfer),
}

impl Transition {
    pub fn transfer(&self) -> &Transfer {
        match self {
            Transition::Applied(t) | Transition::AlreadyTerminal(t) | Transition::Unchanged(t) => t,
        }
    }
}

#[derive(Debug, Default)]
struct TableState {
    transfers: HashMap<TransferRef, Transfer>,
    by_intent: HashMap<u64, TransferRef>,
    order: VecDeque<TransferRef>,
    holds: Vec<UnresolvedHold>,
    /// Sum of amounts still in `Submitted`
    submitted_total: u128,
    last_settled_at: Option<DateTime<Utc>>,
}

impl TableState {
    fn evict_terminal(&mut self, history_limit: usize) {
        while self.transfers.len() > history_limit {
            let position = self.order.iter().position(|r| {
                self.transfers
                    .get(r)
                    .map(|t| t.state.is_terminal())
                    .unwrap_or(true)
            });
            let Some(position) = position else {
                break;
            };
            if let Some(evicted) = self.order.remove(position)
                && let Some(transfer) = self.transfers.remove(&evicted)
            {
                self.by_intent.remove(&transfer.intent_id);
                debug!(transfer_ref = %evicted, "Evicted terminal transfer from history");
            }
        }
    }
}

pub struct TransferTable {
    state: RwLock<TableState>,
    history_limit: usize,
}

impl TransferTable {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            history_limit: history_limit.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TableState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a freshly submitted transfer. A reference is never reassigned:
    /// a duplicate insert is ignored and the existing row kept.
    pub fn insert_submitted(&self, transfer: Transfer) -> bool {
        let mut state = self.write();
        if state.transfers.contains_key(&transfer.transfer_ref) {
            warn!(transfer_ref = %transfer.transfer_ref, "Ledger returned a reference already on record");
            return false;
        }
        if transfer.state == TransferState::Submitted {
            state.submitted_total += transfer.amount;
        }
        state.order.push_back(transfer.transfer_ref.clone());
        state.by_intent.insert(transfer.intent_id, transfer.transfer_ref.clone());
        state.transfers.insert(transfer.transfer_ref.clone(), transfer);
        state.evict_terminal(self.history_limit);
        true
    }

    /// Apply a status observation. Terminal states are never left.
    pub fn observe(
        &self,
        transfer_ref: &TransferRef,
        observed: TransferState,
        failure_reason: Option<String>,
        checked_at: DateTime<Utc>,
    ) -> Option<Transition> {
        let mut state = self.write();
        let transfer = state.transfers.get_mut(transfer_ref)?;
        if transfer.state.is_terminal() {
            return Some(Transition::AlreadyTerminal(transfer.clone()));
        }

        transfer.last_checked_at = Some(checked_at);
        if !observed.is_terminal() {
            return Some(Transition::Unchanged(transfer.clone()));
        }

        transfer.state = observed;
        let settled = match observed {
            TransferState::Failed => {
                transfer.failure_reason = failure_reason;
                false
            }
            _ => true,
        };
        let applied = transfer.clone();

        state.submitted_total = state.submitted_total.saturating_sub(applied.amount);
        if settled {
            state.last_settled_at = Some(checked_at);
        }
        state.evict_terminal(self.history_limit);
        Some(Transition::Applied(applied))
    }

    /// Reserve `amount` for a submission with an unknown outcome until `expires_at`.
    pub fn hold_unresolved(&self, intent_id: u64, amount: u128, expires_at: DateTime<Utc>) {
        self.write().holds.push(UnresolvedHold {
            intent_id,
            amount,
            expires_at,
        });
    }

    pub fn prune_holds(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.write();
        let before = state.holds.len();
        state.holds.retain(|h| h.expires_at > now);
        before - state.holds.len()
    }

    /// When a transfer was last seen to move funds on the ledger.
    pub fn last_settled_at(&self) -> Option<DateTime<Utc>> {
        self.read().last_settled_at
    }

    pub fn get(&self, transfer_ref: &TransferRef) -> Option<Transfer> {
        self.read().transfers.get(transfer_ref).cloned()
    }

    pub fn get_by_intent(&self, intent_id: u64) -> Option<Transfer> {
        let state = self.read();
        state
            .by_intent
            .get(&intent_id)
            .and_then(|r| state.transfers.get(r))
            .cloned()
    }

    /// Live hold for `intent_id`, if its outcome is still unresolved.
    pub fn hold_for(&self, intent_id: u64, now: DateTime<Utc>) -> Option<UnresolvedHold> {
        self.read()
            .holds
            .iter()
            .find(|h| h.intent_id == intent_id && h.expires_at > now)
            .cloned()
    }

    /// Transfers still awaiting confirmation, oldest first.
    pub fn submitted(&self) -> Vec<Transfer> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|r| state.transfers.get(r))
            .filter(|t| t.state == TransferState::Submitted)
            .cloned()
            .collect()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<Transfer> {
        let state = self.read();
        state
            .order
            .iter()
            .rev()
            .filter_map(|r| state.transfers.get(r))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Amount not yet reflected in the ledger balance: unconfirmed transfers
    /// plus live holds.
    pub fn reserved_amount(&self, now: DateTime<Utc>) -> u128 {
        let state = self.read();
        let held: u128 = state
            .holds
            .iter()
            .filter(|h| h.expires_at > now)
            .map(|h| h.amount)
            .sum();
        state.submitted_total + held
    }

    pub fn counts(&self) -> TableCounts {
        let state = self.read();
        let mut counts = TableCounts {
            unresolved_holds: state.holds.len(),
            ..TableCounts::default()
        };
        for transfer in state.transfers.values() {
            match transfer.state {
                TransferState::Submitted => counts.submitted += 1,
                TransferState::Confirmed => counts.confirmed += 1,
                TransferState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub submitted: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub unresolved_holds: usize,
}

#[cfg(test)]
pub(crate) fn transfer_for_tests(intent_id: u64, transfer_ref: &str, amount: u128) -> Transfer {
    Transfer {
        intent_id,
        transfer_ref: TransferRef::from(transfer_ref),
        requester_id: format!("user-{}", intent_id),
        wallet_address: "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359".to_string(),
        amount,
        state: TransferState::Submitted,
        submitted_at: Utc::now(),
        last_checked_at: None,
        failure_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reserved_amount_tracks_submitted_and_holds() {
        let table = TransferTable::new(100);
        table.insert_submitted(transfer_for_tests(1, "tx1", 300));
        table.insert_submitted(transfer_for_tests(2, "tx2", 200));

        let now = Utc::now();
        assert_eq!(table.reserved_amount(now), 500);

        table.observe(&TransferRef::from("tx1"), TransferState::Confirmed, None, now);
        assert_eq!(table.reserved_amount(now), 200);

        table.hold_unresolved(3, 50, now + Duration::seconds(60));
        assert_eq!(table.reserved_amount(now), 250);
        // Expired holds stop counting even before pruning
        assert_eq!(table.reserved_amount(now + Duration::seconds(61)), 200);
        assert_eq!(table.prune_holds(now + Duration::seconds(61)), 1);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let table = TransferTable::new(100);
        table.insert_submitted(transfer_for_tests(1, "tx1", 10));
        let r = TransferRef::from("tx1");
        let now = Utc::now();

        let first = table.observe(&r, TransferState::Failed, Some("reverted".into()), now).unwrap();
        assert!(matches!(first, Transition::Applied(_)));

        let second = table.observe(&r, TransferState::Confirmed, None, now).unwrap();
        assert!(matches!(second, Transition::AlreadyTerminal(_)));
        assert_eq!(second.transfer().state, TransferState::Failed);
        assert_eq!(second.transfer().failure_reason.as_deref(), Some("reverted"));
    }

    #[test]
    fn test_duplicate_reference_ignored() {
        let table = TransferTable::new(100);
        assert!(table.insert_submitted(transfer_for_tests(1, "tx1", 10)));
        assert!(!table.insert_submitted(transfer_for_tests(2, "tx1", 99)));
        assert_eq!(table.get(&TransferRef::from("tx1")).unwrap().intent_id, 1);
    }

    #[test]
    fn test_history_evicts_terminal_only() {
        let table = TransferTable::new(2);
        let now = Utc::now();
        table.insert_submitted(transfer_for_tests(1, "tx1", 1));
        table.insert_submitted(transfer_for_tests(2, "tx2", 1));
        table.observe(&TransferRef::from("tx2"), TransferState::Confirmed, None, now);

        table.insert_submitted(transfer_for_tests(3, "tx3", 1));
        // tx1 is still Submitted, so tx2 is the one evicted
        assert!(table.get(&TransferRef::from("tx1")).is_some());
        assert!(table.get(&TransferRef::from("tx2")).is_none());
        assert!(table.get(&TransferRef::from("tx3")).is_some());

        let recent: Vec<u64> = table.recent(10).iter().map(|t| t.intent_id).collect();
        assert_eq!(recent, vec![3, 1]);
    }

    #[test]
    fn test_unknown_reference() {
        let table = TransferTable::new(10);
        assert!(table.observe(&TransferRef::from("nope"), TransferState::Confirmed, None, Utc::now()).is_none());
    }

    #[test]
    fn test_lookup_by_intent() {
        let table = TransferTable::new(1);
        let now = Utc::now();
        table.insert_submitted(transfer_for_tests(1, "tx1", 5));
        assert_eq!(table.get_by_intent(1).unwrap().transfer_ref, TransferRef::from("tx1"));
        assert!(table.get_by_intent(2).is_none());

        table.observe(&TransferRef::from("tx1"), TransferState::Confirmed, None, now);
        table.insert_submitted(transfer_for_tests(2, "tx2", 5));
        // Evicted rows drop out of the intent index too
        assert!(table.get_by_intent(1).is_none());
        assert_eq!(table.get_by_intent(2).unwrap().intent_id, 2);

        table.hold_unresolved(3, 7, now + Duration::seconds(30));
        assert_eq!(table.hold_for(3, now).map(|h| h.amount), Some(7));
        assert!(table.hold_for(3, now + Duration::seconds(31)).is_none());
    }

    #[test]
    fn test_reserved_total_follows_transitions_and_eviction() {
        let table = TransferTable::new(50);
        let now = Utc::now();
        for i in 1..=200u64 {
            table.insert_submitted(transfer_for_tests(i, &format!("tx{}", i), i as u128));
        }
        for i in (1..=200u64).filter(|i| i % 3 != 0) {
            let state = if i % 2 == 0 { TransferState::Confirmed } else { TransferState::Failed };
            table.observe(&TransferRef::from(format!("tx{}", i).as_str()), state, None, now);
        }
        // Repeated observations of terminal rows change nothing
        table.observe(&TransferRef::from("tx1"), TransferState::Confirmed, None, now);

        let expected: u128 = table.submitted().iter().map(|t| t.amount).sum();
        assert_eq!(expected, (1..=200u128).filter(|i| i % 3 == 0).sum::<u128>());
        assert_eq!(table.reserved_amount(now), expected);
        assert_eq!(table.counts().submitted, 66);
    }
}
