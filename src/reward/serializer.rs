//! Transfer Serializer
//!
//! The only path to the ledger's submission capability. Callers enqueue
//! intents and wait for their turn; a single worker task submits them one at a
//! time, strictly in `intent_id` order:
//!
//! ```text
//!  caller ─┐                         ┌─ re-check balance (BalanceOracle)
//!  caller ─┼─► mpsc queue ─► worker ─┼─ submit_transfer (LedgerClient)
//!  caller ─┘   (FIFO)                └─ record Submitted (TransferTable)
//!       ▲                                    │
//!       └──────────── oneshot reply ◄────────┘
//! ```
//!
//! Each intent carries a phase flag shared with its caller. A caller that
//! gives up while the intent is still queued withdraws it and the worker skips
//! it; a caller that gives up after the worker picked it up gets
//! `OutcomeUnknown`, never a plain failure.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::audit::AuditTrail;
use super::oracle::BalanceOracle;
use super::table::{Transfer, TransferTable};
use super::validator::ValidatedRequest;
use crate::error::{RewardError, RewardResult};
use crate::ledger::{LedgerClient, TransferState};

/// A queued transfer, owned by the serializer from enqueue to dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    pub intent_id: u64,
    pub requester_id: String,
    pub wallet_address: String,
    pub amount: u128,
    pub enqueued_at: DateTime<Utc>,
}

const PHASE_QUEUED: u8 = 0;
const PHASE_IN_FLIGHT: u8 = 1;
const PHASE_WITHDRAWN: u8 = 2;

#[derive(Debug)]
struct IntentPhase(AtomicU8);

impl IntentPhase {
    fn new() -> Self {
        Self(AtomicU8::new(PHASE_QUEUED))
    }

    /// Worker side: claim the intent for submission.
    fn begin(&self) -> bool {
        self.0
            .compare_exchange(PHASE_QUEUED, PHASE_IN_FLIGHT, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Caller side: take the intent back before the worker reaches it.
    fn withdraw(&self) -> bool {
        self.0
            .compare_exchange(PHASE_QUEUED, PHASE_WITHDRAWN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_in_flight(&self) -> bool {
        self.0.load(Ordering::SeqCst) == PHASE_IN_FLIGHT
    }
}

/// Withdraws a still-queued intent when the waiting caller goes away
/// (e.g. the HTTP client disconnected).
struct WithdrawOnDrop {
    intent_id: u64,
    phase: Arc<IntentPhase>,
    stats: Arc<SerializerStats>,
}

impl Drop for WithdrawOnDrop {
    fn drop(&mut self) {
        if self.phase.withdraw() {
            self.stats.withdrawn.fetch_add(1, Ordering::Relaxed);
            debug!(intent_id = self.intent_id, "Intent withdrawn before submission");
        }
    }
}

struct QueuedIntent {
    intent: TransferIntent,
    phase: Arc<IntentPhase>,
    reply: oneshot::Sender<RewardResult<Transfer>>,
}

struct Enqueuer {
    next_intent_id: u64,
    sender: mpsc::UnboundedSender<QueuedIntent>,
}

#[derive(Debug, Default)]
struct SerializerStats {
    enqueued: AtomicU64,
    submitted: AtomicU64,
    insufficient: AtomicU64,
    ledger_unavailable: AtomicU64,
    failed: AtomicU64,
    outcome_unknown: AtomicU64,
    withdrawn: AtomicU64,
    caller_timeouts: AtomicU64,
    /// Intent currently being submitted, 0 when idle
    in_flight: AtomicU64,
    depth: AtomicUsize,
    max_depth: AtomicUsize,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub depth: usize,
    pub max_depth: usize,
    pub enqueued: u64,
    pub submitted: u64,
    pub insufficient: u64,
    pub ledger_unavailable: u64,
    pub failed: u64,
    pub outcome_unknown: u64,
    pub withdrawn: u64,
    /// Callers that stopped waiting while their intent was being submitted
    pub caller_timeouts: u64,
}

#[derive(Debug, Clone)]
pub struct SerializerConfig {
    /// How long a caller waits for its intent's result
    pub queue_timeout: Duration,
    /// Bound on a single `submit_transfer` call
    pub ledger_timeout: Duration,
    /// How long funds stay reserved after an unknown outcome
    pub unresolved_hold: Duration,
    /// Queue depth above which a warning is logged
    pub depth_warning: usize,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(30),
            ledger_timeout: Duration::from_secs(10),
            unresolved_hold: Duration::from_secs(600),
            depth_warning: 100,
        }
    }
}

pub struct TransferSerializer {
    enqueuer: Mutex<Enqueuer>,
    stats: Arc<SerializerStats>,
    config: SerializerConfig,
}

impl TransferSerializer {
    /// Start the worker. The ledger client is moved into it and is not
    /// reachable from anywhere else.
    pub fn spawn(
        ledger: Arc<dyn LedgerClient>,
        oracle: Arc<BalanceOracle>,
        table: Arc<TransferTable>,
        audit: AuditTrail,
        config: SerializerConfig,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(SerializerStats::default());

        let worker = SerializerWorker {
            receiver,
            ledger,
            oracle,
            table,
            audit,
            stats: stats.clone(),
            ledger_timeout: config.ledger_timeout,
            unresolved_hold: ChronoDuration::from_std(config.unresolved_hold)
                .unwrap_or(ChronoDuration::zero()),
        };
        let handle = tokio::spawn(worker.run());

        info!(
            queue_timeout_ms = config.queue_timeout.as_millis() as u64,
            ledger_timeout_ms = config.ledger_timeout.as_millis() as u64,
            "Transfer serializer started"
        );

        let serializer = Self {
            enqueuer: Mutex::new(Enqueuer {
                next_intent_id: 1,
                sender,
            }),
            stats,
            config,
        };
        (serializer, handle)
    }

    /// Queue a transfer and wait for the worker's verdict.
    pub async fn submit(&self, request: &ValidatedRequest) -> RewardResult<Transfer> {
        let (reply, mut reply_rx) = oneshot::channel();
        let phase = Arc::new(IntentPhase::new());
        let intent_id = self.enqueue(request, phase.clone(), reply)?;

        let _withdraw = WithdrawOnDrop {
            intent_id,
            phase: phase.clone(),
            stats: self.stats.clone(),
        };

        match tokio::time::timeout(self.config.queue_timeout, &mut reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) if phase.is_in_flight() => {
                error!(intent_id, "Transfer worker dropped an in-flight intent");
                self.stats.outcome_unknown.fetch_add(1, Ordering::Relaxed);
                Err(RewardError::OutcomeUnknown { intent_id })
            }
            Ok(Err(_)) => Err(RewardError::SubmissionFailed("transfer worker stopped".to_string())),
            Err(_) => {
                if phase.withdraw() {
                    self.stats.withdrawn.fetch_add(1, Ordering::Relaxed);
                    warn!(intent_id, "Timed out waiting in queue; intent withdrawn");
                    return Err(RewardError::SubmissionFailed(
                        "timed out waiting in queue; transfer was not submitted".to_string(),
                    ));
                }

                // The worker already owns the intent; its answer may have just landed.
                match reply_rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => {
                        // The worker counts the intent's real outcome when it lands.
                        self.stats.caller_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(intent_id, "Timed out during submission; outcome unknown");
                        Err(RewardError::OutcomeUnknown { intent_id })
                    }
                }
            }
        }
    }

    fn enqueue(
        &self,
        request: &ValidatedRequest,
        phase: Arc<IntentPhase>,
        reply: oneshot::Sender<RewardResult<Transfer>>,
    ) -> RewardResult<u64> {
        // Id assignment and send happen under one lock so queue order is id order.
        let mut enqueuer = self.enqueuer.lock().unwrap_or_else(PoisonError::into_inner);
        let intent_id = enqueuer.next_intent_id;
        enqueuer.next_intent_id += 1;

        let intent = TransferIntent {
            intent_id,
            requester_id: request.requester_id().to_string(),
            wallet_address: request.wallet_address().to_string(),
            amount: request.amount(),
            enqueued_at: Utc::now(),
        };

        enqueuer
            .sender
            .send(QueuedIntent { intent, phase, reply })
            .map_err(|_| RewardError::SubmissionFailed("transfer worker stopped".to_string()))?;

        let depth = self.stats.depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_depth.fetch_max(depth, Ordering::Relaxed);
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        if depth == self.config.depth_warning + 1 {
            warn!(depth, threshold = self.config.depth_warning, "Transfer queue depth above threshold");
        }

        debug!(
            intent_id,
            requester_id = %request.requester_id(),
            amount = %request.amount(),
            depth,
            "Intent enqueued"
        );
        Ok(intent_id)
    }

    pub fn stats(&self) -> QueueStats {
        let s = &self.stats;
        QueueStats {
            depth: s.depth.load(Ordering::SeqCst),
            max_depth: s.max_depth.load(Ordering::Relaxed),
            enqueued: s.enqueued.load(Ordering::Relaxed),
            submitted: s.submitted.load(Ordering::Relaxed),
            insufficient: s.insufficient.load(Ordering::Relaxed),
            ledger_unavailable: s.ledger_unavailable.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            outcome_unknown: s.outcome_unknown.load(Ordering::Relaxed),
            withdrawn: s.withdrawn.load(Ordering::Relaxed),
            caller_timeouts: s.caller_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Intent the worker is submitting right now, if any.
    pub fn in_flight_intent(&self) -> Option<u64> {
        match self.stats.in_flight.load(Ordering::SeqCst) {
            0 => None,
            intent_id => Some(intent_id),
        }
    }
}

struct SerializerWorker {
    receiver: mpsc::UnboundedReceiver<QueuedIntent>,
    ledger: Arc<dyn LedgerClient>,
    oracle: Arc<BalanceOracle>,
    table: Arc<TransferTable>,
    audit: AuditTrail,
    stats: Arc<SerializerStats>,
    ledger_timeout: Duration,
    unresolved_hold: ChronoDuration,
}

impl SerializerWorker {
    async fn run(mut self) {
        while let Some(queued) = self.receiver.recv().await {
            self.stats.depth.fetch_sub(1, Ordering::SeqCst);

            self.stats.in_flight.store(queued.intent.intent_id, Ordering::SeqCst);
            if !queued.phase.begin() {
                self.stats.in_flight.store(0, Ordering::SeqCst);
                debug!(intent_id = queued.intent.intent_id, "Skipping withdrawn intent");
                continue;
            }

            let result = self.process(&queued.intent).await;
            self.stats.in_flight.store(0, Ordering::SeqCst);
            self.count(&result);
            // Caller may have timed out; it learns the outcome via polling.
            let _ = queued.reply.send(result);
        }

        info!("Transfer serializer stopped");
    }

    async fn process(&self, intent: &TransferIntent) -> RewardResult<Transfer> {
        // Balance may have moved since the caller's pre-check.
        self.oracle.check_sufficient(intent.amount).await?;

        let submitted_at = Utc::now();
        let outcome = tokio::time::timeout(
            self.ledger_timeout,
            self.ledger.submit_transfer(&intent.wallet_address, intent.amount),
        )
        .await;

        match outcome {
            Ok(Ok(transfer_ref)) => {
                let transfer = Transfer {
                    intent_id: intent.intent_id,
                    transfer_ref,
                    requester_id: intent.requester_id.clone(),
                    wallet_address: intent.wallet_address.clone(),
                    amount: intent.amount,
                    state: TransferState::Submitted,
                    submitted_at,
                    last_checked_at: None,
                    failure_reason: None,
                };
                if self.table.insert_submitted(transfer.clone()) {
                    self.audit.submitted(&transfer);
                }
                self.oracle.invalidate();

                info!(
                    intent_id = intent.intent_id,
                    transfer_ref = %transfer.transfer_ref,
                    requester_id = %intent.requester_id,
                    amount = %intent.amount,
                    "Transfer submitted"
                );
                Ok(transfer)
            }
            Ok(Err(e)) if e.may_have_applied() => Err(self.unresolved(intent, &e.to_string())),
            Ok(Err(e)) => {
                warn!(intent_id = intent.intent_id, error = %e, "Transfer submission failed");
                Err(RewardError::SubmissionFailed(e.to_string()))
            }
            Err(_) => Err(self.unresolved(intent, "ledger acknowledgement timed out")),
        }
    }

    /// The transfer may have landed: keep its amount reserved and force a
    /// fresh balance read.
    fn unresolved(&self, intent: &TransferIntent, reason: &str) -> RewardError {
        self.table
            .hold_unresolved(intent.intent_id, intent.amount, Utc::now() + self.unresolved_hold);
        self.oracle.invalidate();

        warn!(
            intent_id = intent.intent_id,
            requester_id = %intent.requester_id,
            amount = %intent.amount,
            reason = %reason,
            "Transfer outcome unknown"
        );
        RewardError::OutcomeUnknown {
            intent_id: intent.intent_id,
        }
    }

    fn count(&self, result: &RewardResult<Transfer>) {
        let counter = match result {
            Ok(_) => &self.stats.submitted,
            Err(RewardError::InsufficientBalance { .. }) => &self.stats.insufficient,
            Err(RewardError::LedgerUnavailable(_)) => &self.stats.ledger_unavailable,
            Err(RewardError::OutcomeUnknown { .. }) => &self.stats.outcome_unknown,
            Err(_) => &self.stats.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
