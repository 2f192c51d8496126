//! Transfer audit trail
//!
//! Rows are written where they originate: the serializer worker records a
//! transfer as soon as the ledger accepts it, whether or not its caller is
//! still waiting, and the reporter records each state transition. Both feed
//! one writer task, so a transition is never written ahead of its insert.
//!
//! Writes are best-effort. A failure is logged and never changes a caller's
//! outcome; the in-process table stays the source of truth.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::table::Transfer;

/// Durable store for transfer audit rows.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_submitted(&self, transfer: &Transfer) -> Result<(), String>;

    /// Returns false when there was no `submitted` row to update.
    async fn record_transition(&self, transfer: &Transfer) -> Result<bool, String>;
}

#[derive(Debug)]
enum AuditEvent {
    Submitted(Transfer),
    Transitioned(Transfer),
}

/// Cheap handle for queueing audit writes. A disabled trail drops them.
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    sender: Option<mpsc::UnboundedSender<AuditEvent>>,
}

impl AuditTrail {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Start the writer task. It exits once every handle is dropped and the
    /// queued writes are flushed.
    pub fn spawn(sink: Arc<dyn AuditSink>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(sink, receiver));
        (Self { sender: Some(sender) }, handle)
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn submitted(&self, transfer: &Transfer) {
        self.send(AuditEvent::Submitted(transfer.clone()));
    }

    pub fn transitioned(&self, transfer: &Transfer) {
        self.send(AuditEvent::Transitioned(transfer.clone()));
    }

    fn send(&self, event: AuditEvent) {
        if let Some(sender) = &self.sender
            && sender.send(event).is_err()
        {
            warn!("Audit writer stopped, dropping audit event");
        }
    }
}

async fn run_writer(sink: Arc<dyn AuditSink>, mut receiver: mpsc::UnboundedReceiver<AuditEvent>) {
    info!("Transfer audit writer started");

    while let Some(event) = receiver.recv().await {
        match event {
            AuditEvent::Submitted(transfer) => {
                if let Err(e) = sink.record_submitted(&transfer).await {
                    warn!(
                        intent_id = transfer.intent_id,
                        transfer_ref = %transfer.transfer_ref,
                        error = %e,
                        "Failed to audit submitted transfer"
                    );
                }
            }
            AuditEvent::Transitioned(transfer) => match sink.record_transition(&transfer).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(transfer_ref = %transfer.transfer_ref, "No submitted audit row to transition");
                }
                Err(e) => {
                    warn!(
                        transfer_ref = %transfer.transfer_ref,
                        state = %transfer.state,
                        error = %e,
                        "Failed to audit transfer state"
                    );
                }
            },
        }
    }

    info!("Transfer audit writer stopped");
}

/// In-memory sink that keeps every write, in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub rows: tokio::sync::Mutex<Vec<(&'static str, Transfer)>>,
}

#[cfg(test)]
#[async_trait]
impl AuditSink for RecordingSink {
    async fn record_submitted(&self, transfer: &Transfer) -> Result<(), String> {
        self.rows.lock().await.push(("submitted", transfer.clone()));
        Ok(())
    }

    async fn record_transition(&self, transfer: &Transfer) -> Result<bool, String> {
        let mut rows = self.rows.lock().await;
        let known = rows
            .iter()
            .any(|(kind, t)| *kind == "submitted" && t.transfer_ref == transfer.transfer_ref);
        rows.push(("transition", transfer.clone()));
        Ok(known)
    }
}
