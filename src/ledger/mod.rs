//! Ledger Client interface
//!
//! The external ledger is reached through two traits:
//! - [`LedgerView`] - balance and status reads, shared freely
//! - [`LedgerClient`] - adds transfer submission; only the transfer
//!   serializer ever holds one
//!
//! Implementations:
//! - [`EvmLedger`] - ERC-20 token over Ethereum JSON-RPC
//! - [`InMemoryLedger`] - in-process ledger for dev mode and tests

pub mod address;
pub mod evm;
pub mod memory;
pub mod units;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LedgerResult;

pub use address::{is_valid_address, normalize_address};
pub use evm::{EvmLedger, EvmLedgerConfig};
pub use memory::{ConfirmationMode, InMemoryLedger};
pub use units::format_units;

/// Opaque handle returned by the ledger for a submitted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferRef(pub String);

impl TransferRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle of a transfer on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Accepted by the ledger, not yet confirmed.
    Submitted,
    /// Final and successful.
    Confirmed,
    /// Final and unsuccessful.
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferState::Submitted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Submitted => "submitted",
            TransferState::Confirmed => "confirmed",
            TransferState::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only ledger capability.
#[async_trait]
pub trait LedgerView: Send + Sync {
    /// Token balance of `address` in base units.
    async fn get_balance(&self, address: &str) -> LedgerResult<u128>;

    /// Current state of a previously submitted transfer.
    async fn get_transfer_status(&self, transfer_ref: &TransferRef) -> LedgerResult<TransferState>;

    /// Address of the custodial wallet that funds rewards.
    fn custodial_address(&self) -> &str;
}

/// Full ledger capability including transfer submission from the custodial
/// wallet.
#[async_trait]
pub trait LedgerClient: LedgerView {
    /// Submit a transfer of `amount` base units to `to`.
    async fn submit_transfer(&self, to: &str, amount: u128) -> LedgerResult<TransferRef>;
}
