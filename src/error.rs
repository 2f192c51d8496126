//! Error types for reward issuance.
//!
//! - [`InvalidRequest`] - client-fault input errors, rejected before any ledger call
//! - [`LedgerError`] - raw failures reported by a ledger adapter
//! - [`RewardError`] - the taxonomy returned to callers of the issuer
//!
//! `LedgerError` never crosses the transfer serializer boundary: it is
//! classified into a `RewardError` there.

use thiserror::Error;

// =============================================================================
// Input Errors
// =============================================================================

/// Reasons the validator rejects a reward request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    /// No requester identity was supplied.
    #[error("Requester id is missing")]
    MissingRequester,

    /// The wallet address failed the ledger's address-format check.
    #[error("Malformed wallet address: {0}")]
    MalformedAddress(String),

    /// Amount is not positive or exceeds the per-request maximum.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

// =============================================================================
// Ledger Errors
// =============================================================================

/// Failures reported by a ledger adapter.
///
/// The variants encode whether a request reached the ledger, which decides
/// between "failed" and "outcome unknown" for submissions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The request was never delivered (connection refused, DNS, ...).
    #[error("Ledger unreachable: {0}")]
    Unreachable(String),

    /// No response within the deadline. The request may have been applied.
    #[error("Ledger request timed out")]
    Timeout,

    /// The ledger answered and refused the operation.
    #[error("Ledger rejected request: {0}")]
    Rejected(String),

    /// The request was delivered but the response was lost or unreadable.
    #[error("Ledger response lost: {0}")]
    Ambiguous(String),

    /// The ledger answered with data we cannot interpret.
    #[error("Malformed ledger response: {0}")]
    Malformed(String),

    /// The ledger has no record of the given transfer reference.
    #[error("Unknown transfer reference: {0}")]
    UnknownTransfer(String),
}

impl LedgerError {
    /// Whether a submission that failed this way may still take effect.
    pub fn may_have_applied(&self) -> bool {
        matches!(self, LedgerError::Timeout | LedgerError::Ambiguous(_))
    }
}

// =============================================================================
// Reward Errors
// =============================================================================

/// Typed outcome failures of a reward grant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewardError {
    /// Input rejected by the validator.
    #[error(transparent)]
    Invalid(#[from] InvalidRequest),

    /// The custodial wallet cannot cover the amount.
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Amount asked for, in base units.
        requested: u128,
        /// Observed balance minus unconfirmed submissions.
        available: u128,
    },

    /// Balance could not be read. Nothing was submitted.
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// The transfer was not submitted or was refused by the ledger.
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    /// The transfer may or may not have been applied.
    ///
    /// Callers must poll instead of resubmitting.
    #[error("Outcome unknown for intent {intent_id}")]
    OutcomeUnknown {
        /// Intent whose submission is unresolved.
        intent_id: u64,
    },

    /// Status lookup for a reference this process never issued.
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),
}

impl RewardError {
    /// Whether repeating the same request later can reasonably succeed.
    ///
    /// `OutcomeUnknown` is deliberately not retryable: resubmitting risks a
    /// double transfer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RewardError::LedgerUnavailable(_) | RewardError::SubmissionFailed(_)
        )
    }

    /// Intent to look up later, for outcomes the caller must not retry.
    pub fn intent_id(&self) -> Option<u64> {
        match self {
            RewardError::OutcomeUnknown { intent_id } => Some(*intent_id),
            _ => None,
        }
    }

    /// Stable machine-readable code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            RewardError::Invalid(InvalidRequest::MissingRequester) => "missing_requester",
            RewardError::Invalid(InvalidRequest::MalformedAddress(_)) => "malformed_address",
            RewardError::Invalid(InvalidRequest::InvalidAmount(_)) => "invalid_amount",
            RewardError::InsufficientBalance { .. } => "insufficient_balance",
            RewardError::LedgerUnavailable(_) => "ledger_unavailable",
            RewardError::SubmissionFailed(_) => "submission_failed",
            RewardError::OutcomeUnknown { .. } => "outcome_unknown",
            RewardError::TransferNotFound(_) => "transfer_not_found",
        }
    }
}

/// Result type for reward operations.
pub type RewardResult<T> = Result<T, RewardError>;

/// Result type for ledger adapter operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
