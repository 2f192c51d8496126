//! Reward issuance pipeline
//!
//! - `validator`  - static request checks
//! - `oracle`     - cached custodial balance and sufficiency checks
//! - `serializer` - single-writer FIFO path to the ledger
//! - `reporter`   - submission acknowledgement and confirmation tracking
//! - `table`      - in-process record of submitted transfers
//! - `audit`      - best-effort durable audit of transfers
//! - `issuer`     - the facade tying them together

pub mod audit;
pub mod issuer;
pub mod oracle;
pub mod reporter;
pub mod serializer;
pub mod table;
pub mod validator;

pub use audit::{AuditSink, AuditTrail};
pub use issuer::{IntentStatus, IssuerSettings, IssuerStats, RewardIssuer};
pub use oracle::{BalanceOracle, LedgerBalanceSnapshot};
pub use reporter::{ConfirmationReporter, PollSummary, RewardOutcome, run_confirmation_loop};
pub use serializer::{QueueStats, SerializerConfig, TransferIntent, TransferSerializer};
pub use table::{TableCounts, Transfer, TransferTable, Transition, UnresolvedHold};
pub use validator::{RequestValidator, RewardRequest, ValidatedRequest};
