//! CTK Reward Issuance
//!
//! Grants CTK tokens from a single custodial wallet to user wallets. Grants
//! are validated, checked against the custodial balance, submitted to the
//! ledger strictly one at a time and then tracked until confirmed.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── lib.rs          - Crate root with re-exports
//! ├── main.rs         - Server entrypoint
//! ├── config.rs       - Configuration management
//! ├── error.rs        - Error taxonomy
//! ├── ledger/         - Token ledger access
//! │   ├── evm.rs         - ERC-20 over JSON-RPC
//! │   ├── memory.rs      - In-process ledger (dev, tests)
//! │   ├── address.rs     - EIP-55 address checks
//! │   └── units.rs       - Base unit <-> decimal conversions
//! ├── reward/         - Issuance pipeline
//! │   ├── validator.rs   - Request validation
//! │   ├── oracle.rs      - Custodial balance cache
//! │   ├── serializer.rs  - Single-writer transfer queue
//! │   ├── reporter.rs    - Confirmation tracking
//! │   ├── table.rs       - Submitted transfer records
//! │   ├── audit.rs       - Ordered audit writer
//! │   └── issuer.rs      - Pipeline facade
//! ├── api/            - HTTP API endpoints
//! │   ├── reward.rs      - Grant, balance and transfer routes
//! │   └── middleware.rs  - Throttling, security headers
//! └── database/       - PostgreSQL audit trail
//! ```

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod reward;

// Re-export main types for convenience
pub use config::RewardConfig;
pub use database::DatabasePool;
pub use error::{InvalidRequest, LedgerError, RewardError, RewardResult};
pub use ledger::{
    ConfirmationMode, EvmLedger, EvmLedgerConfig, InMemoryLedger, LedgerClient, LedgerView,
    TransferRef, TransferState,
};
pub use reward::{
    AuditSink, ConfirmationReporter, IntentStatus, IssuerSettings, RewardIssuer, RewardOutcome,
    RewardRequest, Transfer,
    run_confirmation_loop,
};
