//! PostgreSQL audit trail for reward transfers.

pub mod pool;
pub mod transfers;

pub use pool::DatabasePool;
pub use transfers::TransferRepository;
