pub mod lock;
pub mod pessimistic_transaction_db;
pub mod transaction;

pub type TransactionID = u64;
pub const TRANSACTION_NULL: TransactionID = 0;

/// Lifecycle of a transaction as seen by the lock manager. Locks can only be
/// acquired while `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Aborting,
    Closed,
}
