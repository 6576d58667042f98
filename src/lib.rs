#[macro_use]
extern crate log;

pub use mdl::{MdlContext, MdlService};
pub use transactions::lock::RangeLockManager;
pub use transactions::pessimistic_transaction_db::PessimisticTransactionDB;

pub mod error;
pub mod mdl;
pub mod options;
pub mod sync;
pub mod transactions;

#[cfg(test)]
mod tests;

pub type Result<T> = std::result::Result<T, error::LockError>;
