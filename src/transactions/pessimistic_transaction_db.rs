use crate::options::LockManagerOptions;
use crate::transactions::lock::RangeLockManager;
use crate::transactions::transaction::PessimisticTransaction;
use crate::transactions::{TransactionID, TRANSACTION_NULL};
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hands out pessimistic transactions sharing one lock manager.
pub struct PessimisticTransactionDB {
    lock_manager: Arc<RangeLockManager>,
    next_txn_id: AtomicU64,
}

impl PessimisticTransactionDB {
    pub fn open(options: LockManagerOptions) -> Result<PessimisticTransactionDB> {
        let lock_manager = Arc::new(RangeLockManager::new(options)?);
        Ok(PessimisticTransactionDB {
            lock_manager,
            next_txn_id: AtomicU64::new(TRANSACTION_NULL + 1),
        })
    }

    /// Ids grow monotonically, so a later transaction is always younger.
    pub fn begin_transaction(&self) -> PessimisticTransaction {
        let txn_id: TransactionID = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        PessimisticTransaction::new(txn_id, self.lock_manager.clone())
    }

    #[inline]
    pub fn lock_manager(&self) -> &Arc<RangeLockManager> {
        &self.lock_manager
    }
}
