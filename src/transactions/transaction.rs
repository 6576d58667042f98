use crate::transactions::lock::key_range::KeyRange;
use crate::transactions::lock::{LockManager, RangeLockManager, ResourceID, RowLockType};
use crate::transactions::{TransactionID, TransactionState};
use crate::Result;
use std::sync::{Arc, Mutex};

pub trait Transaction {
    fn txn_id(&self) -> TransactionID;
    fn state(&self) -> TransactionState;
}

/// A transaction that takes row locks before touching data and keeps them
/// until it commits or rolls back.
pub struct PessimisticTransaction {
    txn_id: TransactionID,
    state: Mutex<TransactionState>,
    lock_manager: Arc<RangeLockManager>,
}

impl Transaction for PessimisticTransaction {
    #[inline]
    fn txn_id(&self) -> TransactionID {
        self.txn_id
    }

    fn state(&self) -> TransactionState {
        *self.state.lock().unwrap()
    }
}

impl PessimisticTransaction {
    pub(crate) fn new(
        txn_id: TransactionID,
        lock_manager: Arc<RangeLockManager>,
    ) -> PessimisticTransaction {
        PessimisticTransaction {
            txn_id,
            state: Mutex::new(TransactionState::Active),
            lock_manager,
        }
    }

    /// Locks `range`, waiting up to the lock timeout of the lock manager.
    pub fn lock(&self, resource: ResourceID, range: &KeyRange, lock_type: RowLockType) -> Result<()> {
        self.lock_manager.lock(self, resource, range, lock_type)
    }

    pub fn try_lock(
        &self,
        resource: ResourceID,
        range: &KeyRange,
        lock_type: RowLockType,
    ) -> Result<()> {
        self.lock_manager.try_lock(self, resource, range, lock_type)
    }

    pub fn lock_key(&self, resource: ResourceID, key: &[u8], lock_type: RowLockType) -> Result<()> {
        self.lock(resource, &KeyRange::point(key.to_vec()), lock_type)
    }

    /// Locks the whole resource at once.
    pub fn lock_table(&self, resource: ResourceID, lock_type: RowLockType) -> Result<()> {
        self.lock_manager.lock_table(self, resource, lock_type)
    }

    pub fn unlock(&self, resource: ResourceID, range: &KeyRange) {
        self.lock_manager.unlock(self, resource, range)
    }

    pub fn commit(self) -> Result<()> {
        self.finish(TransactionState::Committing)
    }

    pub fn rollback(self) -> Result<()> {
        self.finish(TransactionState::Aborting)
    }

    fn finish(&self, next: TransactionState) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != TransactionState::Active {
                return Err(crate::error::LockError::TransactionNotActive {
                    txn: self.txn_id,
                    state: *state,
                });
            }
            *state = next;
        }
        self.lock_manager.unlock_all(self);
        *self.state.lock().unwrap() = TransactionState::Closed;
        debug!("txn {} closed after {:?}", self.txn_id, next);
        Ok(())
    }
}

impl Drop for PessimisticTransaction {
    fn drop(&mut self) {
        if self.state() == TransactionState::Active {
            if let Err(e) = self.finish(TransactionState::Aborting) {
                warn!("{}", e);
            }
        }
    }
}
