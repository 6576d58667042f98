use crate::transactions::lock::key_range::KeyRange;
use crate::transactions::lock::{ResourceID, RowLockType};
use crate::transactions::TransactionID;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Granted,
    TimedOut,
    Deadlock,
    /// The transaction released all its locks while the request was queued.
    Cancelled,
}

/// A lock request that could not be granted right away and sits in the
/// pending queue of a lock table.
///
/// The state leaves `Pending` exactly once, always under the mutex of the lock
/// table the request is queued in.
pub struct LockRequest {
    pub txn: TransactionID,
    pub resource: ResourceID,
    pub range: KeyRange,
    pub ty: RowLockType,
    inner: Mutex<RequestState>,
    cond: Condvar,
}

impl LockRequest {
    pub fn new(
        txn: TransactionID,
        resource: ResourceID,
        range: KeyRange,
        ty: RowLockType,
    ) -> LockRequest {
        LockRequest {
            txn,
            resource,
            range,
            ty,
            inner: Mutex::new(RequestState::Pending),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> RequestState {
        *self.inner.lock().unwrap()
    }

    /// Moves a pending request to `state` and wakes its waiter. Returns false
    /// if the request was already completed.
    pub(crate) fn complete(&self, state: RequestState) -> bool {
        debug_assert_ne!(state, RequestState::Pending);
        let mut guard = self.inner.lock().unwrap();
        if *guard != RequestState::Pending {
            return false;
        }
        *guard = state;
        self.cond.notify_all();
        true
    }

    /// Blocks until the request is completed or `deadline` passes, returning
    /// the state observed last.
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) -> RequestState {
        let mut guard = self.inner.lock().unwrap();
        while *guard == RequestState::Pending {
            match deadline {
                None => guard = self.cond.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    guard = self.cond.wait_timeout(guard, deadline - now).unwrap().0;
                }
            }
        }
        *guard
    }
}
