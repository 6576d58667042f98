use crate::mdl::MdlKey;
use crate::transactions::lock::key_range::KeyRange;
use crate::transactions::lock::ResourceID;
use crate::transactions::{TransactionID, TransactionState};
use rayon::ThreadPoolBuildError;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("lock not granted: txn {txn} conflicts with txn {blocking} on resource {resource}")]
    LockNotGranted {
        txn: TransactionID,
        resource: ResourceID,
        blocking: TransactionID,
    },

    #[error("lock wait timeout exceeded: txn {txn} on resource {resource} range {range}")]
    LockTimeout {
        txn: TransactionID,
        resource: ResourceID,
        range: KeyRange,
    },

    #[error("deadlock found when trying to get lock: txn {txn} was chosen as victim")]
    Deadlock { txn: TransactionID },

    #[error("txn {txn} can not acquire locks in state {state:?}")]
    TransactionNotActive {
        txn: TransactionID,
        state: TransactionState,
    },

    #[error("invalid key range: {0}")]
    InvalidRange(String),

    #[error("lock wait timeout exceeded on metadata lock {0}")]
    MdlLockWaitTimeout(MdlKey),

    #[error("deadlock found when trying to get metadata lock {0}")]
    MdlDeadlock(MdlKey),

    #[error("query execution was interrupted")]
    Killed,

    #[error("{0}")]
    IOError(#[from] io::Error),

    #[error("{0}")]
    ThreadPoolBuildError(#[from] ThreadPoolBuildError),

    #[error("{0}")]
    Custom(String),
}

impl PartialEq for LockError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::LockNotGranted {
                    txn: t1,
                    resource: r1,
                    blocking: b1,
                },
                Self::LockNotGranted {
                    txn: t2,
                    resource: r2,
                    blocking: b2,
                },
            ) => t1 == t2 && r1 == r2 && b1 == b2,
            (
                Self::LockTimeout {
                    txn: t1,
                    resource: r1,
                    range: k1,
                },
                Self::LockTimeout {
                    txn: t2,
                    resource: r2,
                    range: k2,
                },
            ) => t1 == t2 && r1 == r2 && k1 == k2,
            (Self::Deadlock { txn: t1 }, Self::Deadlock { txn: t2 }) => t1 == t2,
            (
                Self::TransactionNotActive { txn: t1, state: s1 },
                Self::TransactionNotActive { txn: t2, state: s2 },
            ) => t1 == t2 && s1 == s2,
            (Self::MdlLockWaitTimeout(k1), Self::MdlLockWaitTimeout(k2))
            | (Self::MdlDeadlock(k1), Self::MdlDeadlock(k2)) => k1 == k2,
            (Self::Killed, Self::Killed)
            | (Self::IOError(_), Self::IOError(_))
            | (Self::ThreadPoolBuildError(_), Self::ThreadPoolBuildError(_)) => true,
            (Self::InvalidRange(s1), Self::InvalidRange(s2))
            | (Self::Custom(s1), Self::Custom(s2)) => s1.eq(s2),
            _ => false,
        }
    }
}

impl LockError {
    /// Whether the caller should roll back and retry its transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockNotGranted { .. }
                | Self::LockTimeout { .. }
                | Self::Deadlock { .. }
                | Self::MdlLockWaitTimeout(_)
                | Self::MdlDeadlock(_)
        )
    }
}
