use kvlock::error::LockError;
use kvlock::options::LockManagerOptions;
use kvlock::transactions::lock::key_range::KeyRange;
use kvlock::transactions::lock::{LockManager, RowLockType};
use kvlock::transactions::transaction::Transaction;
use kvlock::transactions::{TransactionID, TransactionState};
use kvlock::PessimisticTransactionDB;
use std::time::Duration;

struct FixedTransaction {
    id: TransactionID,
    state: TransactionState,
}

impl Transaction for FixedTransaction {
    fn txn_id(&self) -> TransactionID {
        self.id
    }

    fn state(&self) -> TransactionState {
        self.state
    }
}

fn open() -> PessimisticTransactionDB {
    let _ = env_logger::try_init();
    PessimisticTransactionDB::open(LockManagerOptions {
        lock_timeout: Duration::from_millis(50),
        ..LockManagerOptions::default()
    })
    .unwrap()
}

#[test]
fn test_inactive_transaction_can_not_lock() {
    let db = open();
    let lm = db.lock_manager();
    let range = KeyRange::point(b"k".to_vec());
    for &state in [
        TransactionState::Committing,
        TransactionState::Aborting,
        TransactionState::Closed,
    ]
    .iter()
    {
        let txn = FixedTransaction { id: 100, state };
        assert_eq!(
            lm.lock(&txn, 1, &range, RowLockType::Read).unwrap_err(),
            LockError::TransactionNotActive { txn: 100, state }
        );
        assert_eq!(
            lm.try_lock(&txn, 1, &range, RowLockType::Read).unwrap_err(),
            LockError::TransactionNotActive { txn: 100, state }
        );
        assert_eq!(
            lm.lock_table(&txn, 1, RowLockType::Read).unwrap_err(),
            LockError::TransactionNotActive { txn: 100, state }
        );
    }

    let active = FixedTransaction {
        id: 101,
        state: TransactionState::Active,
    };
    lm.try_lock(&active, 1, &range, RowLockType::Write).unwrap();
    assert_eq!(lm.holders(1, &range)[0].owners, vec![101]);
    lm.unlock(&active, 1, &range);
    assert!(lm.holders(1, &range).is_empty());
}

#[test]
fn test_table_lock_then_commit() {
    let db = open();
    let t1 = db.begin_transaction();
    let t2 = db.begin_transaction();
    assert!(t2.txn_id() > t1.txn_id());

    t1.lock_table(9, RowLockType::Read).unwrap();
    t2.lock_key(9, b"x", RowLockType::Read).unwrap();
    let err = t2.lock_key(9, b"y", RowLockType::Write).unwrap_err();
    assert!(matches!(err, LockError::LockTimeout { .. }));

    t1.commit().unwrap();
    t2.lock_key(9, b"y", RowLockType::Write).unwrap();
    t2.rollback().unwrap();
    assert!(db.lock_manager().granted_locks(9).is_empty());
}

#[test]
fn test_unlock_part_of_range() {
    let db = open();
    let t1 = db.begin_transaction();
    let t2 = db.begin_transaction();
    let range = KeyRange::new(b"a".to_vec(), b"z".to_vec()).unwrap();
    t1.lock(2, &range, RowLockType::Write).unwrap();

    t1.unlock(2, &KeyRange::point(b"q".to_vec()));
    t2.try_lock(2, &KeyRange::point(b"q".to_vec()), RowLockType::Write)
        .unwrap();
    assert!(t2
        .try_lock(2, &KeyRange::point(b"p".to_vec()), RowLockType::Read)
        .is_err());
    assert_eq!(db.lock_manager().granted_locks(2).len(), 3);

    drop(t1);
    t2.try_lock(2, &KeyRange::point(b"p".to_vec()), RowLockType::Read)
        .unwrap();
    t2.commit().unwrap();
    assert!(db.lock_manager().granted_locks(2).is_empty());
}
