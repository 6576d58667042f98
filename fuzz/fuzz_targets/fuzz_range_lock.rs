#![no_main]

use kvlock::options::LockManagerOptions;
use kvlock::transactions::lock::key_range::KeyRange;
use kvlock::transactions::lock::RowLockType;
use kvlock::RangeLockManager;
use libfuzzer_sys::arbitrary;
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

#[derive(arbitrary::Arbitrary, Debug)]
enum LockMethod {
    Lock {
        txn: u8,
        low: Vec<u8>,
        high: Vec<u8>,
        write: bool,
    },
    Release {
        txn: u8,
        low: Vec<u8>,
        high: Vec<u8>,
    },
    ReleaseAll {
        txn: u8,
    },
}

fn range(mut low: Vec<u8>, mut high: Vec<u8>) -> KeyRange {
    if low > high {
        std::mem::swap(&mut low, &mut high);
    }
    KeyRange::new(low, high).unwrap()
}

fuzz_target!(|methods: Vec<LockMethod>| {
    let lm = RangeLockManager::new(LockManagerOptions {
        lock_memory_limit: usize::MAX,
        ..LockManagerOptions::default()
    })
    .unwrap();

    use LockMethod::*;
    for method in methods {
        match method {
            Lock {
                txn,
                low,
                high,
                write,
            } => {
                let txn = u64::from(txn % 4) + 1;
                let ty = if write {
                    RowLockType::Write
                } else {
                    RowLockType::Read
                };
                let range = range(low, high);
                if lm.acquire(txn, 1, &range, ty, Duration::from_secs(0)).is_ok() {
                    for held in lm.holders(1, &range) {
                        assert!(held.owners.contains(&txn));
                        assert!(held.mode >= ty);
                    }
                }
            }
            Release { txn, low, high } => {
                let txn = u64::from(txn % 4) + 1;
                let range = range(low, high);
                lm.release(txn, 1, &range);
                assert!(lm
                    .holders(1, &range)
                    .iter()
                    .all(|held| !held.owners.contains(&txn)));
            }
            ReleaseAll { txn } => {
                lm.release_all(u64::from(txn % 4) + 1);
            }
        }

        let granted = lm.granted_locks(1);
        for lock in granted.iter() {
            assert!(!lock.owners.is_empty());
            if lock.mode == RowLockType::Write {
                assert_eq!(lock.owners.len(), 1);
            }
        }
        for pair in granted.windows(2) {
            assert!(!pair[0].range.overlaps(&pair[1].range));
            assert!(pair[0].range.start() < pair[1].range.start());
        }
    }
    for txn in 1..=4 {
        lm.release_all(txn);
    }
    assert!(lm.granted_locks(1).is_empty());
});
