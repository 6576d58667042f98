pub mod partitioned_rwlock;

pub use partitioned_rwlock::PartitionedRwLock;

use std::time::{Duration, Instant};

/// `None` means the timeout is too large to be represented, i.e. wait forever.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}
