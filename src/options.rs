use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);
#[cfg(not(debug_assertions))]
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(4);

/// Bytes of fine-grained range locks one transaction may hold on one resource
/// before they are escalated to a table lock.
#[cfg(debug_assertions)]
pub const DEFAULT_LOCK_MEMORY_LIMIT: usize = 16 * 1024;
#[cfg(not(debug_assertions))]
pub const DEFAULT_LOCK_MEMORY_LIMIT: usize = 1024 * 1024;

pub const DEFAULT_REGISTRY_PARTITIONS: usize = 8;

/// One year, the same as an unset `lock_wait_timeout`.
pub const DEFAULT_MDL_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockDetection {
    /// Walk the wait-for graph every time a request starts waiting.
    Synchronous,
    /// Scan for cycles from a background thread at a fixed interval.
    Periodic(Duration),
}

/// Which member of a wait-for cycle is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimPolicy {
    /// The transaction with the highest id in the cycle.
    Youngest,
    /// The transaction whose wait closed the cycle. Periodic scans have no
    /// requester and fall back to `Youngest`.
    Requester,
}

#[derive(Debug, Clone)]
pub struct LockManagerOptions {
    pub lock_timeout: Duration,
    pub lock_memory_limit: usize,
    pub deadlock_detection: DeadlockDetection,
    pub victim_policy: VictimPolicy,
    pub registry_partitions: usize,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        LockManagerOptions {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_memory_limit: DEFAULT_LOCK_MEMORY_LIMIT,
            deadlock_detection: DeadlockDetection::Synchronous,
            victim_policy: VictimPolicy::Youngest,
            registry_partitions: DEFAULT_REGISTRY_PARTITIONS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MdlOptions {
    pub lock_wait_timeout: Duration,
    /// Number of high priority grants in a row after which pending low
    /// priority requests are let through once.
    pub max_write_lock_count: u64,
    pub registry_partitions: usize,
}

impl Default for MdlOptions {
    fn default() -> Self {
        MdlOptions {
            lock_wait_timeout: DEFAULT_MDL_LOCK_WAIT_TIMEOUT,
            max_write_lock_count: u64::MAX,
            registry_partitions: DEFAULT_REGISTRY_PARTITIONS,
        }
    }
}
