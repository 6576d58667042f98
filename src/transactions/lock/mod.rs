pub mod deadlock;
pub mod key_range;
pub mod range_lock_table;
pub(crate) mod row_lock;

use self::deadlock::{choose_victim, WaitForGraph};
use self::key_range::KeyRange;
use self::range_lock_table::{Acquire, Expired, GrantedLock, RangeLockTable, TableState};
use self::row_lock::{LockRequest, RequestState};
use super::transaction::Transaction;
use crate::error::LockError;
use crate::options::{DeadlockDetection, LockManagerOptions};
use crate::sync::{deadline_after, PartitionedRwLock};
use crate::transactions::{TransactionID, TransactionState};
use crate::Result;
use arc_swap::ArcSwapOption;
use crossbeam_channel::{RecvTimeoutError, Sender};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type ResourceID = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowLockType {
    Read = 0,
    Write = 1,
}

impl Default for RowLockType {
    fn default() -> Self {
        RowLockType::Write
    }
}

pub trait LockManager {
    /// Acquires without waiting.
    fn try_lock(
        &self,
        txn: &impl Transaction,
        resource: ResourceID,
        range: &KeyRange,
        lock_type: RowLockType,
    ) -> Result<()>;

    /// Acquires, waiting up to the configured lock timeout.
    fn lock(
        &self,
        txn: &impl Transaction,
        resource: ResourceID,
        range: &KeyRange,
        lock_type: RowLockType,
    ) -> Result<()>;

    /// Locks the whole resource, waiting up to the configured lock timeout.
    fn lock_table(
        &self,
        txn: &impl Transaction,
        resource: ResourceID,
        lock_type: RowLockType,
    ) -> Result<()>;

    fn unlock(&self, txn: &impl Transaction, resource: ResourceID, range: &KeyRange);

    fn unlock_all(&self, txn: &impl Transaction);
}

/// Passed to the timeout callback when a lock wait expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeoutInfo {
    pub txn: TransactionID,
    pub resource: ResourceID,
    pub range: KeyRange,
    pub lock_type: RowLockType,
    pub blocking_txn: Option<TransactionID>,
    pub blocking_range: Option<KeyRange>,
}

pub type LockTimeoutCallback = Box<dyn Fn(&LockTimeoutInfo) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockManagerStats {
    pub granted: u64,
    pub waits: u64,
    pub timeouts: u64,
    pub deadlocks: u64,
    pub escalations: u64,
    pub escalations_deferred: u64,
}

#[derive(Default)]
struct StatCounters {
    granted: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    deadlocks: AtomicU64,
    escalations: AtomicU64,
    escalations_deferred: AtomicU64,
}

#[inline]
fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// What one transaction holds on one resource.
#[derive(Default)]
struct TableFootprint {
    memory: usize,
    strongest: Option<RowLockType>,
    escalated: Option<RowLockType>,
}

impl TableFootprint {
    fn record(&mut self, range: &KeyRange, ty: RowLockType) {
        self.memory += range.footprint();
        self.strongest = std::cmp::max(self.strongest, Some(ty));
    }

    fn reset_to_table_lock(&mut self, ty: RowLockType) {
        self.memory = KeyRange::full().footprint();
        self.strongest = std::cmp::max(self.strongest, Some(ty));
        self.escalated = std::cmp::max(self.escalated, Some(ty));
    }
}

#[derive(Default)]
struct TxnLocks {
    tables: HashMap<ResourceID, TableFootprint>,
}

const DETECTOR_THREAD_NAME: &str = "deadlock detector";

struct LockManagerInner {
    options: LockManagerOptions,
    tables: PartitionedRwLock<HashMap<ResourceID, Arc<RangeLockTable>>>,
    txn_locks: DashMap<TransactionID, TxnLocks>,
    timeout_callback: ArcSwapOption<LockTimeoutCallback>,
    stats: StatCounters,
}

impl LockManagerInner {
    fn find_table(&self, resource: ResourceID) -> Option<Arc<RangeLockTable>> {
        self.tables.read().get(&resource).cloned()
    }

    fn table(&self, resource: ResourceID) -> Arc<RangeLockTable> {
        if let Some(table) = self.find_table(resource) {
            return table;
        }
        let mut guard = self.tables.write();
        guard
            .entry(resource)
            .or_insert_with(|| Arc::new(RangeLockTable::new(resource)))
            .clone()
    }

    fn escalated_mode(&self, txn: TransactionID, resource: ResourceID) -> Option<RowLockType> {
        self.txn_locks
            .get(&txn)
            .and_then(|locks| locks.tables.get(&resource).and_then(|fp| fp.escalated))
    }

    fn acquire(
        &self,
        txn: TransactionID,
        resource: ResourceID,
        range: &KeyRange,
        ty: RowLockType,
        timeout: Duration,
    ) -> Result<()> {
        if let Some(mode) = self.escalated_mode(txn, resource) {
            if mode >= ty {
                return Ok(());
            }
        }
        let table = self.table(resource);
        self.txn_locks
            .entry(txn)
            .or_default()
            .tables
            .entry(resource)
            .or_default();

        let wait = timeout > Duration::from_secs(0);
        match table.acquire(txn, range, ty, wait) {
            Acquire::AlreadyHeld => Ok(()),
            Acquire::Granted => {
                incr(&self.stats.granted);
                self.on_granted(txn, &table, range, ty);
                Ok(())
            }
            Acquire::Conflict { blocking, .. } => Err(LockError::LockNotGranted {
                txn,
                resource,
                blocking,
            }),
            Acquire::Waiting(request) => self.wait_for_grant(&table, request, timeout),
        }
    }

    fn wait_for_grant(
        &self,
        table: &RangeLockTable,
        request: Arc<LockRequest>,
        timeout: Duration,
    ) -> Result<()> {
        incr(&self.stats.waits);
        debug!(
            "txn {} waits for {:?} lock on resource {} range {}",
            request.txn, request.ty, request.resource, request.range
        );
        if self.options.deadlock_detection == DeadlockDetection::Synchronous {
            self.detect(Some(request.txn));
        }

        let mut state = request.wait_until(deadline_after(timeout));
        if state == RequestState::Pending {
            state = match table.expire(&request) {
                Expired::AlreadyCompleted(state) => state,
                Expired::TimedOut(blocking) => return Err(self.on_timeout(&request, blocking)),
            };
        }
        match state {
            RequestState::Granted => {
                self.on_granted(request.txn, table, &request.range, request.ty);
                Ok(())
            }
            RequestState::Deadlock => Err(LockError::Deadlock { txn: request.txn }),
            RequestState::Cancelled => Err(LockError::Custom(format!(
                "lock request of txn {} on resource {} was cancelled",
                request.txn, request.resource
            ))),
            RequestState::TimedOut | RequestState::Pending => Err(self.on_timeout(&request, None)),
        }
    }

    fn on_timeout(
        &self,
        request: &LockRequest,
        blocking: Option<(TransactionID, KeyRange)>,
    ) -> LockError {
        incr(&self.stats.timeouts);
        let (blocking_txn, blocking_range) = match blocking {
            Some((txn, range)) => (Some(txn), Some(range)),
            None => (None, None),
        };
        warn!(
            "txn {} timed out waiting for resource {} range {}, blocked by {:?}",
            request.txn, request.resource, request.range, blocking_txn
        );
        if let Some(callback) = self.timeout_callback.load_full() {
            let info = LockTimeoutInfo {
                txn: request.txn,
                resource: request.resource,
                range: request.range.clone(),
                lock_type: request.ty,
                blocking_txn,
                blocking_range,
            };
            (*callback)(&info);
        }
        LockError::LockTimeout {
            txn: request.txn,
            resource: request.resource,
            range: request.range.clone(),
        }
    }

    /// Records a new grant and escalates when the transaction holds too much
    /// on the resource.
    fn on_granted(
        &self,
        txn: TransactionID,
        table: &RangeLockTable,
        range: &KeyRange,
        ty: RowLockType,
    ) {
        let escalate_to = {
            let mut locks = self.txn_locks.entry(txn).or_default();
            let fp = locks.tables.entry(table.resource()).or_default();
            fp.record(range, ty);
            match fp.strongest {
                Some(mode)
                    if fp.memory > self.options.lock_memory_limit
                        && fp.escalated.map_or(true, |e| e < mode) =>
                {
                    Some(mode)
                }
                _ => None,
            }
        };
        if let Some(mode) = escalate_to {
            self.escalate(txn, table, mode);
        }
    }

    fn escalate(&self, txn: TransactionID, table: &RangeLockTable, mode: RowLockType) {
        if !table.try_escalate(txn, mode) {
            incr(&self.stats.escalations_deferred);
            warn!(
                "escalation of txn {} on resource {} deferred by a conflicting holder",
                txn,
                table.resource()
            );
            return;
        }
        if let Some(mut locks) = self.txn_locks.get_mut(&txn) {
            if let Some(fp) = locks.tables.get_mut(&table.resource()) {
                fp.reset_to_table_lock(mode);
            }
        }
        incr(&self.stats.escalations);
        debug!(
            "escalated locks of txn {} on resource {} to a {:?} table lock",
            txn,
            table.resource(),
            mode
        );
    }

    fn prelock_table(
        &self,
        txn: TransactionID,
        resource: ResourceID,
        ty: RowLockType,
        timeout: Duration,
    ) -> Result<()> {
        self.acquire(txn, resource, &KeyRange::full(), ty, timeout)?;
        if let Some(mut locks) = self.txn_locks.get_mut(&txn) {
            if let Some(fp) = locks.tables.get_mut(&resource) {
                fp.reset_to_table_lock(ty);
            }
        }
        Ok(())
    }

    fn release(&self, txn: TransactionID, resource: ResourceID, range: &KeyRange) {
        // The table lock of an escalated transaction stays until release_all.
        if self.escalated_mode(txn, resource).is_some() {
            debug!(
                "txn {} keeps its table lock on resource {} after releasing {}",
                txn, resource, range
            );
            return;
        }
        let table = match self.find_table(resource) {
            Some(table) => table,
            None => return,
        };
        table.release(txn, range);
        let memory: usize = table.owned_ranges(txn).iter().map(KeyRange::footprint).sum();
        if let Some(mut locks) = self.txn_locks.get_mut(&txn) {
            if let Some(fp) = locks.tables.get_mut(&resource) {
                fp.memory = memory;
            }
        }
    }

    fn release_all(&self, txn: TransactionID) {
        if let Some((_, locks)) = self.txn_locks.remove(&txn) {
            for resource in locks.tables.keys() {
                if let Some(table) = self.find_table(*resource) {
                    table.release_all(txn);
                }
            }
        }
    }

    fn sorted_tables(&self) -> Vec<Arc<RangeLockTable>> {
        let mut tables: Vec<_> = self.tables.read().values().cloned().collect();
        tables.sort_by_key(|t| t.resource());
        tables
    }

    /// Aborts waiters until the wait-for graph has no cycle, or no cycle
    /// through `requester` when one is given. Returns the number of victims.
    fn detect(&self, requester: Option<TransactionID>) -> usize {
        let tables = self.sorted_tables();
        // Tables are locked in resource order, the only place two are held.
        let mut guards: Vec<MutexGuard<'_, TableState>> =
            tables.iter().map(|t| t.lock_state()).collect();

        let mut victims = 0;
        loop {
            let graph = WaitForGraph::build(guards.iter().map(|g| &**g));
            let cycle = match requester {
                Some(txn) => graph.find_cycle_from(txn),
                None => graph.find_any_cycle(),
            };
            let cycle = match cycle {
                Some(c) => c,
                None => break,
            };
            let victim = match choose_victim(&cycle, self.options.victim_policy, requester) {
                Some(v) => v,
                None => break,
            };
            let request = match graph.request_of(victim) {
                Some(r) => r.clone(),
                None => break,
            };
            match tables.iter().position(|t| t.resource() == request.resource) {
                Some(idx) => guards[idx].cancel(&request, RequestState::Deadlock),
                None => break,
            };
            victims += 1;
            incr(&self.stats.deadlocks);
            debug!("deadlock cycle {:?}, victim txn {}", cycle, victim);
            if Some(victim) == requester {
                break;
            }
        }
        victims
    }
}

struct DeadlockDetector {
    sender: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    fn start(inner: Arc<LockManagerInner>, interval: Duration) -> Result<DeadlockDetector> {
        let (sender, receiver) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(DETECTOR_THREAD_NAME.to_owned())
            .spawn(move || {
                info!("thread `{}` start!", DETECTOR_THREAD_NAME);
                while let Err(RecvTimeoutError::Timeout) = receiver.recv_timeout(interval) {
                    let victims = inner.detect(None);
                    if victims > 0 {
                        debug!("periodic detection aborted {} waiters", victims);
                    }
                }
                info!("thread `{}` exit!", DETECTOR_THREAD_NAME);
            })?;
        Ok(DeadlockDetector {
            sender: Some(sender),
            handle: Some(handle),
        })
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("thread `{}` panicked", DETECTOR_THREAD_NAME);
            }
        }
    }
}

/// Range lock manager shared by all transactions of a database.
///
/// Each resource (a table or index) has its own [`RangeLockTable`]. Waits are
/// checked for deadlocks either synchronously or by a background thread,
/// depending on [`LockManagerOptions::deadlock_detection`].
pub struct RangeLockManager {
    inner: Arc<LockManagerInner>,
    _detector: Option<DeadlockDetector>,
}

impl RangeLockManager {
    pub fn new(options: LockManagerOptions) -> Result<RangeLockManager> {
        let partitions = options.registry_partitions;
        let detection = options.deadlock_detection;
        let inner = Arc::new(LockManagerInner {
            options,
            tables: PartitionedRwLock::new(partitions, HashMap::new()),
            txn_locks: DashMap::new(),
            timeout_callback: ArcSwapOption::empty(),
            stats: StatCounters::default(),
        });
        let detector = match detection {
            DeadlockDetection::Synchronous => None,
            DeadlockDetection::Periodic(interval) => {
                Some(DeadlockDetector::start(inner.clone(), interval)?)
            }
        };
        Ok(RangeLockManager {
            inner,
            _detector: detector,
        })
    }

    #[inline]
    pub fn options(&self) -> &LockManagerOptions {
        &self.inner.options
    }

    /// Locks `range` of `resource` for `txn`, waiting up to `timeout` on
    /// conflict. A zero timeout fails right away with `LockNotGranted`.
    pub fn acquire(
        &self,
        txn: TransactionID,
        resource: ResourceID,
        range: &KeyRange,
        lock_type: RowLockType,
        timeout: Duration,
    ) -> Result<()> {
        self.inner.acquire(txn, resource, range, lock_type, timeout)
    }

    /// Locks the whole of `resource`, bypassing range by range acquisition.
    pub fn prelock_table(
        &self,
        txn: TransactionID,
        resource: ResourceID,
        lock_type: RowLockType,
        timeout: Duration,
    ) -> Result<()> {
        self.inner.prelock_table(txn, resource, lock_type, timeout)
    }

    pub fn release(&self, txn: TransactionID, resource: ResourceID, range: &KeyRange) {
        self.inner.release(txn, resource, range)
    }

    pub fn release_all(&self, txn: TransactionID) {
        self.inner.release_all(txn)
    }

    /// Runs one full deadlock scan and returns the number of aborted waiters.
    pub fn lock_detect(&self) -> usize {
        self.inner.detect(None)
    }

    pub fn set_lock_timeout_callback(
        &self,
        callback: impl Fn(&LockTimeoutInfo) + Send + Sync + 'static,
    ) {
        let callback: LockTimeoutCallback = Box::new(callback);
        self.inner.timeout_callback.store(Some(Arc::new(callback)));
    }

    pub fn clear_lock_timeout_callback(&self) {
        self.inner.timeout_callback.store(None);
    }

    pub fn stats(&self) -> LockManagerStats {
        let s = &self.inner.stats;
        LockManagerStats {
            granted: s.granted.load(Ordering::Relaxed),
            waits: s.waits.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
            deadlocks: s.deadlocks.load(Ordering::Relaxed),
            escalations: s.escalations.load(Ordering::Relaxed),
            escalations_deferred: s.escalations_deferred.load(Ordering::Relaxed),
        }
    }

    pub fn holders(&self, resource: ResourceID, range: &KeyRange) -> Vec<GrantedLock> {
        match self.inner.find_table(resource) {
            Some(table) => table.holders(range),
            None => vec![],
        }
    }

    pub fn granted_locks(&self, resource: ResourceID) -> Vec<GrantedLock> {
        self.holders(resource, &KeyRange::full())
    }

    pub fn pending_count(&self, resource: ResourceID) -> usize {
        self.inner
            .find_table(resource)
            .map_or(0, |table| table.pending_count())
    }

    /// Mode of the table lock `txn` was escalated to on `resource`, if any.
    pub fn escalated(&self, txn: TransactionID, resource: ResourceID) -> Option<RowLockType> {
        self.inner.escalated_mode(txn, resource)
    }

    /// Estimated bytes of range locks `txn` holds on `resource`.
    pub fn lock_memory(&self, txn: TransactionID, resource: ResourceID) -> usize {
        self.inner
            .txn_locks
            .get(&txn)
            .and_then(|locks| locks.tables.get(&resource).map(|fp| fp.memory))
            .unwrap_or(0)
    }
}

fn check_active(txn: &impl Transaction) -> Result<()> {
    match txn.state() {
        TransactionState::Active => Ok(()),
        state => Err(LockError::TransactionNotActive {
            txn: txn.txn_id(),
            state,
        }),
    }
}

impl LockManager for RangeLockManager {
    fn try_lock(
        &self,
        txn: &impl Transaction,
        resource: ResourceID,
        range: &KeyRange,
        lock_type: RowLockType,
    ) -> Result<()> {
        check_active(txn)?;
        self.acquire(
            txn.txn_id(),
            resource,
            range,
            lock_type,
            Duration::from_secs(0),
        )
    }

    fn lock(
        &self,
        txn: &impl Transaction,
        resource: ResourceID,
        range: &KeyRange,
        lock_type: RowLockType,
    ) -> Result<()> {
        check_active(txn)?;
        self.acquire(
            txn.txn_id(),
            resource,
            range,
            lock_type,
            self.inner.options.lock_timeout,
        )
    }

    fn lock_table(
        &self,
        txn: &impl Transaction,
        resource: ResourceID,
        lock_type: RowLockType,
    ) -> Result<()> {
        check_active(txn)?;
        self.prelock_table(
            txn.txn_id(),
            resource,
            lock_type,
            self.inner.options.lock_timeout,
        )
    }

    fn unlock(&self, txn: &impl Transaction, resource: ResourceID, range: &KeyRange) {
        self.release(txn.txn_id(), resource, range)
    }

    fn unlock_all(&self, txn: &impl Transaction) {
        self.release_all(txn.txn_id())
    }
}
