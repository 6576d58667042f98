use crate::mdl::context::{ContextShared, MdlContext};
use crate::mdl::key::MdlKey;
use crate::mdl::lock::{MdlLock, Queue};
use crate::mdl::lock_type::MdlType;
use crate::mdl::owner::MdlContextOwner;
use crate::mdl::ticket::MdlTicket;
use crate::options::MdlOptions;
use crate::sync::PartitionedRwLock;
use arc_swap::{ArcSwap, ArcSwapOption};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// All [`MdlLock`]s that currently have tickets, by key.
pub struct MdlMap {
    locks: PartitionedRwLock<HashMap<MdlKey, Arc<MdlLock>>>,
}

impl MdlMap {
    pub fn new(partitions: usize) -> MdlMap {
        MdlMap {
            locks: PartitionedRwLock::new(partitions, HashMap::new()),
        }
    }

    pub fn find(&self, key: &MdlKey) -> Option<Arc<MdlLock>> {
        self.locks.read().get(key).cloned()
    }

    pub fn find_or_insert(&self, key: &MdlKey) -> Arc<MdlLock> {
        if let Some(lock) = self.find(key) {
            return lock;
        }
        let mut locks = self.locks.write();
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MdlLock::new(key.clone())))
            .clone()
    }

    /// Drops `lock` from the map if it has no tickets left. Threads that
    /// looked it up before see it destroyed and look again.
    pub fn remove(&self, lock: &Arc<MdlLock>) {
        let mut locks = self.locks.write();
        let mut queues = lock.queues.write();
        if !queues.is_empty() || queues.is_destroyed {
            return;
        }
        let current = match locks.get(lock.key()) {
            Some(current) => Arc::ptr_eq(current, lock),
            None => false,
        };
        if current {
            queues.is_destroyed = true;
            locks.remove(lock.key());
        }
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Passed to the timeout callback when a metadata lock wait expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdlTimeoutInfo {
    pub context_id: u64,
    pub key: MdlKey,
    pub ty: MdlType,
    pub blocking_contexts: Vec<u64>,
}

pub type MdlTimeoutCallback = Box<dyn Fn(&MdlTimeoutInfo) + Send + Sync>;

/// State of one lock, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdlLockInfo {
    pub granted: Vec<(u64, MdlType)>,
    pub waiting: Vec<(u64, MdlType)>,
    pub hog_lock_count: u64,
}

pub(crate) struct MdlServiceInner {
    pub(crate) map: MdlMap,
    options: ArcSwap<MdlOptions>,
    next_context_id: AtomicU64,
    timeout_callback: ArcSwapOption<MdlTimeoutCallback>,
}

impl MdlServiceInner {
    #[inline]
    pub(crate) fn max_write_lock_count(&self) -> u64 {
        self.options.load().max_write_lock_count
    }

    #[inline]
    pub(crate) fn options(&self) -> Arc<MdlOptions> {
        self.options.load_full()
    }

    /// Takes `ticket` out of `queue` of its lock, then either reschedules
    /// the remaining waiters or drops the lock when it became empty.
    pub(crate) fn remove_ticket(&self, queue: Queue, ticket: &Arc<MdlTicket>) {
        let lock = &ticket.lock;
        {
            let mut queues = lock.queues.write();
            match queue {
                Queue::Granted => queues.granted.remove(ticket),
                Queue::Waiting => queues.waiting.remove(ticket),
            };
            if !queues.is_empty() {
                lock.reschedule_waiters(&mut queues, self.max_write_lock_count());
                return;
            }
        }
        self.map.remove(lock);
    }

    pub(crate) fn on_timeout(&self, ctx: &ContextShared, key: &MdlKey, ty: MdlType, blocking: Vec<u64>) {
        warn!(
            "context {} timed out waiting for {:?} lock on {}, blocked by {:?}",
            ctx.id(),
            ty,
            key,
            blocking
        );
        if let Some(callback) = self.timeout_callback.load_full() {
            let info = MdlTimeoutInfo {
                context_id: ctx.id(),
                key: key.clone(),
                ty,
                blocking_contexts: blocking,
            };
            (*callback)(&info);
        }
    }
}

/// Owns the metadata lock map and hands out one [`MdlContext`] per session.
///
/// Create it once at startup; dropping it is the shutdown. Contexts keep the
/// map alive until they are gone.
pub struct MdlService {
    inner: Arc<MdlServiceInner>,
}

impl MdlService {
    pub fn new(options: MdlOptions) -> MdlService {
        let map = MdlMap::new(options.registry_partitions);
        MdlService {
            inner: Arc::new(MdlServiceInner {
                map,
                options: ArcSwap::from_pointee(options),
                next_context_id: AtomicU64::new(1),
                timeout_callback: ArcSwapOption::empty(),
            }),
        }
    }

    pub fn create_context(&self, owner: Arc<dyn MdlContextOwner>) -> MdlContext {
        let id = self.inner.next_context_id.fetch_add(1, Ordering::Relaxed);
        MdlContext::new(id, owner, self.inner.clone())
    }

    pub fn options(&self) -> Arc<MdlOptions> {
        self.inner.options()
    }

    /// Takes effect for the next reschedule of every lock.
    pub fn set_max_write_lock_count(&self, max_write_lock_count: u64) {
        let mut options = (*self.inner.options()).clone();
        options.max_write_lock_count = max_write_lock_count;
        self.inner.options.store(Arc::new(options));
    }

    pub fn set_lock_wait_timeout(&self, timeout: std::time::Duration) {
        let mut options = (*self.inner.options()).clone();
        options.lock_wait_timeout = timeout;
        self.inner.options.store(Arc::new(options));
    }

    pub fn set_lock_timeout_callback(
        &self,
        callback: impl Fn(&MdlTimeoutInfo) + Send + Sync + 'static,
    ) {
        let callback: MdlTimeoutCallback = Box::new(callback);
        self.inner.timeout_callback.store(Some(Arc::new(callback)));
    }

    /// Number of locks with granted or pending tickets.
    pub fn lock_count(&self) -> usize {
        self.inner.map.len()
    }

    pub fn lock_info(&self, key: &MdlKey) -> Option<MdlLockInfo> {
        let lock = self.inner.map.find(key)?;
        let queues = lock.queues.read();
        Some(MdlLockInfo {
            granted: queues
                .granted
                .iter()
                .map(|t| (t.context_id(), t.ty()))
                .collect(),
            waiting: queues
                .waiting
                .iter()
                .map(|t| (t.context_id(), t.ty()))
                .collect(),
            hog_lock_count: queues.hog_lock_count,
        })
    }
}

impl Drop for MdlService {
    fn drop(&mut self) {
        let remaining = self.inner.map.len();
        if remaining > 0 {
            warn!("metadata lock service shut down with {} locks held", remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MdlMap;
    use crate::mdl::key::MdlKey;
    use std::sync::Arc;

    #[test]
    fn test_find_or_insert_and_remove() {
        let map = MdlMap::new(4);
        let key = MdlKey::table("db", "t1");
        let lock = map.find_or_insert(&key);
        assert!(Arc::ptr_eq(&lock, &map.find_or_insert(&key)));
        assert_eq!(map.len(), 1);

        map.remove(&lock);
        assert!(map.is_empty());
        assert!(lock.queues.read().is_destroyed);

        let again = map.find_or_insert(&key);
        assert!(!Arc::ptr_eq(&lock, &again));
        // A stale lock never removes its replacement.
        map.remove(&lock);
        assert_eq!(map.len(), 1);
    }
}
