use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: usize = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small sequential id of the calling thread, used to pick a read partition.
pub fn current_thread_id() -> usize {
    THREAD_ID.with(|id| *id)
}

/// Reader/writer lock split into partitions.
///
/// A reader locks only the partition selected by its thread id, so readers on
/// different partitions never touch the same cache line. A writer locks every
/// partition in index order, which excludes all readers and keeps two writers
/// from deadlocking on each other.
pub struct PartitionedRwLock<T> {
    partitions: Box<[RwLock<()>]>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for PartitionedRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for PartitionedRwLock<T> {}

impl<T> PartitionedRwLock<T> {
    pub fn new(partitions: usize, data: T) -> PartitionedRwLock<T> {
        let partitions = partitions.max(1);
        PartitionedRwLock {
            partitions: (0..partitions).map(|_| RwLock::new(())).collect(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> PartitionReadGuard<'_, T> {
        self.read_for(current_thread_id())
    }

    /// Read lock on the partition `thread_id % partitions`. Threads whose ids
    /// collide share a partition.
    pub fn read_for(&self, thread_id: usize) -> PartitionReadGuard<'_, T> {
        let idx = thread_id % self.partitions.len();
        let guard = self.partitions[idx].read().unwrap();
        PartitionReadGuard {
            _guard: guard,
            data: unsafe { &*self.data.get() },
        }
    }

    pub fn write(&self) -> PartitionWriteGuard<'_, T> {
        let guards = self
            .partitions
            .iter()
            .map(|p| p.write().unwrap())
            .collect();
        PartitionWriteGuard {
            _guards: guards,
            data: unsafe { &mut *self.data.get() },
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for PartitionedRwLock<T> {
    fn default() -> Self {
        PartitionedRwLock::new(crate::options::DEFAULT_REGISTRY_PARTITIONS, T::default())
    }
}

pub struct PartitionReadGuard<'a, T> {
    _guard: RwLockReadGuard<'a, ()>,
    data: &'a T,
}

impl<T> Deref for PartitionReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
    }
}

pub struct PartitionWriteGuard<'a, T> {
    _guards: Vec<RwLockWriteGuard<'a, ()>>,
    data: &'a mut T,
}

impl<T> Deref for PartitionWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
    }
}

impl<T> DerefMut for PartitionWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}
