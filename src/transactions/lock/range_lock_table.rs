use crate::transactions::lock::key_range::{has_keys_between, Endpoint, KeyRange};
use crate::transactions::lock::row_lock::{LockRequest, RequestState};
use crate::transactions::lock::{ResourceID, RowLockType};
use crate::transactions::TransactionID;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

/// Granted part of the key space `[start, end)` where `start` is the key of
/// the segment in [`TableState::segments`].
///
/// A `Write` segment always has exactly one owner.
#[derive(Debug, Clone)]
struct Segment {
    end: Endpoint,
    mode: RowLockType,
    owners: BTreeSet<TransactionID>,
}

type Holding = (RowLockType, BTreeSet<TransactionID>);

/// Snapshot of one granted segment, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedLock {
    pub range: KeyRange,
    pub mode: RowLockType,
    pub owners: Vec<TransactionID>,
}

pub(crate) enum Acquire {
    Granted,
    /// Already covered by an equal or stronger lock of the same transaction.
    AlreadyHeld,
    Conflict {
        blocking: TransactionID,
        blocking_range: KeyRange,
    },
    Waiting(Arc<LockRequest>),
}

pub(crate) enum Expired {
    /// Someone completed the request before the waiter got the table mutex.
    AlreadyCompleted(RequestState),
    TimedOut(Option<(TransactionID, KeyRange)>),
}

#[derive(Default)]
pub(crate) struct TableState {
    segments: BTreeMap<Endpoint, Segment>,
    pending: VecDeque<Arc<LockRequest>>,
}

impl TableState {
    fn overlapping<'a>(
        &'a self,
        range: &KeyRange,
    ) -> impl Iterator<Item = (&'a Endpoint, &'a Segment)> + 'a {
        let head = self
            .segments
            .range(..range.start().clone())
            .next_back()
            .filter(|(_, seg)| seg.end > *range.start());
        head.into_iter().chain(
            self.segments
                .range(range.start().clone()..range.end().clone()),
        )
    }

    /// First owner other than `txn` whose granted lock conflicts with `ty`
    /// on `range`, together with the range of the blocking segment.
    fn blocker(
        &self,
        txn: TransactionID,
        range: &KeyRange,
        ty: RowLockType,
    ) -> Option<(TransactionID, KeyRange)> {
        for (start, seg) in self.overlapping(range) {
            if seg.mode == RowLockType::Write || ty == RowLockType::Write {
                if let Some(other) = seg.owners.iter().find(|o| **o != txn) {
                    return Some((
                        *other,
                        KeyRange::from_endpoints(start.clone(), seg.end.clone()),
                    ));
                }
            }
        }
        None
    }

    fn blockers(&self, txn: TransactionID, range: &KeyRange, ty: RowLockType) -> BTreeSet<TransactionID> {
        let mut out = BTreeSet::new();
        for (_, seg) in self.overlapping(range) {
            if seg.mode == RowLockType::Write || ty == RowLockType::Write {
                out.extend(seg.owners.iter().filter(|o| **o != txn));
            }
        }
        out
    }

    fn covers(&self, txn: TransactionID, range: &KeyRange, ty: RowLockType) -> bool {
        let mut cursor = range.start();
        for (start, seg) in self.overlapping(range) {
            if start > cursor || !seg.owners.contains(&txn) || seg.mode < ty {
                return false;
            }
            cursor = &seg.end;
        }
        cursor >= range.end()
    }

    /// Splits the segment spanning `at`. A side left without keys is dropped.
    fn split_at(&mut self, at: &Endpoint) {
        let (head, tail) = match self.segments.range_mut(..at.clone()).next_back() {
            Some((start, seg)) if seg.end > *at => {
                let end = std::mem::replace(&mut seg.end, at.clone());
                let tail = Segment {
                    end,
                    mode: seg.mode,
                    owners: seg.owners.clone(),
                };
                (start.clone(), tail)
            }
            _ => return,
        };
        if !has_keys_between(&head, at) {
            self.segments.remove(&head);
        }
        if has_keys_between(at, &tail.end) {
            self.segments.insert(at.clone(), tail);
        }
    }

    /// Replaces every piece of `range`, granted segments and the gaps between
    /// them, with what `f` returns for it. `None` stands for a gap both ways.
    fn rewrite<F>(&mut self, range: &KeyRange, mut f: F)
    where
        F: FnMut(Option<Holding>) -> Option<Holding>,
    {
        self.split_at(range.start());
        self.split_at(range.end());
        let mut window = self.segments.split_off(range.start());
        let mut after = window.split_off(range.end());
        self.segments.append(&mut after);

        let mut cursor = range.start().clone();
        let mut pieces = Vec::with_capacity(window.len() * 2 + 1);
        for (start, seg) in window {
            if cursor < start {
                pieces.push((cursor, start.clone(), None));
            }
            cursor = seg.end.clone();
            pieces.push((start, seg.end, Some((seg.mode, seg.owners))));
        }
        if cursor < *range.end() {
            pieces.push((cursor, range.end().clone(), None));
        }

        for (start, end, holding) in pieces {
            if let Some((mode, owners)) = f(holding) {
                if !owners.is_empty() && has_keys_between(&start, &end) {
                    self.segments.insert(start, Segment { end, mode, owners });
                }
            }
        }
        self.coalesce(range);
    }

    /// Merges segments with the same mode and owners in and around `range`
    /// when no key lies between them.
    fn coalesce(&mut self, range: &KeyRange) {
        let first = self
            .segments
            .range(..range.start().clone())
            .next_back()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| range.start().clone());
        let mut keys: Vec<Endpoint> = self
            .segments
            .range(first..=range.end().clone())
            .map(|(k, _)| k.clone())
            .collect();
        // A neighbour may start past the end of `range` with no key between.
        if let Some((k, _)) = self
            .segments
            .range((Bound::Excluded(range.end().clone()), Bound::Unbounded))
            .next()
        {
            keys.push(k.clone());
        }

        let mut keys = keys.into_iter();
        let mut prev = match keys.next() {
            Some(k) => k,
            None => return,
        };
        for key in keys {
            let mergeable = match (self.segments.get(&prev), self.segments.get(&key)) {
                (Some(a), Some(b)) => {
                    !has_keys_between(&a.end, &key) && a.mode == b.mode && a.owners == b.owners
                }
                _ => false,
            };
            if !mergeable {
                prev = key;
                continue;
            }
            if let Some(b) = self.segments.remove(&key) {
                if let Some(a) = self.segments.get_mut(&prev) {
                    a.end = b.end;
                }
            }
        }
    }

    fn grant(&mut self, txn: TransactionID, range: &KeyRange, ty: RowLockType) {
        self.rewrite(range, |holding| match holding {
            None => Some((ty, std::iter::once(txn).collect())),
            Some((mode, mut owners)) => {
                owners.insert(txn);
                Some((std::cmp::max(mode, ty), owners))
            }
        });
    }

    fn remove_owner(&mut self, txn: TransactionID, range: &KeyRange) {
        self.rewrite(range, |holding| {
            holding.map(|(mode, mut owners)| {
                owners.remove(&txn);
                (mode, owners)
            })
        });
    }

    /// Grants queued requests that no longer conflict, in arrival order.
    fn retry_pending(&mut self) -> usize {
        let mut granted = 0;
        let mut i = 0;
        while i < self.pending.len() {
            let request = self.pending[i].clone();
            if self.blocker(request.txn, &request.range, request.ty).is_some() {
                i += 1;
                continue;
            }
            self.pending.remove(i);
            if request.complete(RequestState::Granted) {
                self.grant(request.txn, &request.range, request.ty);
                granted += 1;
            }
        }
        granted
    }

    fn remove_pending(&mut self, request: &Arc<LockRequest>) {
        self.pending.retain(|r| !Arc::ptr_eq(r, request));
    }

    /// Completes a pending request with `state` and drops it from the queue.
    pub(crate) fn cancel(&mut self, request: &Arc<LockRequest>, state: RequestState) -> bool {
        let completed = request.complete(state);
        self.remove_pending(request);
        completed
    }

    /// Every queued request with the transactions currently blocking it.
    pub(crate) fn waits(&self) -> Vec<(Arc<LockRequest>, BTreeSet<TransactionID>)> {
        self.pending
            .iter()
            .map(|r| (r.clone(), self.blockers(r.txn, &r.range, r.ty)))
            .collect()
    }
}

/// Granted range locks and the queue of waiting requests on one resource.
pub struct RangeLockTable {
    resource: ResourceID,
    state: Mutex<TableState>,
}

impl RangeLockTable {
    pub fn new(resource: ResourceID) -> RangeLockTable {
        RangeLockTable {
            resource,
            state: Mutex::new(TableState::default()),
        }
    }

    #[inline]
    pub fn resource(&self) -> ResourceID {
        self.resource
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap()
    }

    /// Grants `range` to `txn` if no other transaction holds a conflicting
    /// lock on it. On conflict the request is queued when `wait` is set.
    pub(crate) fn acquire(
        &self,
        txn: TransactionID,
        range: &KeyRange,
        ty: RowLockType,
        wait: bool,
    ) -> Acquire {
        let mut state = self.lock_state();
        if state.covers(txn, range, ty) {
            return Acquire::AlreadyHeld;
        }
        match state.blocker(txn, range, ty) {
            None => {
                state.grant(txn, range, ty);
                Acquire::Granted
            }
            Some(_) if wait => {
                let request = Arc::new(LockRequest::new(txn, self.resource, range.clone(), ty));
                state.pending.push_back(request.clone());
                Acquire::Waiting(request)
            }
            Some((blocking, blocking_range)) => Acquire::Conflict {
                blocking,
                blocking_range,
            },
        }
    }

    /// Takes a waiter whose deadline passed out of the queue.
    pub(crate) fn expire(&self, request: &Arc<LockRequest>) -> Expired {
        let mut state = self.lock_state();
        if !request.complete(RequestState::TimedOut) {
            return Expired::AlreadyCompleted(request.state());
        }
        state.remove_pending(request);
        Expired::TimedOut(state.blocker(request.txn, &request.range, request.ty))
    }

    /// Drops the locks of `txn` inside `range` and wakes waiters that are no
    /// longer blocked. Returns the number of waiters granted.
    pub fn release(&self, txn: TransactionID, range: &KeyRange) -> usize {
        let mut state = self.lock_state();
        state.remove_owner(txn, range);
        state.retry_pending()
    }

    /// Drops every lock of `txn` and cancels its queued requests.
    pub fn release_all(&self, txn: TransactionID) -> usize {
        let mut state = self.lock_state();
        let queued: Vec<_> = state
            .pending
            .iter()
            .filter(|r| r.txn == txn)
            .cloned()
            .collect();
        for request in queued.iter() {
            state.cancel(request, RequestState::Cancelled);
        }
        state.remove_owner(txn, &KeyRange::full());
        state.retry_pending()
    }

    /// Replaces the locks of `txn` with one lock over the whole key space, if
    /// no other transaction would conflict with it.
    pub(crate) fn try_escalate(&self, txn: TransactionID, ty: RowLockType) -> bool {
        let full = KeyRange::full();
        let mut state = self.lock_state();
        if state.blocker(txn, &full, ty).is_some() {
            return false;
        }
        state.grant(txn, &full, ty);
        true
    }

    pub fn holders(&self, range: &KeyRange) -> Vec<GrantedLock> {
        let state = self.lock_state();
        state
            .overlapping(range)
            .map(|(start, seg)| GrantedLock {
                range: KeyRange::from_endpoints(start.clone(), seg.end.clone()),
                mode: seg.mode,
                owners: seg.owners.iter().copied().collect(),
            })
            .collect()
    }

    /// The parts of the key space `txn` holds a lock on.
    pub(crate) fn owned_ranges(&self, txn: TransactionID) -> Vec<KeyRange> {
        let state = self.lock_state();
        state
            .segments
            .iter()
            .filter(|(_, seg)| seg.owners.contains(&txn))
            .map(|(start, seg)| KeyRange::from_endpoints(start.clone(), seg.end.clone()))
            .collect()
    }

    pub fn granted_locks(&self) -> Vec<GrantedLock> {
        self.holders(&KeyRange::full())
    }

    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }
}
