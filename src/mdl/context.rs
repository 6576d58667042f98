use crate::error::LockError;
use crate::mdl::deadlock::DeadlockVisitor;
use crate::mdl::key::{MdlKey, MdlNamespace};
use crate::mdl::lock::Queue;
use crate::mdl::lock_type::MdlType;
use crate::mdl::map::MdlServiceInner;
use crate::mdl::owner::MdlContextOwner;
use crate::mdl::ticket::{MdlDuration, MdlRequest, MdlTicket, ALL_DURATIONS, MDL_DURATION_COUNT};
use crate::mdl::wait::{MdlWait, WaitStatus};
use crate::sync::deadline_after;
use crate::Result;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Between two waits of this length a blocked request notifies the holders
/// of conflicting locks again.
const SHORT_WAIT: Duration = Duration::from_secs(1);

/// The part of a context other threads look at: its wait slot, the ticket it
/// waits with and its owner.
pub struct ContextShared {
    id: u64,
    pub(crate) owner: Arc<dyn MdlContextOwner>,
    pub(crate) wait: MdlWait,
    waiting_for: RwLock<Option<Arc<MdlTicket>>>,
    needs_thr_lock_abort: AtomicBool,
}

impl ContextShared {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn needs_thr_lock_abort(&self) -> bool {
        self.needs_thr_lock_abort.load(Ordering::Acquire)
    }

    pub(crate) fn visit_subgraph(&self, visitor: &mut DeadlockVisitor) -> bool {
        let waiting_for = self.waiting_for.read_recursive();
        match &*waiting_for {
            Some(ticket) => ticket.lock.visit_subgraph(ticket, visitor),
            None => false,
        }
    }
}

/// Position in the acquisition order of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdlSavepoint {
    seq: u64,
}

enum TryAcquire {
    Granted,
    NotGranted,
    /// Queued as waiting, with the holders to notify before blocking.
    Waiting(Arc<MdlTicket>, Vec<(Arc<dyn MdlContextOwner>, bool)>),
}

/// Metadata locks of one session.
///
/// A context is used by one thread at a time. It must release every ticket
/// before it is dropped.
pub struct MdlContext {
    shared: Arc<ContextShared>,
    service: Arc<MdlServiceInner>,
    tickets: [Vec<Arc<MdlTicket>>; MDL_DURATION_COUNT],
    next_seq: u64,
}

impl MdlContext {
    pub(crate) fn new(
        id: u64,
        owner: Arc<dyn MdlContextOwner>,
        service: Arc<MdlServiceInner>,
    ) -> MdlContext {
        MdlContext {
            shared: Arc::new(ContextShared {
                id,
                owner,
                wait: MdlWait::default(),
                waiting_for: RwLock::new(None),
                needs_thr_lock_abort: AtomicBool::new(false),
            }),
            service,
            tickets: [vec![], vec![], vec![]],
            next_seq: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn owner(&self) -> &Arc<dyn MdlContextOwner> {
        &self.shared.owner
    }

    /// Marks that this session holds table level locks that other sessions
    /// must ask it to abort.
    pub fn set_needs_thr_lock_abort(&self, needs_thr_lock_abort: bool) {
        self.shared
            .needs_thr_lock_abort
            .store(needs_thr_lock_abort, Ordering::Release);
    }

    pub fn needs_thr_lock_abort(&self) -> bool {
        self.shared.needs_thr_lock_abort()
    }

    /// The `lock_wait_timeout` currently configured for the service.
    pub fn lock_wait_timeout(&self) -> Duration {
        self.service.options().lock_wait_timeout
    }

    pub fn tickets(&self, duration: MdlDuration) -> &[Arc<MdlTicket>] {
        &self.tickets[duration as usize]
    }

    fn find_ticket(
        &self,
        key: &MdlKey,
        ty: MdlType,
        duration: MdlDuration,
    ) -> Option<(Arc<MdlTicket>, MdlDuration)> {
        for i in 0..MDL_DURATION_COUNT {
            let d = ALL_DURATIONS[(duration as usize + i) % MDL_DURATION_COUNT];
            let found = self.tickets[d as usize]
                .iter()
                .rev()
                .find(|t| t.key() == key && t.has_stronger_or_equal_type(ty));
            if let Some(ticket) = found {
                return Some((ticket.clone(), d));
            }
        }
        None
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// A new granted ticket of `ty` on the lock of `found`, which this context
    /// already holds in a stronger or equal type.
    fn clone_ticket(
        &mut self,
        found: &Arc<MdlTicket>,
        ty: MdlType,
        duration: MdlDuration,
    ) -> Arc<MdlTicket> {
        let lock = found.lock.clone();
        let seq = self.next_seq();
        let ticket = Arc::new(MdlTicket::new(
            self.shared.clone(),
            lock.clone(),
            ty,
            duration,
            seq,
        ));
        lock.queues.write().granted.add(ticket.clone());
        self.tickets[duration as usize].push(ticket.clone());
        ticket
    }

    fn try_acquire_lock_impl(&mut self, request: &mut MdlRequest, enqueue: bool) -> TryAcquire {
        if let Some((ticket, found)) = self.find_ticket(&request.key, request.ty, request.duration)
        {
            // Separate tickets keep durations independent of each other.
            let ticket = if found != request.duration || request.duration == MdlDuration::Explicit
            {
                self.clone_ticket(&ticket, request.ty, request.duration)
            } else {
                ticket
            };
            request.ticket = Some(ticket);
            return TryAcquire::Granted;
        }

        loop {
            let lock = self.service.map.find_or_insert(&request.key);
            let mut queues = lock.queues.write();
            if queues.is_destroyed {
                continue;
            }
            let ticket = Arc::new(MdlTicket::new(
                self.shared.clone(),
                lock.clone(),
                request.ty,
                request.duration,
                self.next_seq,
            ));

            if lock.can_grant_lock(&queues, request.ty, self.shared.id, false) {
                queues.granted.add(ticket.clone());
                drop(queues);
                self.next_seq += 1;
                self.tickets[request.duration as usize].push(ticket.clone());
                request.ticket = Some(ticket);
                return TryAcquire::Granted;
            }
            if !enqueue {
                return TryAcquire::NotGranted;
            }

            queues.waiting.add(ticket.clone());
            // The slot must be empty before anyone can grant the ticket.
            self.shared.wait.reset_status();
            self.next_seq += 1;
            let notify = if lock.strategy().needs_notification(request.ty) {
                lock.conflicting_owners(&queues, self.shared.id)
            } else {
                vec![]
            };
            return TryAcquire::Waiting(ticket, notify);
        }
    }

    /// Acquires `request` if that is possible without waiting. Returns whether
    /// it was granted.
    pub fn try_acquire_lock(&mut self, request: &mut MdlRequest) -> bool {
        matches!(
            self.try_acquire_lock_impl(request, false),
            TryAcquire::Granted
        )
    }

    fn notify_holders(&self, holders: &[(Arc<dyn MdlContextOwner>, bool)]) {
        for (holder, needs_thr_lock_abort) in holders {
            self.shared
                .owner
                .notify_shared_lock(holder.as_ref(), *needs_thr_lock_abort);
        }
    }

    fn will_wait_for(&self, ticket: &Arc<MdlTicket>) {
        *self.shared.waiting_for.write() = Some(ticket.clone());
    }

    fn done_waiting_for(&self) {
        *self.shared.waiting_for.write() = None;
    }

    /// Breaks every deadlock the current wait of this context is part of.
    fn find_deadlock(&self) {
        loop {
            let mut visitor = DeadlockVisitor::new(&self.shared);
            if !self.shared.visit_subgraph(&mut visitor) {
                break;
            }
            let victim = match visitor.into_victim() {
                Some(victim) => victim,
                None => break,
            };
            victim
                .ctx
                .wait
                .set_status_for(victim.generation, WaitStatus::Victim);
            debug!(
                "metadata lock deadlock found by context {}, victim context {}",
                self.shared.id,
                victim.ctx.id()
            );
            if victim.ctx.id() == self.shared.id {
                break;
            }
        }
    }

    fn timeout_error(&self, key: &MdlKey, ty: MdlType, blocking: Vec<u64>) -> LockError {
        self.service.on_timeout(&self.shared, key, ty, blocking);
        LockError::MdlLockWaitTimeout(key.clone())
    }

    /// Acquires `request`, waiting up to `timeout`. A zero timeout fails with
    /// `MdlLockWaitTimeout` right away if the lock is not free.
    pub fn acquire_lock(&mut self, request: &mut MdlRequest, timeout: Duration) -> Result<()> {
        let wait = timeout > Duration::from_secs(0);
        let (ticket, holders) = match self.try_acquire_lock_impl(request, wait) {
            TryAcquire::Granted => return Ok(()),
            TryAcquire::NotGranted => {
                let blocking = match self.service.map.find(&request.key) {
                    Some(lock) => lock.blocking_contexts(request.ty, self.shared.id),
                    None => vec![],
                };
                return Err(self.timeout_error(&request.key, request.ty, blocking));
            }
            TryAcquire::Waiting(ticket, holders) => (ticket, holders),
        };
        self.notify_holders(&holders);

        let lock = ticket.lock.clone();
        let needs_notification = lock.strategy().needs_notification(request.ty);
        let stage = request.key.namespace().wait_state_name();
        let owner = self.shared.owner.clone();

        self.will_wait_for(&ticket);
        self.find_deadlock();

        let deadline = deadline_after(timeout);
        let mut status = WaitStatus::Empty;
        loop {
            let short = match deadline_after(SHORT_WAIT) {
                Some(short) => short,
                None => break,
            };
            if let Some(deadline) = deadline {
                if short > deadline {
                    break;
                }
            }
            status = self
                .shared
                .wait
                .timed_wait(owner.as_ref(), Some(short), false, stage);
            if status != WaitStatus::Empty {
                break;
            }
            if needs_notification {
                let holders = {
                    let queues = lock.queues.read();
                    lock.conflicting_owners(&queues, self.shared.id)
                };
                self.notify_holders(&holders);
            }
        }
        if status == WaitStatus::Empty {
            status = self
                .shared
                .wait
                .timed_wait(owner.as_ref(), deadline, true, stage);
        }
        self.done_waiting_for();

        if status == WaitStatus::Granted {
            self.tickets[request.duration as usize].push(ticket.clone());
            request.ticket = Some(ticket);
            return Ok(());
        }

        let blocking = lock.blocking_contexts(request.ty, self.shared.id);
        self.service.remove_ticket(Queue::Waiting, &ticket);
        match status {
            WaitStatus::Victim => {
                debug!(
                    "context {} aborted as deadlock victim on {}",
                    self.shared.id, request.key
                );
                Err(LockError::MdlDeadlock(request.key.clone()))
            }
            WaitStatus::Killed => Err(LockError::Killed),
            _ => Err(self.timeout_error(&request.key, request.ty, blocking)),
        }
    }

    /// Acquires all `requests` in key order. On failure none of the locks
    /// acquired here stay held and every request's ticket is reset.
    pub fn acquire_locks(&mut self, requests: &mut [MdlRequest], timeout: Duration) -> Result<()> {
        let savepoint = self.mdl_savepoint();
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by(|&a, &b| requests[a].key.cmp(&requests[b].key));

        for &i in order.iter() {
            if let Err(e) = self.acquire_lock(&mut requests[i], timeout) {
                self.rollback_to_savepoint(&savepoint);
                self.release_locks_after(MdlDuration::Explicit, savepoint.seq);
                for request in requests.iter_mut() {
                    request.ticket = None;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn assert_owned(&self, ticket: &MdlTicket) {
        assert_eq!(
            ticket.context_id(),
            self.shared.id,
            "ticket {:?} is not owned by context {}",
            ticket,
            self.shared.id
        );
    }

    /// Upgrades a shared upgradable or no-write ticket in place.
    ///
    /// Does nothing if the ticket is already at least `new_type`. Panics if
    /// the ticket is of a type that can not be upgraded.
    pub fn upgrade_shared_lock(
        &mut self,
        ticket: &Arc<MdlTicket>,
        new_type: MdlType,
        timeout: Duration,
    ) -> Result<()> {
        self.assert_owned(ticket);
        if ticket.has_stronger_or_equal_type(new_type) {
            return Ok(());
        }
        assert!(
            ticket.ty().is_upgradable(),
            "can not upgrade a {:?} lock",
            ticket.ty()
        );

        let savepoint = self.mdl_savepoint();
        let mut request = MdlRequest::new(ticket.key().clone(), new_type, MdlDuration::Transaction);
        self.acquire_lock(&mut request, timeout)?;
        let acquired = match request.ticket {
            Some(acquired) => acquired,
            None => return Ok(()),
        };
        let is_new = !self.has_lock(&savepoint, &acquired);

        {
            let mut queues = ticket.lock.queues.write();
            if is_new {
                queues.granted.remove(&acquired);
            }
            queues.granted.remove(ticket);
            ticket.set_type(new_type);
            queues.granted.add(ticket.clone());
        }
        if is_new {
            self.tickets[MdlDuration::Transaction as usize].retain(|t| !Arc::ptr_eq(t, &acquired));
        }
        Ok(())
    }

    /// Weakens an exclusive or no-write ticket to `new_type` and lets waiters
    /// that became compatible through.
    pub fn downgrade_lock(&mut self, ticket: &Arc<MdlTicket>, new_type: MdlType) {
        self.assert_owned(ticket);
        let current = ticket.ty();
        if current == new_type || !ticket.has_stronger_or_equal_type(new_type) {
            return;
        }
        assert!(
            matches!(
                current,
                MdlType::Exclusive | MdlType::SharedNoWrite | MdlType::SharedNoReadWrite
            ),
            "can not downgrade a {:?} lock",
            current
        );
        let lock = &ticket.lock;
        let mut queues = lock.queues.write();
        queues.granted.remove(ticket);
        ticket.set_type(new_type);
        queues.granted.add(ticket.clone());
        lock.reschedule_waiters(&mut queues, self.service.max_write_lock_count());
    }

    pub fn release_lock(&mut self, ticket: &Arc<MdlTicket>) {
        self.assert_owned(ticket);
        for list in self.tickets.iter_mut() {
            list.retain(|t| !Arc::ptr_eq(t, ticket));
        }
        self.service.remove_ticket(Queue::Granted, ticket);
    }

    /// Releases every explicit ticket on the same lock as `ticket`.
    pub fn release_all_locks_for_name(&mut self, ticket: &Arc<MdlTicket>) {
        let matching: Vec<Arc<MdlTicket>> = self.tickets[MdlDuration::Explicit as usize]
            .iter()
            .filter(|t| Arc::ptr_eq(&t.lock, &ticket.lock))
            .cloned()
            .collect();
        for t in matching.iter() {
            self.release_lock(t);
        }
    }

    fn release_locks_after(&mut self, duration: MdlDuration, seq: u64) {
        let released: Vec<Arc<MdlTicket>> = self.tickets[duration as usize]
            .iter()
            .filter(|t| t.seq >= seq)
            .cloned()
            .collect();
        for ticket in released.iter().rev() {
            self.release_lock(ticket);
        }
    }

    pub fn release_statement_locks(&mut self) {
        self.release_locks_after(MdlDuration::Statement, 0);
    }

    pub fn release_transactional_locks(&mut self) {
        self.release_locks_after(MdlDuration::Statement, 0);
        self.release_locks_after(MdlDuration::Transaction, 0);
    }

    pub fn mdl_savepoint(&self) -> MdlSavepoint {
        MdlSavepoint {
            seq: self.next_seq,
        }
    }

    /// Releases statement and transactional tickets acquired after
    /// `savepoint`. Explicit tickets are kept.
    pub fn rollback_to_savepoint(&mut self, savepoint: &MdlSavepoint) {
        self.release_locks_after(MdlDuration::Statement, savepoint.seq);
        self.release_locks_after(MdlDuration::Transaction, savepoint.seq);
    }

    /// Whether `ticket` was already held when `savepoint` was taken, that is
    /// whether rolling back to it keeps the ticket.
    pub fn has_lock(&self, savepoint: &MdlSavepoint, ticket: &Arc<MdlTicket>) -> bool {
        let rolled_back = self.tickets[MdlDuration::Statement as usize]
            .iter()
            .chain(self.tickets[MdlDuration::Transaction as usize].iter())
            .any(|t| Arc::ptr_eq(t, ticket) && t.seq >= savepoint.seq);
        !rolled_back
    }

    pub fn set_lock_duration(&mut self, ticket: &Arc<MdlTicket>, duration: MdlDuration) {
        self.assert_owned(ticket);
        for list in self.tickets.iter_mut() {
            list.retain(|t| !Arc::ptr_eq(t, ticket));
        }
        ticket.set_duration(duration);
        self.tickets[duration as usize].push(ticket.clone());
    }

    /// Gives every ticket explicit duration, e.g. for LOCK TABLES.
    pub fn set_explicit_duration_for_all_locks(&mut self) {
        self.move_all_to(MdlDuration::Explicit);
    }

    /// Gives every ticket transactional duration, e.g. for UNLOCK TABLES.
    pub fn set_transaction_duration_for_all_locks(&mut self) {
        debug_assert!(self.tickets[MdlDuration::Statement as usize].is_empty());
        self.move_all_to(MdlDuration::Transaction);
    }

    fn move_all_to(&mut self, duration: MdlDuration) {
        let mut all: Vec<Arc<MdlTicket>> = vec![];
        for list in self.tickets.iter_mut() {
            all.append(list);
        }
        all.sort_by_key(|t| t.seq);
        for ticket in all.iter() {
            ticket.set_duration(duration);
        }
        self.tickets[duration as usize] = all;
    }

    /// Whether this context holds a lock on the object at least as strong as
    /// `ty`.
    pub fn is_lock_owner(
        &self,
        namespace: MdlNamespace,
        db_name: &str,
        name: &str,
        ty: MdlType,
    ) -> bool {
        let key = MdlKey::new(namespace, db_name, name);
        self.find_ticket(&key, ty, MdlDuration::Transaction).is_some()
    }

    pub fn has_locks(&self) -> bool {
        self.tickets.iter().any(|l| !l.is_empty())
    }

    pub fn has_locks_for(&self, duration: MdlDuration) -> bool {
        !self.tickets[duration as usize].is_empty()
    }
}

impl Drop for MdlContext {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                !self.has_locks(),
                "metadata lock context {} dropped while holding locks",
                self.shared.id
            );
        }
    }
}
