use crate::mdl::context::ContextShared;
use crate::mdl::deadlock::{DeadlockNode, DeadlockVisitor};
use crate::mdl::key::MdlKey;
use crate::mdl::lock_type::{LockStrategy, MdlType};
use crate::mdl::owner::MdlContextOwner;
use crate::mdl::ticket::{MdlTicket, TicketList};
use crate::mdl::wait::WaitStatus;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Default)]
pub struct LockQueues {
    pub granted: TicketList,
    pub waiting: TicketList,
    /// Number of high priority grants in a row made while low priority
    /// requests were pending.
    pub hog_lock_count: u64,
    /// Set once the lock is removed from the lock map. Acquirers that still
    /// found it must look it up again.
    pub is_destroyed: bool,
}

impl LockQueues {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }
}

/// Which queue of a lock a ticket is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Granted,
    Waiting,
}

/// The granted and waiting tickets for one [`MdlKey`].
pub struct MdlLock {
    key: MdlKey,
    strategy: LockStrategy,
    pub(crate) queues: RwLock<LockQueues>,
}

impl MdlLock {
    pub fn new(key: MdlKey) -> MdlLock {
        let strategy = LockStrategy::for_namespace(key.namespace());
        MdlLock {
            key,
            strategy,
            queues: RwLock::new(LockQueues::default()),
        }
    }

    #[inline]
    pub fn key(&self) -> &MdlKey {
        &self.key
    }

    #[inline]
    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    /// Whether a request of `ty` from context `requester` can be granted.
    ///
    /// Granted tickets of the requester never block it. Unless
    /// `ignore_priority` is set, pending tickets of a type that takes
    /// precedence block it too.
    pub(crate) fn can_grant_lock(
        &self,
        queues: &LockQueues,
        ty: MdlType,
        requester: u64,
        ignore_priority: bool,
    ) -> bool {
        let granted_incompatible = self.strategy.granted_incompatible(ty);
        if !ignore_priority
            && queues.waiting.bitmap() & self.strategy.waiting_incompatible(ty) != 0
        {
            return false;
        }
        if queues.granted.bitmap() & granted_incompatible == 0 {
            return true;
        }
        queues
            .granted
            .iter()
            .all(|t| t.ctx.id() == requester || !t.is_incompatible_when_granted(ty))
    }

    /// Grants every pending ticket that became grantable, oldest first.
    ///
    /// High priority types go first until `max_write_lock_count` of them were
    /// granted in a row while low priority requests waited. Then one pass
    /// skips them and lets the low priority requests through.
    pub(crate) fn reschedule_waiters(&self, queues: &mut LockQueues, max_write_lock_count: u64) {
        let hog_types = self.strategy.hog_lock_types();
        let max_write_lock_count = max_write_lock_count.max(1);
        let skip_high_priority = queues.hog_lock_count >= max_write_lock_count
            && queues.waiting.bitmap() & !hog_types != 0;

        let waiting: Vec<Arc<MdlTicket>> = queues.waiting.iter().cloned().collect();
        for ticket in waiting {
            let ty = ticket.ty();
            if skip_high_priority && hog_types & ty.bit() != 0 {
                continue;
            }
            if !self.can_grant_lock(queues, ty, ticket.ctx.id(), skip_high_priority) {
                continue;
            }
            if !ticket.ctx.wait.set_status(WaitStatus::Granted) {
                queues.waiting.remove(&ticket);
                queues.granted.add(ticket.clone());
                if hog_types & ty.bit() != 0 {
                    queues.hog_lock_count += 1;
                }
            }
        }

        if queues.waiting.bitmap() & !hog_types == 0 {
            queues.hog_lock_count = 0;
        }
    }

    /// Owners of granted tickets that a request of `ty` asks to back off,
    /// with whether each also needs its table level locks aborted.
    pub(crate) fn conflicting_owners(
        &self,
        queues: &LockQueues,
        requester: u64,
    ) -> Vec<(Arc<dyn MdlContextOwner>, bool)> {
        queues
            .granted
            .iter()
            .filter(|t| t.ctx.id() != requester && self.strategy.should_notify_holder(t.ty()))
            .map(|t| (t.ctx.owner.clone(), t.ctx.needs_thr_lock_abort()))
            .collect()
    }

    /// Contexts a request of `ty` waits for: holders of incompatible granted
    /// tickets and owners of pending tickets that take precedence over it.
    pub(crate) fn blocking_contexts(&self, ty: MdlType, requester: u64) -> Vec<u64> {
        let queues = self.queues.read();
        let granted = queues
            .granted
            .iter()
            .filter(|t| t.is_incompatible_when_granted(ty));
        let waiting = queues
            .waiting
            .iter()
            .filter(|t| t.is_incompatible_when_waiting(ty));
        let mut ids: Vec<u64> = granted
            .chain(waiting)
            .map(|t| t.ctx.id())
            .filter(|id| *id != requester)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Deadlock search step for a context waiting with `waiting_ticket`.
    ///
    /// Inspects all direct edges first and only then recurses into the
    /// contexts at their ends. Returns true once a deadlock was found.
    pub(crate) fn visit_subgraph(
        &self,
        waiting_ticket: &Arc<MdlTicket>,
        visitor: &mut DeadlockVisitor,
    ) -> bool {
        let queues = self.queues.read_recursive();
        let src = &waiting_ticket.ctx;

        // The lock may already be granted while the waiter has not yet seen it.
        let (status, generation) = src.wait.snapshot();
        if status != WaitStatus::Empty {
            return false;
        }

        let node = DeadlockNode {
            ctx: src.clone(),
            generation,
            weight: waiting_ticket.deadlock_weight(),
        };
        if visitor.enter_node(&node) {
            return true;
        }

        let ty = waiting_ticket.ty();
        let mut edges: Vec<Arc<ContextShared>> = queues
            .granted
            .iter()
            .filter(|t| t.ctx.id() != src.id() && t.is_incompatible_when_granted(ty))
            .map(|t| t.ctx.clone())
            .collect();
        edges.extend(
            queues
                .waiting
                .iter()
                .filter(|t| t.ctx.id() != src.id() && t.is_incompatible_when_waiting(ty))
                .map(|t| t.ctx.clone()),
        );

        let found = edges.iter().any(|ctx| visitor.inspect_edge(ctx))
            || edges
                .iter()
                .any(|ctx| ContextShared::visit_subgraph(ctx, visitor));
        visitor.leave_node(&node);
        found
    }
}
