use crate::mdl::context::ContextShared;
use crate::mdl::key::{MdlKey, MdlNamespace};
use crate::mdl::lock::MdlLock;
use crate::mdl::lock_type::{Bitmap, MdlType};
use std::convert::TryFrom;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub const DEADLOCK_WEIGHT_DML: u32 = 0;
pub const DEADLOCK_WEIGHT_DDL: u32 = 100;

/// How long a granted ticket is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MdlDuration {
    /// Released at the end of the statement.
    Statement = 0,
    /// Released at the end of the transaction.
    Transaction = 1,
    /// Released explicitly, e.g. by UNLOCK TABLES.
    Explicit = 2,
}

pub const MDL_DURATION_COUNT: usize = 3;

pub const ALL_DURATIONS: [MdlDuration; MDL_DURATION_COUNT] = [
    MdlDuration::Statement,
    MdlDuration::Transaction,
    MdlDuration::Explicit,
];

impl MdlDuration {
    fn from_u8(value: u8) -> MdlDuration {
        ALL_DURATIONS
            .get(value as usize)
            .copied()
            .unwrap_or(MdlDuration::Explicit)
    }
}

/// A lock request as passed to [`MdlContext`](crate::mdl::MdlContext).
/// `ticket` is filled in once the lock is granted.
#[derive(Debug, Clone)]
pub struct MdlRequest {
    pub key: MdlKey,
    pub ty: MdlType,
    pub duration: MdlDuration,
    pub ticket: Option<Arc<MdlTicket>>,
}

impl MdlRequest {
    pub fn new(key: MdlKey, ty: MdlType, duration: MdlDuration) -> MdlRequest {
        MdlRequest {
            key,
            ty,
            duration,
            ticket: None,
        }
    }

    pub fn table(db_name: &str, name: &str, ty: MdlType, duration: MdlDuration) -> MdlRequest {
        MdlRequest::new(MdlKey::table(db_name, name), ty, duration)
    }

    #[inline]
    pub fn is_granted(&self) -> bool {
        self.ticket.is_some()
    }
}

/// A granted or pending lock of one context on one [`MdlLock`].
///
/// Type and duration only change under the write lock of the lock queues or
/// from the owning context, they are atomics so that other threads can read
/// them while inspecting the queues.
pub struct MdlTicket {
    ty: AtomicU8,
    duration: AtomicU8,
    pub(crate) ctx: Arc<ContextShared>,
    pub(crate) lock: Arc<MdlLock>,
    /// Position in the acquisition order of the owning context.
    pub(crate) seq: u64,
}

impl MdlTicket {
    pub(crate) fn new(
        ctx: Arc<ContextShared>,
        lock: Arc<MdlLock>,
        ty: MdlType,
        duration: MdlDuration,
        seq: u64,
    ) -> MdlTicket {
        MdlTicket {
            ty: AtomicU8::new(ty as u8),
            duration: AtomicU8::new(duration as u8),
            ctx,
            lock,
            seq,
        }
    }

    #[inline]
    pub fn ty(&self) -> MdlType {
        MdlType::try_from(self.ty.load(Ordering::Acquire)).unwrap_or(MdlType::Exclusive)
    }

    pub(crate) fn set_type(&self, ty: MdlType) {
        self.ty.store(ty as u8, Ordering::Release);
    }

    #[inline]
    pub fn duration(&self) -> MdlDuration {
        MdlDuration::from_u8(self.duration.load(Ordering::Acquire))
    }

    pub(crate) fn set_duration(&self, duration: MdlDuration) {
        self.duration.store(duration as u8, Ordering::Release);
    }

    #[inline]
    pub fn key(&self) -> &MdlKey {
        self.lock.key()
    }

    #[inline]
    pub fn context_id(&self) -> u64 {
        self.ctx.id()
    }

    pub fn has_stronger_or_equal_type(&self, ty: MdlType) -> bool {
        self.lock.strategy().has_stronger_or_equal(self.ty(), ty)
    }

    pub fn is_upgradable_or_exclusive(&self) -> bool {
        let ty = self.ty();
        ty.is_upgradable() || ty == MdlType::Exclusive
    }

    /// Whether this ticket, when granted, blocks a request of `ty`.
    pub(crate) fn is_incompatible_when_granted(&self, ty: MdlType) -> bool {
        self.ty().bit() & self.lock.strategy().granted_incompatible(ty) != 0
    }

    /// Whether this ticket, when pending, takes precedence over a request of
    /// `ty`.
    pub(crate) fn is_incompatible_when_waiting(&self, ty: MdlType) -> bool {
        self.ty().bit() & self.lock.strategy().waiting_incompatible(ty) != 0
    }

    pub fn deadlock_weight(&self) -> u32 {
        if self.key().namespace() == MdlNamespace::Global
            || self.ty() >= MdlType::SharedUpgradable
        {
            DEADLOCK_WEIGHT_DDL
        } else {
            DEADLOCK_WEIGHT_DML
        }
    }
}

impl fmt::Debug for MdlTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MdlTicket")
            .field("key", self.key())
            .field("ty", &self.ty())
            .field("duration", &self.duration())
            .field("context", &self.context_id())
            .field("seq", &self.seq)
            .finish()
    }
}

/// Tickets of one queue of a lock with a bitmap of their types.
#[derive(Default)]
pub struct TicketList {
    list: Vec<Arc<MdlTicket>>,
    bitmap: Bitmap,
}

impl TicketList {
    pub fn add(&mut self, ticket: Arc<MdlTicket>) {
        self.bitmap |= ticket.ty().bit();
        self.list.push(ticket);
    }

    pub fn remove(&mut self, ticket: &Arc<MdlTicket>) -> bool {
        let before = self.list.len();
        self.list.retain(|t| !Arc::ptr_eq(t, ticket));
        self.bitmap = self.list.iter().fold(0, |map, t| map | t.ty().bit());
        before != self.list.len()
    }

    #[inline]
    pub fn bitmap(&self) -> Bitmap {
        self.bitmap
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<MdlTicket>> {
        self.list.iter()
    }
}
