use crate::mdl::key::MdlNamespace;
use std::convert::TryFrom;

/// Metadata lock types, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MdlType {
    /// Intention exclusive, only for scoped locks.
    IntentionExclusive = 0,
    /// Access to metadata only.
    Shared,
    /// Shared lock that ignores pending exclusive requests.
    SharedHighPrio,
    SharedRead,
    SharedWrite,
    /// Can be upgraded to `SharedNoWrite`, `SharedNoReadWrite` or `Exclusive`.
    SharedUpgradable,
    SharedNoWrite,
    SharedNoReadWrite,
    Exclusive,
}

pub const MDL_TYPE_COUNT: usize = 9;

pub const ALL_TYPES: [MdlType; MDL_TYPE_COUNT] = [
    MdlType::IntentionExclusive,
    MdlType::Shared,
    MdlType::SharedHighPrio,
    MdlType::SharedRead,
    MdlType::SharedWrite,
    MdlType::SharedUpgradable,
    MdlType::SharedNoWrite,
    MdlType::SharedNoReadWrite,
    MdlType::Exclusive,
];

pub type Bitmap = u16;

#[inline]
pub const fn bit(ty: MdlType) -> Bitmap {
    1 << ty as u8
}

impl TryFrom<u8> for MdlType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ALL_TYPES.get(value as usize).copied().ok_or(value)
    }
}

impl MdlType {
    #[inline]
    pub fn bit(self) -> Bitmap {
        bit(self)
    }

    /// Types a ticket of this type may be upgraded from.
    pub fn is_upgradable(self) -> bool {
        matches!(
            self,
            MdlType::SharedUpgradable | MdlType::SharedNoWrite | MdlType::SharedNoReadWrite
        )
    }
}

const S: Bitmap = bit(MdlType::Shared);
const SH: Bitmap = bit(MdlType::SharedHighPrio);
const SR: Bitmap = bit(MdlType::SharedRead);
const SW: Bitmap = bit(MdlType::SharedWrite);
const SU: Bitmap = bit(MdlType::SharedUpgradable);
const SNW: Bitmap = bit(MdlType::SharedNoWrite);
const SNRW: Bitmap = bit(MdlType::SharedNoReadWrite);
const X: Bitmap = bit(MdlType::Exclusive);
const IX: Bitmap = bit(MdlType::IntentionExclusive);

const OBJECT_GRANTED_INCOMPATIBLE: [Bitmap; MDL_TYPE_COUNT] = [
    0,
    X,
    X,
    X | SNRW,
    X | SNRW | SNW,
    X | SNRW | SNW | SU,
    X | SNRW | SNW | SU | SW,
    X | SNRW | SNW | SU | SW | SR,
    X | SNRW | SNW | SU | SW | SR | SH | S,
];

const OBJECT_WAITING_INCOMPATIBLE: [Bitmap; MDL_TYPE_COUNT] = [
    0,
    X,
    0,
    X | SNRW,
    X | SNRW | SNW,
    X,
    X,
    X,
    0,
];

const SCOPED_GRANTED_INCOMPATIBLE: [Bitmap; MDL_TYPE_COUNT] = [
    S | X,
    IX | X,
    0,
    0,
    0,
    0,
    0,
    0,
    IX | S | X,
];

const SCOPED_WAITING_INCOMPATIBLE: [Bitmap; MDL_TYPE_COUNT] = [S | X, X, 0, 0, 0, 0, 0, 0, 0];

/// Compatibility rules of a lock, chosen by the namespace of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    Scoped,
    Object,
}

impl LockStrategy {
    pub fn for_namespace(namespace: MdlNamespace) -> LockStrategy {
        if namespace.is_scoped() {
            LockStrategy::Scoped
        } else {
            LockStrategy::Object
        }
    }

    /// Granted types a request of `ty` can not coexist with.
    #[inline]
    pub fn granted_incompatible(self, ty: MdlType) -> Bitmap {
        match self {
            LockStrategy::Scoped => SCOPED_GRANTED_INCOMPATIBLE[ty as usize],
            LockStrategy::Object => OBJECT_GRANTED_INCOMPATIBLE[ty as usize],
        }
    }

    /// Pending types that take precedence over a request of `ty`.
    #[inline]
    pub fn waiting_incompatible(self, ty: MdlType) -> Bitmap {
        match self {
            LockStrategy::Scoped => SCOPED_WAITING_INCOMPATIBLE[ty as usize],
            LockStrategy::Object => OBJECT_WAITING_INCOMPATIBLE[ty as usize],
        }
    }

    /// High priority types, subject to `max_write_lock_count`.
    #[inline]
    pub fn hog_lock_types(self) -> Bitmap {
        match self {
            LockStrategy::Scoped => 0,
            LockStrategy::Object => SNW | SNRW | X,
        }
    }

    /// Whether a ticket of `held` type already grants everything `requested`
    /// does.
    pub fn has_stronger_or_equal(self, held: MdlType, requested: MdlType) -> bool {
        let req = self.granted_incompatible(requested);
        req & !self.granted_incompatible(held) == 0
    }

    /// Whether waiting for `ty` should ask holders of conflicting weaker
    /// locks to give them up.
    pub fn needs_notification(self, ty: MdlType) -> bool {
        match self {
            LockStrategy::Scoped => ty == MdlType::Shared,
            LockStrategy::Object => ty >= MdlType::SharedNoWrite,
        }
    }

    /// Whether a holder of `ty` gets notified by such a request.
    pub fn should_notify_holder(self, ty: MdlType) -> bool {
        match self {
            LockStrategy::Scoped => ty == MdlType::IntentionExclusive,
            LockStrategy::Object => ty < MdlType::SharedUpgradable,
        }
    }
}
