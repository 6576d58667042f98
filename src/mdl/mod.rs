//! Metadata locks: named locks on schema objects with a fixed set of lock
//! types, priorities between pending requests and deadlock detection across
//! sessions.

pub mod context;
pub mod deadlock;
pub mod key;
pub mod lock;
pub mod lock_type;
pub mod map;
pub mod owner;
pub mod ticket;
pub mod wait;

pub use context::{MdlContext, MdlSavepoint};
pub use key::{MdlKey, MdlNamespace};
pub use lock_type::{LockStrategy, MdlType};
pub use map::{MdlLockInfo, MdlService, MdlTimeoutInfo};
pub use owner::{MdlContextOwner, SessionOwner};
pub use ticket::{MdlDuration, MdlRequest, MdlTicket};
