use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// What the metadata lock subsystem needs from the session that owns a
/// context.
pub trait MdlContextOwner: Send + Sync {
    /// Called before blocking on a lock, with the stage to report.
    fn enter_cond(&self, _stage: &'static str) {}

    /// Called after the wait ended, successfully or not.
    fn exit_cond(&self, _stage: &'static str) {}

    /// Polled while waiting; a killed owner stops waiting.
    fn is_killed(&self) -> bool {
        false
    }

    /// Asks `holder`, which owns a lock conflicting with a request of this
    /// owner, to release what it can. `needs_thr_lock_abort` is set when the
    /// holder also holds table level locks that must be aborted.
    fn notify_shared_lock(&self, _holder: &dyn MdlContextOwner, _needs_thr_lock_abort: bool) {}

    fn id(&self) -> u64 {
        0
    }
}

/// Owner for a plain session thread, which can be killed from elsewhere.
#[derive(Default)]
pub struct SessionOwner {
    id: u64,
    killed: AtomicBool,
    stage: Mutex<Option<&'static str>>,
}

impl SessionOwner {
    pub fn new(id: u64) -> SessionOwner {
        SessionOwner {
            id,
            killed: AtomicBool::new(false),
            stage: Mutex::new(None),
        }
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// The stage the session is currently blocked in, if any.
    pub fn current_stage(&self) -> Option<&'static str> {
        *self.stage.lock().unwrap()
    }
}

impl MdlContextOwner for SessionOwner {
    fn enter_cond(&self, stage: &'static str) {
        *self.stage.lock().unwrap() = Some(stage);
    }

    fn exit_cond(&self, _stage: &'static str) {
        *self.stage.lock().unwrap() = None;
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    fn notify_shared_lock(&self, holder: &dyn MdlContextOwner, needs_thr_lock_abort: bool) {
        debug!(
            "session {} asks session {} to release shared locks (abort table locks: {})",
            self.id,
            holder.id(),
            needs_thr_lock_abort
        );
    }

    fn id(&self) -> u64 {
        self.id
    }
}
