use crate::mdl::owner::MdlContextOwner;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How often a waiter wakes up to check whether its owner was killed.
const KILL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Empty,
    Granted,
    Victim,
    Timeout,
    Killed,
}

struct WaitSlot {
    status: WaitStatus,
    generation: u64,
}

/// Wait slot of one context. A context waits for at most one lock at a
/// time, and whoever decides the outcome of that wait writes it here once.
///
/// Every wait starts a new generation so a deadlock detector that inspected
/// an earlier wait can not pick a victim for the current one.
pub struct MdlWait {
    slot: Mutex<WaitSlot>,
    cond: Condvar,
}

impl Default for MdlWait {
    fn default() -> Self {
        MdlWait {
            slot: Mutex::new(WaitSlot {
                status: WaitStatus::Empty,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }
}

impl MdlWait {
    pub fn reset_status(&self) -> u64 {
        let mut slot = self.slot.lock().unwrap();
        slot.status = WaitStatus::Empty;
        slot.generation += 1;
        slot.generation
    }

    pub fn status(&self) -> WaitStatus {
        self.slot.lock().unwrap().status
    }

    pub fn snapshot(&self) -> (WaitStatus, u64) {
        let slot = self.slot.lock().unwrap();
        (slot.status, slot.generation)
    }

    /// Sets the outcome unless one is already set. Returns false on success,
    /// true if the slot was already taken.
    pub fn set_status(&self, status: WaitStatus) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.status != WaitStatus::Empty {
            return true;
        }
        slot.status = status;
        self.cond.notify_all();
        false
    }

    /// Like [`set_status`](Self::set_status) but only for the wait started as
    /// `generation`.
    pub fn set_status_for(&self, generation: u64, status: WaitStatus) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.generation != generation || slot.status != WaitStatus::Empty {
            return true;
        }
        slot.status = status;
        self.cond.notify_all();
        false
    }

    /// Waits until the status is set, `deadline` passes or the owner is
    /// killed. When the deadline passes with `set_status_on_timeout` the slot
    /// is set to `Timeout`, otherwise it stays `Empty` and the caller may wait
    /// again.
    pub fn timed_wait(
        &self,
        owner: &dyn MdlContextOwner,
        deadline: Option<Instant>,
        set_status_on_timeout: bool,
        stage: &'static str,
    ) -> WaitStatus {
        owner.enter_cond(stage);
        let mut slot = self.slot.lock().unwrap();
        while slot.status == WaitStatus::Empty {
            if owner.is_killed() {
                slot.status = WaitStatus::Killed;
                break;
            }
            let now = Instant::now();
            let mut slice = KILL_CHECK_INTERVAL;
            if let Some(deadline) = deadline {
                if now >= deadline {
                    if set_status_on_timeout {
                        slot.status = WaitStatus::Timeout;
                    }
                    break;
                }
                slice = slice.min(deadline - now);
            }
            slot = self.cond.wait_timeout(slot, slice).unwrap().0;
        }
        let status = slot.status;
        drop(slot);
        owner.exit_cond(stage);
        status
    }
}
