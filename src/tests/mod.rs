mod mdl_test;

use std::time::{Duration, Instant};

pub(crate) fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `cond` until it holds, panicking after a few seconds.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}
