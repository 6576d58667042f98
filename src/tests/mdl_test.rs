use super::{init_log, wait_until};
use crate::error::LockError;
use crate::mdl::lock_type::ALL_TYPES;
use crate::mdl::{
    LockStrategy, MdlContext, MdlContextOwner, MdlDuration, MdlKey, MdlNamespace, MdlRequest,
    MdlService, MdlTimeoutInfo, MdlType, SessionOwner,
};
use crate::options::MdlOptions;
use crate::Result;
use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LONG: Duration = Duration::from_secs(10);

fn new_context(service: &MdlService, owner_id: u64) -> MdlContext {
    service.create_context(Arc::new(SessionOwner::new(owner_id)))
}

fn request(name: &str, ty: MdlType) -> MdlRequest {
    MdlRequest::table("db", name, ty, MdlDuration::Transaction)
}

fn waiting_count(service: &MdlService, name: &str) -> usize {
    service
        .lock_info(&MdlKey::table("db", name))
        .map_or(0, |info| info.waiting.len())
}

/// Acquires `ty` on `name` in a new thread and holds it until the returned
/// sender fires or is dropped.
fn spawn_holder(
    mut ctx: MdlContext,
    name: &'static str,
    ty: MdlType,
) -> (JoinHandle<Result<()>>, Sender<()>) {
    let (tx, rx) = crossbeam_channel::unbounded::<()>();
    let handle = thread::spawn(move || {
        let mut req = request(name, ty);
        let res = ctx.acquire_lock(&mut req, LONG);
        if res.is_ok() {
            let _ = rx.recv();
        }
        ctx.release_transactional_locks();
        res
    });
    (handle, tx)
}

#[test]
fn test_try_acquire_follows_matrix() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let mut b = new_context(&service, 2);
    for &held in ALL_TYPES[1..].iter() {
        for &requested in ALL_TYPES[1..].iter() {
            let mut h = request("t1", held);
            assert!(a.try_acquire_lock(&mut h));
            let mut r = request("t1", requested);
            let expected = LockStrategy::Object.granted_incompatible(requested) & held.bit() == 0;
            assert_eq!(
                b.try_acquire_lock(&mut r),
                expected,
                "{:?} held, {:?} requested",
                held,
                requested
            );
            assert_eq!(r.is_granted(), expected);
            a.release_transactional_locks();
            b.release_transactional_locks();
        }
    }
    assert_eq!(service.lock_count(), 0);
}

#[test]
fn test_scoped_locks() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let mut b = new_context(&service, 2);
    let mut c = new_context(&service, 3);

    let mut ix_a = MdlRequest::new(MdlKey::global(), MdlType::IntentionExclusive, MdlDuration::Statement);
    let mut ix_b = ix_a.clone();
    assert!(a.try_acquire_lock(&mut ix_a));
    assert!(b.try_acquire_lock(&mut ix_b));

    let mut s = MdlRequest::new(MdlKey::global(), MdlType::Shared, MdlDuration::Explicit);
    assert!(!c.try_acquire_lock(&mut s));
    a.release_statement_locks();
    b.release_statement_locks();
    assert!(c.try_acquire_lock(&mut s));

    let mut ix = MdlRequest::new(MdlKey::global(), MdlType::IntentionExclusive, MdlDuration::Statement);
    assert!(!a.try_acquire_lock(&mut ix));
    c.release_lock(s.ticket.as_ref().unwrap());
    assert_eq!(service.lock_count(), 0);
}

#[test]
fn test_pending_exclusive_blocks_new_readers() {
    init_log();
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let b = new_context(&service, 2);
    let mut c = new_context(&service, 3);

    let mut sr = request("t1", MdlType::SharedRead);
    a.acquire_lock(&mut sr, LONG).unwrap();

    let (handle, tx) = spawn_holder(b, "t1", MdlType::Exclusive);
    wait_until(|| waiting_count(&service, "t1") == 1);

    let mut sr2 = request("t1", MdlType::SharedRead);
    assert!(!c.try_acquire_lock(&mut sr2));
    let mut sh = request("t1", MdlType::SharedHighPrio);
    assert!(c.try_acquire_lock(&mut sh));
    c.release_transactional_locks();

    a.release_transactional_locks();
    tx.send(()).unwrap();
    assert!(handle.join().unwrap().is_ok());
    assert_eq!(service.lock_count(), 0);
}

#[test]
fn test_max_write_lock_count() {
    init_log();
    let service = MdlService::new(MdlOptions {
        max_write_lock_count: 1,
        ..MdlOptions::default()
    });
    let key = MdlKey::table("db", "t1");
    let mut x = new_context(&service, 1);
    let r = new_context(&service, 2);
    let w = new_context(&service, 3);
    let n = new_context(&service, 4);
    let (r_id, w_id, n_id) = (r.id(), w.id(), n.id());

    let mut req = request("t1", MdlType::Exclusive);
    x.acquire_lock(&mut req, LONG).unwrap();

    let (r_handle, r_tx) = spawn_holder(r, "t1", MdlType::SharedRead);
    wait_until(|| waiting_count(&service, "t1") == 1);
    let (w_handle, w_tx) = spawn_holder(w, "t1", MdlType::SharedWrite);
    wait_until(|| waiting_count(&service, "t1") == 2);
    let (n_handle, n_tx) = spawn_holder(n, "t1", MdlType::SharedNoReadWrite);
    wait_until(|| waiting_count(&service, "t1") == 3);

    // The pending SNRW takes precedence over the readers and writers.
    x.release_transactional_locks();
    let info = service.lock_info(&key).unwrap();
    assert_eq!(info.granted, vec![(n_id, MdlType::SharedNoReadWrite)]);
    assert_eq!(
        info.waiting,
        vec![(r_id, MdlType::SharedRead), (w_id, MdlType::SharedWrite)]
    );
    assert_eq!(info.hog_lock_count, 1);

    n_tx.send(()).unwrap();
    assert!(n_handle.join().unwrap().is_ok());
    let info = service.lock_info(&key).unwrap();
    assert_eq!(
        info.granted,
        vec![(r_id, MdlType::SharedRead), (w_id, MdlType::SharedWrite)]
    );
    assert!(info.waiting.is_empty());
    assert_eq!(info.hog_lock_count, 0);

    r_tx.send(()).unwrap();
    w_tx.send(()).unwrap();
    assert!(r_handle.join().unwrap().is_ok());
    assert!(w_handle.join().unwrap().is_ok());
    assert_eq!(service.lock_count(), 0);
}

#[test]
fn test_reacquire_reuses_ticket() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);

    let mut x = request("t1", MdlType::Exclusive);
    a.acquire_lock(&mut x, LONG).unwrap();
    let mut sr = request("t1", MdlType::SharedRead);
    a.acquire_lock(&mut sr, LONG).unwrap();
    assert!(Arc::ptr_eq(
        x.ticket.as_ref().unwrap(),
        sr.ticket.as_ref().unwrap()
    ));
    assert_eq!(a.tickets(MdlDuration::Transaction).len(), 1);

    // A different duration gets its own ticket.
    let mut stmt = MdlRequest::table("db", "t1", MdlType::SharedRead, MdlDuration::Statement);
    a.acquire_lock(&mut stmt, LONG).unwrap();
    assert!(!Arc::ptr_eq(
        x.ticket.as_ref().unwrap(),
        stmt.ticket.as_ref().unwrap()
    ));
    let key = MdlKey::table("db", "t1");
    assert_eq!(service.lock_info(&key).unwrap().granted.len(), 2);

    a.release_statement_locks();
    assert_eq!(service.lock_info(&key).unwrap().granted.len(), 1);
    a.release_transactional_locks();
    assert!(service.lock_info(&key).is_none());
}

#[test]
fn test_durations() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);

    let mut t1 = MdlRequest::table("db", "t1", MdlType::SharedRead, MdlDuration::Statement);
    let mut t2 = request("t2", MdlType::SharedWrite);
    a.acquire_lock(&mut t1, LONG).unwrap();
    a.acquire_lock(&mut t2, LONG).unwrap();
    assert!(a.has_locks_for(MdlDuration::Statement));

    let ticket = t1.ticket.clone().unwrap();
    a.set_lock_duration(&ticket, MdlDuration::Transaction);
    assert_eq!(ticket.duration(), MdlDuration::Transaction);
    assert!(!a.has_locks_for(MdlDuration::Statement));
    a.release_statement_locks();
    assert_eq!(a.tickets(MdlDuration::Transaction).len(), 2);

    a.set_explicit_duration_for_all_locks();
    assert_eq!(a.tickets(MdlDuration::Explicit).len(), 2);
    a.release_transactional_locks();
    assert_eq!(service.lock_count(), 2);

    a.set_transaction_duration_for_all_locks();
    assert!(!a.has_locks_for(MdlDuration::Explicit));
    a.release_transactional_locks();
    assert!(!a.has_locks());
    assert_eq!(service.lock_count(), 0);
}

#[test]
fn test_release_all_locks_for_name() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);

    let mut first = MdlRequest::table("db", "t1", MdlType::SharedRead, MdlDuration::Explicit);
    let mut second = first.clone();
    let mut other = MdlRequest::table("db", "t2", MdlType::SharedRead, MdlDuration::Explicit);
    a.acquire_lock(&mut first, LONG).unwrap();
    a.acquire_lock(&mut second, LONG).unwrap();
    a.acquire_lock(&mut other, LONG).unwrap();
    assert_eq!(a.tickets(MdlDuration::Explicit).len(), 3);

    a.release_all_locks_for_name(first.ticket.as_ref().unwrap());
    assert_eq!(a.tickets(MdlDuration::Explicit).len(), 1);
    assert!(service.lock_info(&MdlKey::table("db", "t1")).is_none());
    a.release_lock(other.ticket.as_ref().unwrap());
}

#[test]
fn test_savepoint() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);

    let mut l1 = request("t1", MdlType::SharedRead);
    let mut l2 = request("t2", MdlType::SharedRead);
    a.acquire_lock(&mut l1, LONG).unwrap();
    a.acquire_lock(&mut l2, LONG).unwrap();
    let savepoint = a.mdl_savepoint();
    let mut l3 = request("t3", MdlType::SharedWrite);
    let mut l4 = MdlRequest::table("db", "t4", MdlType::SharedRead, MdlDuration::Statement);
    let mut l5 = MdlRequest::table("db", "t5", MdlType::SharedRead, MdlDuration::Explicit);
    a.acquire_lock(&mut l3, LONG).unwrap();
    a.acquire_lock(&mut l4, LONG).unwrap();
    a.acquire_lock(&mut l5, LONG).unwrap();

    assert!(a.has_lock(&savepoint, l1.ticket.as_ref().unwrap()));
    assert!(!a.has_lock(&savepoint, l3.ticket.as_ref().unwrap()));
    assert!(a.has_lock(&savepoint, l5.ticket.as_ref().unwrap()));

    a.rollback_to_savepoint(&savepoint);
    assert!(a.is_lock_owner(MdlNamespace::Table, "db", "t1", MdlType::SharedRead));
    assert!(a.is_lock_owner(MdlNamespace::Table, "db", "t2", MdlType::SharedRead));
    assert!(!a.is_lock_owner(MdlNamespace::Table, "db", "t3", MdlType::SharedRead));
    assert!(!a.is_lock_owner(MdlNamespace::Table, "db", "t4", MdlType::SharedRead));
    assert!(a.is_lock_owner(MdlNamespace::Table, "db", "t5", MdlType::SharedRead));
    assert!(!a.is_lock_owner(MdlNamespace::Table, "db", "t1", MdlType::Exclusive));
    assert_eq!(service.lock_count(), 3);

    a.release_transactional_locks();
    a.release_lock(l5.ticket.as_ref().unwrap());
    assert_eq!(service.lock_count(), 0);
}

#[test]
fn test_acquire_locks_all_or_nothing() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let mut b = new_context(&service, 2);

    let mut x = request("t3", MdlType::Exclusive);
    a.acquire_lock(&mut x, LONG).unwrap();

    let mut requests = vec![
        request("t3", MdlType::SharedRead),
        request("t1", MdlType::SharedRead),
        request("t2", MdlType::SharedRead),
    ];
    let err = b
        .acquire_locks(&mut requests, Duration::from_millis(0))
        .unwrap_err();
    assert_eq!(err, LockError::MdlLockWaitTimeout(MdlKey::table("db", "t3")));
    assert!(requests.iter().all(|r| !r.is_granted()));
    assert!(!b.has_locks());
    assert_eq!(service.lock_count(), 1);

    a.release_transactional_locks();
    b.acquire_locks(&mut requests, LONG).unwrap();
    assert!(requests.iter().all(|r| r.is_granted()));
    assert_eq!(b.tickets(MdlDuration::Transaction).len(), 3);
    b.release_transactional_locks();
}

#[test]
fn test_upgrade() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let mut b = new_context(&service, 2);
    let key = MdlKey::table("db", "t1");

    let mut su = request("t1", MdlType::SharedUpgradable);
    a.acquire_lock(&mut su, LONG).unwrap();
    let ticket = su.ticket.clone().unwrap();

    let mut sr = request("t1", MdlType::SharedRead);
    b.acquire_lock(&mut sr, LONG).unwrap();
    let err = a
        .upgrade_shared_lock(&ticket, MdlType::Exclusive, Duration::from_millis(0))
        .unwrap_err();
    assert_eq!(err, LockError::MdlLockWaitTimeout(key.clone()));
    assert_eq!(ticket.ty(), MdlType::SharedUpgradable);
    b.release_transactional_locks();

    a.upgrade_shared_lock(&ticket, MdlType::Exclusive, LONG)
        .unwrap();
    assert_eq!(ticket.ty(), MdlType::Exclusive);
    assert!(ticket.is_upgradable_or_exclusive());
    assert_eq!(a.tickets(MdlDuration::Transaction).len(), 1);
    let info = service.lock_info(&key).unwrap();
    assert_eq!(info.granted, vec![(a.id(), MdlType::Exclusive)]);

    // Already strong enough.
    a.upgrade_shared_lock(&ticket, MdlType::Exclusive, LONG)
        .unwrap();
    a.upgrade_shared_lock(&ticket, MdlType::SharedNoWrite, LONG)
        .unwrap();
    assert_eq!(ticket.ty(), MdlType::Exclusive);
    assert!(!b.try_acquire_lock(&mut request("t1", MdlType::SharedHighPrio)));
    a.release_transactional_locks();
}

#[test]
#[should_panic(expected = "can not upgrade")]
fn test_upgrade_shared_read_panics() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let mut sr = request("t1", MdlType::SharedRead);
    a.acquire_lock(&mut sr, LONG).unwrap();
    let ticket = sr.ticket.clone().unwrap();
    let _ = a.upgrade_shared_lock(&ticket, MdlType::Exclusive, LONG);
}

#[test]
fn test_downgrade_wakes_waiters() {
    init_log();
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let b = new_context(&service, 2);
    let b_id = b.id();
    let key = MdlKey::table("db", "t1");

    let mut x = request("t1", MdlType::Exclusive);
    a.acquire_lock(&mut x, LONG).unwrap();
    let ticket = x.ticket.clone().unwrap();

    let (handle, tx) = spawn_holder(b, "t1", MdlType::SharedRead);
    wait_until(|| waiting_count(&service, "t1") == 1);

    a.downgrade_lock(&ticket, MdlType::SharedNoWrite);
    assert_eq!(ticket.ty(), MdlType::SharedNoWrite);
    let info = service.lock_info(&key).unwrap();
    assert!(info.waiting.is_empty());
    assert!(info.granted.contains(&(b_id, MdlType::SharedRead)));

    // Not weaker, nothing to do.
    a.downgrade_lock(&ticket, MdlType::Exclusive);
    assert_eq!(ticket.ty(), MdlType::SharedNoWrite);

    tx.send(()).unwrap();
    assert!(handle.join().unwrap().is_ok());
    a.release_transactional_locks();
}

#[test]
fn test_deadlock_picks_lightest_victim() {
    init_log();
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let mut b = new_context(&service, 2);

    let mut sr = request("t1", MdlType::SharedRead);
    a.acquire_lock(&mut sr, LONG).unwrap();
    let mut snw = request("t2", MdlType::SharedNoWrite);
    b.acquire_lock(&mut snw, LONG).unwrap();

    let handle = thread::spawn(move || {
        let mut sw = request("t2", MdlType::SharedWrite);
        let res = a.acquire_lock(&mut sw, LONG);
        a.release_transactional_locks();
        res
    });
    wait_until(|| waiting_count(&service, "t2") == 1);

    // The DML waiter weighs less than the DDL one and is chosen.
    let mut x = request("t1", MdlType::Exclusive);
    b.acquire_lock(&mut x, LONG).unwrap();
    assert_eq!(
        handle.join().unwrap().unwrap_err(),
        LockError::MdlDeadlock(MdlKey::table("db", "t2"))
    );
    assert_eq!(b.tickets(MdlDuration::Transaction).len(), 2);
    b.release_transactional_locks();
    assert_eq!(service.lock_count(), 0);
}

#[test]
fn test_timeout_callback() {
    let service = MdlService::new(MdlOptions::default());
    let infos = Arc::new(Mutex::new(Vec::<MdlTimeoutInfo>::new()));
    let recorded = infos.clone();
    service.set_lock_timeout_callback(move |info| recorded.lock().unwrap().push(info.clone()));

    let mut a = new_context(&service, 1);
    let mut b = new_context(&service, 2);
    let key = MdlKey::table("db", "t1");
    let mut x = request("t1", MdlType::Exclusive);
    a.acquire_lock(&mut x, LONG).unwrap();

    let mut sr = request("t1", MdlType::SharedRead);
    let err = b
        .acquire_lock(&mut sr, Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(err, LockError::MdlLockWaitTimeout(key.clone()));
    assert!(err.is_retryable());
    assert!(service.lock_info(&key).unwrap().waiting.is_empty());

    assert!(!b.try_acquire_lock(&mut sr));
    assert!(b.acquire_lock(&mut sr, Duration::from_millis(0)).is_err());

    let infos = infos.lock().unwrap();
    assert_eq!(infos.len(), 2);
    for info in infos.iter() {
        assert_eq!(info.context_id, b.id());
        assert_eq!(info.key, key);
        assert_eq!(info.ty, MdlType::SharedRead);
        assert_eq!(info.blocking_contexts, vec![a.id()]);
    }
    a.release_transactional_locks();
}

#[test]
fn test_timeout_names_pending_blocker() {
    init_log();
    let service = MdlService::new(MdlOptions::default());
    let infos = Arc::new(Mutex::new(Vec::<MdlTimeoutInfo>::new()));
    let recorded = infos.clone();
    service.set_lock_timeout_callback(move |info| recorded.lock().unwrap().push(info.clone()));

    let mut a = new_context(&service, 1);
    let b = new_context(&service, 2);
    let mut c = new_context(&service, 3);
    let b_id = b.id();
    let key = MdlKey::table("db", "t1");

    let mut sr = request("t1", MdlType::SharedRead);
    a.acquire_lock(&mut sr, LONG).unwrap();
    let (handle, tx) = spawn_holder(b, "t1", MdlType::Exclusive);
    wait_until(|| waiting_count(&service, "t1") == 1);

    // Only the pending X stands in the way of another SR.
    let mut sr2 = request("t1", MdlType::SharedRead);
    assert_eq!(
        c.acquire_lock(&mut sr2, Duration::from_millis(100)),
        Err(LockError::MdlLockWaitTimeout(key.clone()))
    );
    {
        let infos = infos.lock().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].context_id, c.id());
        assert_eq!(infos[0].blocking_contexts, vec![b_id]);
    }

    a.release_transactional_locks();
    tx.send(()).unwrap();
    assert!(handle.join().unwrap().is_ok());
    assert_eq!(service.lock_count(), 0);
}

#[test]
fn test_killed_while_waiting() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let owner = Arc::new(SessionOwner::new(2));
    let mut b = service.create_context(owner.clone());

    let mut x = request("t1", MdlType::Exclusive);
    a.acquire_lock(&mut x, LONG).unwrap();

    let killer = owner.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        killer.kill();
    });
    let mut sr = request("t1", MdlType::SharedRead);
    assert_eq!(b.acquire_lock(&mut sr, LONG).unwrap_err(), LockError::Killed);
    handle.join().unwrap();
    assert_eq!(owner.current_stage(), None);
    assert_eq!(waiting_count(&service, "t1"), 0);
    a.release_transactional_locks();
}

#[derive(Default)]
struct RecordingOwner {
    notified: Mutex<Vec<(u64, bool)>>,
}

impl MdlContextOwner for RecordingOwner {
    fn notify_shared_lock(&self, holder: &dyn MdlContextOwner, needs_thr_lock_abort: bool) {
        self.notified
            .lock()
            .unwrap()
            .push((holder.id(), needs_thr_lock_abort));
    }
}

#[test]
fn test_notify_shared_lock_holders() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 10);
    a.set_needs_thr_lock_abort(true);
    let owner = Arc::new(RecordingOwner::default());
    let mut b = service.create_context(owner.clone());

    let mut sr = request("t1", MdlType::SharedRead);
    a.acquire_lock(&mut sr, LONG).unwrap();

    let mut x = request("t1", MdlType::Exclusive);
    assert!(b.acquire_lock(&mut x, Duration::from_millis(100)).is_err());
    let notified = owner.notified.lock().unwrap();
    assert!(!notified.is_empty());
    assert_eq!(notified[0], (10, true));
    drop(notified);

    // Weak requests never notify.
    owner.notified.lock().unwrap().clear();
    let mut sw = request("t1", MdlType::SharedWrite);
    b.acquire_lock(&mut sw, LONG).unwrap();
    assert!(owner.notified.lock().unwrap().is_empty());

    a.release_transactional_locks();
    b.release_transactional_locks();
}

#[test]
fn test_lock_wait_timeout_option() {
    let service = MdlService::new(MdlOptions::default());
    let a = new_context(&service, 1);
    service.set_lock_wait_timeout(Duration::from_secs(3));
    assert_eq!(a.lock_wait_timeout(), Duration::from_secs(3));
    service.set_max_write_lock_count(5);
    assert_eq!(service.options().max_write_lock_count, 5);
}

#[test]
#[should_panic(expected = "dropped while holding locks")]
fn test_drop_context_with_locks_panics() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let mut sr = request("t1", MdlType::SharedRead);
    a.acquire_lock(&mut sr, LONG).unwrap();
    drop(a);
}

#[test]
#[should_panic(expected = "is not owned by context")]
fn test_release_foreign_ticket_panics() {
    let service = MdlService::new(MdlOptions::default());
    let mut a = new_context(&service, 1);
    let mut b = new_context(&service, 2);
    let mut sr = request("t1", MdlType::SharedRead);
    a.acquire_lock(&mut sr, LONG).unwrap();
    b.release_lock(sr.ticket.as_ref().unwrap());
}
