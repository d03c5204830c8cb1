//! Mutex semantics: recursion, priority inheritance, robustness,
//! abandonment.
use tern_kernel::{
    Config, Error, Kernel, MutexAttr, ThreadAttr, ThreadId, Wait, Wakeup, MUTEX_LOCK_LIMIT,
    WAIT_FOREVER,
};

fn nop(_: usize) {}

fn kernel() -> Kernel {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::new(Config::default()).unwrap()
}

fn spawn(k: &mut Kernel, name: &str, priority: u8) -> ThreadId {
    k.thread_spawn(ThreadAttr::new(nop).name(name).priority(priority))
        .unwrap()
}

#[test]
fn uncontended_acquire_release() {
    let mut k = kernel();
    let a = spawn(&mut k, "a", 5);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::empty()).unwrap();

    assert_eq!(k.mutex_owner(m).unwrap(), None);
    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));
    assert_eq!(k.mutex_owner(m).unwrap(), Some(a));
    k.mutex_release(m).unwrap();
    assert_eq!(k.mutex_owner(m).unwrap(), None);
}

#[test]
fn non_recursive_reacquire_is_refused() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::empty()).unwrap();

    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));
    assert_eq!(k.mutex_acquire(m, WAIT_FOREVER), Err(Error::Resource));
}

#[test]
fn recursive_acquire_counts_to_the_limit() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::RECURSIVE).unwrap();

    for _ in 0..MUTEX_LOCK_LIMIT {
        assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));
    }
    assert_eq!(k.mutex_acquire(m, 0), Err(Error::Resource));

    // It takes as many releases to unlock.
    for _ in 0..MUTEX_LOCK_LIMIT - 1 {
        k.mutex_release(m).unwrap();
        assert!(k.mutex_owner(m).unwrap().is_some());
    }
    k.mutex_release(m).unwrap();
    assert_eq!(k.mutex_owner(m).unwrap(), None);
}

#[test]
fn release_requires_ownership() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::empty()).unwrap();

    // Releasing an unlocked mutex.
    assert_eq!(k.mutex_release(m), Err(Error::Resource));

    // a acquires; the preempting thread is not the owner.
    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));
    let hi = spawn(&mut k, "hi", 9);
    assert_eq!(k.current_thread(), Some(hi));
    assert_eq!(k.mutex_release(m), Err(Error::Resource));
}

#[test]
fn contended_acquire_transfers_to_the_highest_priority_waiter() {
    let mut k = kernel();
    let owner = spawn(&mut k, "owner", 6);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::empty()).unwrap();
    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));

    // Two contenders block, lower priority first.
    let w1 = spawn(&mut k, "w1", 7);
    assert_eq!(k.current_thread(), Some(w1));
    assert!(k.mutex_acquire(m, WAIT_FOREVER).unwrap().is_pending());
    let w2 = spawn(&mut k, "w2", 9);
    assert_eq!(k.current_thread(), Some(w2));
    assert!(k.mutex_acquire(m, WAIT_FOREVER).unwrap().is_pending());
    assert_eq!(k.current_thread(), Some(owner));

    k.mutex_release(m).unwrap();
    // w2 got ownership and preempted.
    assert_eq!(k.current_thread(), Some(w2));
    assert_eq!(k.take_wakeup(w2), Some(Ok(Wakeup::Unit)));
    assert_eq!(k.mutex_owner(m).unwrap(), Some(w2));
    assert_eq!(k.take_wakeup(w1), None);
}

#[test]
fn acquire_with_timeout_expires() {
    let mut k = kernel();
    spawn(&mut k, "owner", 3);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::empty()).unwrap();
    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));

    let w = spawn(&mut k, "w", 5);
    assert!(k.mutex_acquire(m, 4).unwrap().is_pending());
    for _ in 0..4 {
        k.tick();
    }
    assert_eq!(k.current_thread(), Some(w));
    assert_eq!(k.take_wakeup(w), Some(Err(Error::Timeout)));
    // Ownership never moved.
    assert_ne!(k.mutex_owner(m).unwrap(), Some(w));
}

#[test]
fn priority_inheritance_boosts_and_restores() {
    let mut k = kernel();
    let low = spawn(&mut k, "low", 2);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::PRIO_INHERIT).unwrap();
    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));

    let high = spawn(&mut k, "high", 8);
    assert_eq!(k.current_thread(), Some(high));
    assert!(k.mutex_acquire(m, WAIT_FOREVER).unwrap().is_pending());

    // The owner runs with the waiter's priority.
    assert_eq!(k.current_thread(), Some(low));
    assert_eq!(k.thread_priority(low).unwrap(), (2, 8));

    // A mid-priority thread cannot sneak in ahead of the boosted owner.
    let mid = spawn(&mut k, "mid", 5);
    assert_eq!(k.current_thread(), Some(low));

    k.mutex_release(m).unwrap();
    assert_eq!(k.thread_priority(low).unwrap(), (2, 2));
    assert_eq!(k.current_thread(), Some(high));
    assert_eq!(k.mutex_owner(m).unwrap(), Some(high));
    let _ = mid;
}

#[test]
fn inheritance_tracks_waiter_priority_changes() {
    let mut k = kernel();
    let low = spawn(&mut k, "low", 2);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::PRIO_INHERIT).unwrap();
    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));

    let w = spawn(&mut k, "w", 6);
    assert!(k.mutex_acquire(m, WAIT_FOREVER).unwrap().is_pending());
    assert_eq!(k.thread_priority(low).unwrap(), (2, 6));

    // Raising the blocked waiter raises the owner too.
    k.thread_set_priority(w, 9).unwrap();
    assert_eq!(k.thread_priority(low).unwrap(), (2, 9));
}

#[test]
fn boost_survives_until_the_last_inherit_mutex_is_released() {
    let mut k = kernel();
    let low = spawn(&mut k, "low", 2);
    k.start().unwrap();
    let m1 = k.mutex_new("m1", MutexAttr::PRIO_INHERIT).unwrap();
    let m2 = k.mutex_new("m2", MutexAttr::PRIO_INHERIT).unwrap();
    assert_eq!(k.mutex_acquire(m1, 0), Ok(Wait::Complete(())));
    assert_eq!(k.mutex_acquire(m2, 0), Ok(Wait::Complete(())));

    let w2 = spawn(&mut k, "w2", 4);
    assert!(k.mutex_acquire(m2, WAIT_FOREVER).unwrap().is_pending());
    assert_eq!(k.thread_priority(low).unwrap(), (2, 4));
    spawn(&mut k, "w1", 7);
    assert!(k.mutex_acquire(m1, WAIT_FOREVER).unwrap().is_pending());
    assert_eq!(k.thread_priority(low).unwrap(), (2, 7));

    // Releasing m1 hands it to w1 (which preempts, cleans up, and exits)
    // and drops the boost to the remaining waiter's level.
    k.mutex_release(m1).unwrap();
    k.mutex_release(m1).unwrap();
    k.thread_exit().unwrap();
    assert_eq!(k.current_thread(), Some(low));
    assert_eq!(k.thread_priority(low).unwrap(), (2, 4));

    k.mutex_release(m2).unwrap();
    assert_eq!(k.thread_priority(low).unwrap(), (2, 2));
    assert_eq!(k.current_thread(), Some(w2));
}

#[test]
fn robust_mutex_transfers_on_owner_termination() {
    let mut k = kernel();
    let owner = spawn(&mut k, "owner", 6);
    k.start().unwrap();
    let m = k
        .mutex_new("m", MutexAttr::ROBUST | MutexAttr::PRIO_INHERIT)
        .unwrap();
    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));

    let w = spawn(&mut k, "w", 8);
    assert!(k.mutex_acquire(m, WAIT_FOREVER).unwrap().is_pending());
    assert_eq!(k.current_thread(), Some(owner));

    k.thread_terminate(owner).unwrap();
    assert_eq!(k.current_thread(), Some(w));
    assert_eq!(k.take_wakeup(w), Some(Ok(Wakeup::Unit)));
    assert_eq!(k.mutex_owner(m).unwrap(), Some(w));
}

#[test]
fn non_robust_mutex_is_abandoned_on_owner_termination() {
    let mut k = kernel();
    // Detached, so the control block is reclaimed at termination and the
    // stored owner handle goes stale.
    let owner = k
        .thread_spawn(ThreadAttr::new(nop).name("owner").priority(6).detached())
        .unwrap();
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::empty()).unwrap();
    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));

    let w = spawn(&mut k, "w", 8);
    assert!(k.mutex_acquire(m, WAIT_FOREVER).unwrap().is_pending());
    k.thread_terminate(owner).unwrap();

    // The waiter stays blocked; the mutex reads as locked with no live
    // owner.
    assert_ne!(k.current_thread(), Some(w));
    assert_eq!(k.mutex_owner(m).unwrap(), None);

    // A newcomer blocks too; only deletion gets everyone out.
    let w2 = spawn(&mut k, "w2", 9);
    assert!(k.mutex_acquire(m, WAIT_FOREVER).unwrap().is_pending());
    k.mutex_delete(m).unwrap();
    assert_eq!(k.take_wakeup(w), Some(Err(Error::Resource)));
    assert_eq!(k.take_wakeup(w2), Some(Err(Error::Resource)));
}

#[test]
fn delete_wakes_waiters_and_unboosts_the_owner() {
    let mut k = kernel();
    let low = spawn(&mut k, "low", 2);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::PRIO_INHERIT).unwrap();
    assert_eq!(k.mutex_acquire(m, 0), Ok(Wait::Complete(())));

    let w = spawn(&mut k, "w", 8);
    assert!(k.mutex_acquire(m, WAIT_FOREVER).unwrap().is_pending());
    assert_eq!(k.thread_priority(low).unwrap(), (2, 8));

    k.mutex_delete(m).unwrap();
    assert_eq!(k.take_wakeup(w), Some(Err(Error::Resource)));
    assert_eq!(k.thread_priority(low).unwrap(), (2, 2));
    assert_eq!(k.mutex_acquire(m, 0), Err(Error::BadId));
}

#[test]
fn mutexes_reject_interrupt_context() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    k.start().unwrap();
    let m = k.mutex_new("m", MutexAttr::empty()).unwrap();

    k.interrupt_enter();
    assert_eq!(k.mutex_acquire(m, 0), Err(Error::IsrContext));
    assert_eq!(k.mutex_release(m), Err(Error::IsrContext));
    assert_eq!(
        k.mutex_new("n", MutexAttr::empty()),
        Err(Error::IsrContext)
    );
    k.interrupt_exit().unwrap();
}
