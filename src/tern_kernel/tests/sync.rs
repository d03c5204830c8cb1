//! Semaphores and event flags, including the interrupt-context variants.
use tern_kernel::{
    Config, Error, Kernel, ThreadAttr, ThreadId, Wait, WaitOptions, Wakeup, WAIT_FOREVER,
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
fn semaphore_counts_within_bounds() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    k.start().unwrap();

    assert_eq!(k.semaphore_new("s", 0, 0), Err(Error::BadParam));
    assert_eq!(k.semaphore_new("s", 2, 3), Err(Error::BadParam));

    let s = k.semaphore_new("s", 2, 1).unwrap();
    assert_eq!(k.semaphore_count(s).unwrap(), 1);
    assert_eq!(k.semaphore_acquire(s, 0), Ok(Wait::Complete(())));
    assert_eq!(k.semaphore_acquire(s, 0), Err(Error::Resource));

    k.semaphore_release(s).unwrap();
    k.semaphore_release(s).unwrap();
    assert_eq!(k.semaphore_count(s).unwrap(), 2);
    // Releasing past max is refused.
    assert_eq!(k.semaphore_release(s), Err(Error::Resource));
}

#[test]
fn release_hands_the_token_directly_to_the_waiter() {
    let mut k = kernel();
    let w = spawn(&mut k, "w", 6);
    k.start().unwrap();
    let s = k.semaphore_new("s", 1, 0).unwrap();

    assert!(k.semaphore_acquire(s, WAIT_FOREVER).unwrap().is_pending());
    assert_ne!(k.current_thread(), Some(w));

    // The release bypasses the counter: the count never reads 1.
    k.semaphore_release(s).unwrap();
    assert_eq!(k.semaphore_count(s).unwrap(), 0);
    assert_eq!(k.current_thread(), Some(w));
    assert_eq!(k.take_wakeup(w), Some(Ok(Wakeup::Unit)));
}

#[test]
fn waiters_are_served_in_priority_order() {
    let mut k = kernel();
    let w_mid = spawn(&mut k, "mid", 5);
    k.start().unwrap();
    let s = k.semaphore_new("s", 3, 0).unwrap();

    assert!(k.semaphore_acquire(s, WAIT_FOREVER).unwrap().is_pending());
    let w_hi = spawn(&mut k, "hi", 8);
    assert!(k.semaphore_acquire(s, WAIT_FOREVER).unwrap().is_pending());
    let w_lo = spawn(&mut k, "lo", 3);
    assert!(k.semaphore_acquire(s, WAIT_FOREVER).unwrap().is_pending());

    k.semaphore_release(s).unwrap();
    assert_eq!(k.take_wakeup(w_hi), Some(Ok(Wakeup::Unit)));
    assert_eq!(k.take_wakeup(w_mid), None);

    k.semaphore_release(s).unwrap();
    assert_eq!(k.take_wakeup(w_mid), Some(Ok(Wakeup::Unit)));
    k.semaphore_release(s).unwrap();
    assert_eq!(k.take_wakeup(w_lo), Some(Ok(Wakeup::Unit)));
}

#[test]
fn interrupt_release_arrives_through_the_deferred_queue() {
    let mut k = kernel();
    let w = spawn(&mut k, "w", 6);
    k.start().unwrap();
    let s = k.semaphore_new("s", 1, 0).unwrap();
    assert!(k.semaphore_acquire(s, WAIT_FOREVER).unwrap().is_pending());

    k.interrupt_enter();
    k.semaphore_release(s).unwrap();
    // The token is parked in the counter until the drain.
    assert_eq!(k.semaphore_count(s).unwrap(), 1);
    k.interrupt_exit().unwrap();
    assert_ne!(k.current_thread(), Some(w));

    k.deferred_dispatch();
    assert_eq!(k.semaphore_count(s).unwrap(), 0);
    assert_eq!(k.current_thread(), Some(w));
    assert_eq!(k.take_wakeup(w), Some(Ok(Wakeup::Unit)));
}

#[test]
fn zero_timeout_acquire_works_in_interrupt_context() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    k.start().unwrap();
    let s = k.semaphore_new("s", 1, 1).unwrap();

    k.interrupt_enter();
    assert_eq!(k.semaphore_acquire(s, 0), Ok(Wait::Complete(())));
    assert_eq!(k.semaphore_acquire(s, 0), Err(Error::Resource));
    // A nonzero timeout is a blocking call and is rejected outright.
    assert_eq!(k.semaphore_acquire(s, 1), Err(Error::IsrContext));
    k.interrupt_exit().unwrap();
}

#[test]
fn semaphore_delete_wakes_every_waiter() {
    let mut k = kernel();
    let w1 = spawn(&mut k, "w1", 7);
    k.start().unwrap();
    let s = k.semaphore_new("s", 1, 0).unwrap();
    assert!(k.semaphore_acquire(s, WAIT_FOREVER).unwrap().is_pending());
    let w2 = spawn(&mut k, "w2", 4);
    assert!(k.semaphore_acquire(s, WAIT_FOREVER).unwrap().is_pending());

    k.semaphore_delete(s).unwrap();
    assert_eq!(k.take_wakeup(w1), Some(Err(Error::Resource)));
    assert_eq!(k.take_wakeup(w2), Some(Err(Error::Resource)));
    // The woken threads resume in priority order.
    assert_eq!(k.current_thread(), Some(w1));
    assert_eq!(k.semaphore_count(s), Err(Error::BadId));
}

#[test]
fn event_wait_any_consumes_only_matched_bits() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    k.start().unwrap();
    let f = k.event_flags_new("f").unwrap();

    assert_eq!(k.event_flags_set(f, 0b0110).unwrap(), 0b0110);
    assert_eq!(
        k.event_flags_wait(f, 0b0011, WaitOptions::empty(), 0),
        Ok(Wait::Complete(0b0110))
    );
    assert_eq!(k.event_flags_get(f).unwrap(), 0b0100);
}

#[test]
fn event_wait_all_blocks_until_every_bit() {
    let mut k = kernel();
    let w = spawn(&mut k, "w", 6);
    k.start().unwrap();
    let f = k.event_flags_new("f").unwrap();
    k.event_flags_set(f, 0b001).unwrap();

    assert!(k
        .event_flags_wait(f, 0b011, WaitOptions::ALL, WAIT_FOREVER)
        .unwrap()
        .is_pending());
    k.event_flags_set(f, 0b100).unwrap();
    assert_ne!(k.current_thread(), Some(w));

    k.event_flags_set(f, 0b010).unwrap();
    assert_eq!(k.current_thread(), Some(w));
    assert_eq!(k.take_wakeup(w), Some(Ok(Wakeup::Flags(0b111))));
    // The matched bits were consumed, the rest stay.
    assert_eq!(k.event_flags_get(f).unwrap(), 0b100);
}

#[test]
fn event_no_clear_leaves_flags_for_the_next_waiter() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    k.start().unwrap();
    let f = k.event_flags_new("f").unwrap();
    k.event_flags_set(f, 0b1).unwrap();

    let opts = WaitOptions::NO_CLEAR;
    assert_eq!(k.event_flags_wait(f, 0b1, opts, 0), Ok(Wait::Complete(0b1)));
    assert_eq!(k.event_flags_wait(f, 0b1, opts, 0), Ok(Wait::Complete(0b1)));
    assert_eq!(k.event_flags_get(f).unwrap(), 0b1);

    assert_eq!(k.event_flags_clear(f, 0b1).unwrap(), 0b1);
    assert_eq!(k.event_flags_get(f).unwrap(), 0);
}

#[test]
fn one_set_can_wake_several_waiters_in_priority_order() {
    let mut k = kernel();
    let w_lo = spawn(&mut k, "lo", 3);
    k.start().unwrap();
    let f = k.event_flags_new("f").unwrap();

    let opts = WaitOptions::NO_CLEAR;
    assert!(k.event_flags_wait(f, 0b1, opts, WAIT_FOREVER).unwrap().is_pending());
    let w_hi = spawn(&mut k, "hi", 8);
    assert!(k.event_flags_wait(f, 0b1, opts, WAIT_FOREVER).unwrap().is_pending());

    k.event_flags_set(f, 0b1).unwrap();
    assert_eq!(k.take_wakeup(w_hi), Some(Ok(Wakeup::Flags(0b1))));
    assert_eq!(k.take_wakeup(w_lo), Some(Ok(Wakeup::Flags(0b1))));
    assert_eq!(k.current_thread(), Some(w_hi));
}

#[test]
fn event_set_from_interrupt_context_arrives_deferred() {
    let mut k = kernel();
    let w = spawn(&mut k, "w", 6);
    k.start().unwrap();
    let f = k.event_flags_new("f").unwrap();
    assert!(k
        .event_flags_wait(f, 0b1, WaitOptions::empty(), WAIT_FOREVER)
        .unwrap()
        .is_pending());

    k.interrupt_enter();
    assert_eq!(k.event_flags_set(f, 0b1).unwrap(), 0b1);
    // Zero-timeout polls are allowed in interrupt context. Probe a bit
    // nobody set rather than stealing the blocked waiter's.
    assert_eq!(
        k.event_flags_wait(f, 0b10, WaitOptions::empty(), 0),
        Err(Error::Resource)
    );
    assert_eq!(
        k.event_flags_wait(f, 0b1, WaitOptions::empty(), 5),
        Err(Error::IsrContext)
    );
    k.interrupt_exit().unwrap();

    k.deferred_dispatch();
    assert_eq!(k.current_thread(), Some(w));
    assert_eq!(k.take_wakeup(w), Some(Ok(Wakeup::Flags(0b1))));
}

#[test]
fn event_delete_wakes_waiters() {
    let mut k = kernel();
    let w = spawn(&mut k, "w", 6);
    k.start().unwrap();
    let f = k.event_flags_new("f").unwrap();
    assert!(k
        .event_flags_wait(f, 0b1, WaitOptions::empty(), WAIT_FOREVER)
        .unwrap()
        .is_pending());

    k.event_flags_delete(f).unwrap();
    assert_eq!(k.take_wakeup(w), Some(Err(Error::Resource)));
    assert_eq!(k.event_flags_get(f), Err(Error::BadId));
}
