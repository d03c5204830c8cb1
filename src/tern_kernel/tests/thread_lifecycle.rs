//! Thread creation, termination, join/detach, priorities, thread flags.
use tern_kernel::{
    Config, Error, Kernel, ThreadAttr, ThreadId, ThreadState, Wait, WaitOptions, Wakeup,
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
fn spawn_validates_priority_and_stack() {
    let mut k = kernel();
    assert_eq!(
        k.thread_spawn(ThreadAttr::new(nop).priority(0)),
        Err(Error::BadParam)
    );
    assert_eq!(
        k.thread_spawn(ThreadAttr::new(nop).priority(1).stack_size(8)),
        Err(Error::BadParam)
    );
}

#[test]
fn status_reports_name_and_truncates_it() {
    let mut k = kernel();
    let id = k
        .thread_spawn(
            ThreadAttr::new(nop)
                .name("a-name-well-beyond-sixteen-bytes")
                .priority(4)
                .stack_size(512),
        )
        .unwrap();
    let status = k.thread_status(id).unwrap();
    assert_eq!(&*status.name, "a-name-well-beyo");
    assert_eq!(status.state, ThreadState::Ready);
    assert_eq!(status.base_priority, 4);
    assert_eq!(status.stack_size, 512);
}

#[test]
fn join_wakes_when_the_target_exits() {
    let mut k = kernel();
    let a = spawn(&mut k, "a", 5);
    let b = spawn(&mut k, "b", 3);
    k.start().unwrap();

    // a joins b, blocks; b becomes the running thread and exits.
    assert!(k.thread_join(b, WAIT_FOREVER).unwrap().is_pending());
    assert_eq!(k.current_thread(), Some(b));
    k.thread_exit().unwrap();

    assert_eq!(k.current_thread(), Some(a));
    assert_eq!(k.take_wakeup(a), Some(Ok(Wakeup::Unit)));
    // The control block was reclaimed by the join.
    assert_eq!(k.thread_status(b), Err(Error::BadId));
}

#[test]
fn join_rejects_self_detached_and_second_joiner() {
    let mut k = kernel();
    let a = spawn(&mut k, "a", 5);
    let d = k
        .thread_spawn(ThreadAttr::new(nop).name("d").priority(3).detached())
        .unwrap();
    k.start().unwrap();

    assert_eq!(k.thread_join(a, WAIT_FOREVER), Err(Error::BadParam));
    assert_eq!(k.thread_join(d, WAIT_FOREVER), Err(Error::Resource));

    // A zero-timeout join of a live thread does not block.
    let b = spawn(&mut k, "b", 3);
    assert_eq!(k.thread_join(b, 0), Err(Error::Resource));
}

#[test]
fn join_times_out() {
    let mut k = kernel();
    let a = spawn(&mut k, "a", 5);
    let b = spawn(&mut k, "b", 3);
    k.start().unwrap();

    assert!(k.thread_join(b, 2).unwrap().is_pending());
    k.tick();
    k.tick();
    assert_eq!(k.current_thread(), Some(a));
    assert_eq!(k.take_wakeup(a), Some(Err(Error::Timeout)));
    // b is unaffected and can still be joined later.
    assert_eq!(k.thread_status(b).unwrap().state, ThreadState::Running);
}

#[test]
fn terminated_thread_lingers_until_joined() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    let b = spawn(&mut k, "b", 3);
    k.start().unwrap();

    k.thread_terminate(b).unwrap();
    assert_eq!(k.thread_status(b).unwrap().state, ThreadState::Terminated);
    assert_eq!(k.thread_terminate(b), Err(Error::Resource));

    // Joining a zombie completes immediately and frees the slot.
    assert_eq!(k.thread_join(b, 0), Ok(Wait::Complete(())));
    assert_eq!(k.thread_status(b), Err(Error::BadId));
}

#[test]
fn detach_releases_a_zombie_and_future_corpses() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    let b = spawn(&mut k, "b", 3);
    let c = spawn(&mut k, "c", 3);
    k.start().unwrap();

    k.thread_terminate(b).unwrap();
    k.thread_detach(b).unwrap();
    assert_eq!(k.thread_status(b), Err(Error::BadId));

    // Detach first, terminate later: the slot goes away at termination.
    k.thread_detach(c).unwrap();
    assert_eq!(k.thread_detach(c), Err(Error::Resource));
    k.thread_terminate(c).unwrap();
    assert_eq!(k.thread_status(c), Err(Error::BadId));
}

#[test]
fn terminating_a_blocked_thread_unlinks_it() {
    let mut k = kernel();
    spawn(&mut k, "a", 5);
    let b = spawn(&mut k, "b", 7);
    k.start().unwrap();

    // b (running, higher priority) goes to sleep; a runs and kills it.
    assert!(k.thread_delay(100).unwrap().is_pending());
    k.thread_terminate(b).unwrap();

    // The delay list no longer contains b; ticking past its expiry is
    // uneventful.
    for _ in 0..101 {
        k.tick();
    }
    assert_eq!(k.thread_status(b).unwrap().state, ThreadState::Terminated);
    assert_eq!(k.take_wakeup(b), None);
}

#[test]
fn set_priority_preempts_and_reorders() {
    let mut k = kernel();
    let a = spawn(&mut k, "a", 5);
    let b = spawn(&mut k, "b", 3);
    k.start().unwrap();
    assert_eq!(k.current_thread(), Some(a));

    k.thread_set_priority(b, 8).unwrap();
    assert_eq!(k.current_thread(), Some(b));
    assert_eq!(k.thread_priority(b).unwrap(), (8, 8));

    // Dropping below a ready thread gives up the processor.
    k.thread_set_priority(b, 2).unwrap();
    assert_eq!(k.current_thread(), Some(a));
    assert_eq!(k.thread_set_priority(b, 0), Err(Error::BadParam));
}

#[test]
fn thread_flags_wake_a_stored_wait() {
    let mut k = kernel();
    let a = spawn(&mut k, "a", 5);
    k.start().unwrap();

    // Flags set before the wait satisfy it immediately.
    assert_eq!(k.thread_flags_set(a, 0b01).unwrap(), 0b01);
    assert_eq!(
        k.thread_flags_wait(0b01, WaitOptions::empty(), 0),
        Ok(Wait::Complete(0b01))
    );

    // waitAll blocks until every bit arrives.
    assert!(k
        .thread_flags_wait(0b110, WaitOptions::ALL, WAIT_FOREVER)
        .unwrap()
        .is_pending());
    k.thread_flags_set(a, 0b010).unwrap();
    assert_ne!(k.current_thread(), Some(a));
    k.thread_flags_set(a, 0b100).unwrap();
    assert_eq!(k.current_thread(), Some(a));
    assert_eq!(k.take_wakeup(a), Some(Ok(Wakeup::Flags(0b110))));
}

#[test]
fn thread_flags_from_interrupt_context_arrive_deferred() {
    let mut k = kernel();
    let a = spawn(&mut k, "a", 5);
    k.start().unwrap();

    assert!(k
        .thread_flags_wait(0b11, WaitOptions::ALL, WAIT_FOREVER)
        .unwrap()
        .is_pending());

    k.interrupt_enter();
    assert_eq!(k.thread_flags_set(a, 0b01).unwrap(), 0b01);
    assert_eq!(k.thread_flags_set(a, 0b10).unwrap(), 0b11);
    assert_eq!(k.current_thread(), None);
    k.interrupt_exit().unwrap();

    // Nothing happens until the deferred drain runs.
    assert_ne!(k.current_thread(), Some(a));
    k.deferred_dispatch();
    assert_eq!(k.current_thread(), Some(a));
    assert_eq!(k.take_wakeup(a), Some(Ok(Wakeup::Flags(0b11))));
}

#[test]
fn flag_wait_times_out_without_consuming() {
    let mut k = kernel();
    let a = spawn(&mut k, "a", 5);
    k.start().unwrap();

    assert!(k
        .thread_flags_wait(0b100, WaitOptions::empty(), 2)
        .unwrap()
        .is_pending());
    k.thread_flags_set(a, 0b001).unwrap();
    k.tick();
    k.tick();
    assert_eq!(k.take_wakeup(a), Some(Err(Error::Timeout)));

    // The unrelated bit set meanwhile is still there.
    assert_eq!(
        k.thread_flags_wait(0b001, WaitOptions::empty(), 0),
        Ok(Wait::Complete(0b001))
    );
}
