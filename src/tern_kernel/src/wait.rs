//! Blocking and wake-up plumbing.
//!
//! The kernel never runs user thread code, so a blocking service cannot
//! return its result in-line: it parks the caller with [`park`], dispatches
//! the next runnable thread, and reports `Wait::Pending`. Whoever later
//! completes the wait — a releasing thread, the deferred-queue drain, the
//! tick handler on expiry, or object deletion — finishes the operation on
//! the waiter's behalf with [`unpark`], storing the outcome in the waiter's
//! wakeup slot for the port (or a test) to collect.
use crate::error::{Error, Result};
use crate::kernel::{Ticks, WAIT_FOREVER};
use crate::list::{self, ListHead, Membership, Timing};
use crate::mempool::Block;
use crate::msgqueue::Message;
use crate::sched::{self, RunState, Sched};
use crate::thread::ThreadCb;
use crate::utils::arena::Arena;

/// What a blocked thread is waiting for. The payload is the arena index of
/// the object whose waiter queue the thread is linked into, where there is
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    /// `thread_delay`; expiry is the success path.
    Sleep,
    /// `thread_join`; no waiter queue, the target holds a back-reference.
    Join { target: u32 },
    /// `thread_flags_wait` on the thread's own flags word.
    ThreadFlags,
    Mutex { mutex: u32 },
    Semaphore { sem: u32 },
    EventFlags { flags: u32 },
    /// Blocking allocation from an exhausted memory pool.
    Alloc { pool: u32 },
    QueueGet { queue: u32 },
    QueuePut { queue: u32 },
}

/// The success payload of a completed wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wakeup {
    /// Delay elapsed, join completed, mutex acquired.
    Unit,
    /// Event or thread flags, pre-clear value.
    Flags(u32),
    /// A memory-pool block.
    Block(Block),
    /// A received message.
    Message(Message),
}

/// Park the running thread `ix` into `queue` (by effective priority, FIFO
/// among equals) and the appropriate timing list, leaving the processor
/// idle for the dispatch the caller performs next.
pub(crate) fn park(
    threads: &mut Arena<ThreadCb>,
    sched: &mut Sched,
    queue: Option<&mut ListHead>,
    ix: u32,
    kind: WaitKind,
    timeout: Ticks,
) {
    debug_assert_eq!(sched.running, Some(ix));
    debug_assert_ne!(timeout, 0);
    sched.running = None;
    threads.by_index_mut(ix).state = RunState::Blocked(kind);
    if let Some(queue) = queue {
        list::push_by_priority::<Membership>(threads, queue, ix);
    }
    if timeout == WAIT_FOREVER {
        threads.by_index_mut(ix).timed = false;
        list::push_back::<Timing>(threads, &mut sched.forever, ix);
    } else {
        sched::delay_insert(threads, sched, ix, timeout);
    }
    log::trace!("thread {:?} blocked: {:?}", threads.by_index(ix).handle, kind);
}

/// Remove `ix` from the timing list it is on.
pub(crate) fn unlink_timing(threads: &mut Arena<ThreadCb>, sched: &mut Sched, ix: u32) {
    if threads.by_index(ix).timed {
        sched::delay_remove(threads, sched, ix);
    } else {
        list::unlink::<Timing>(threads, &mut sched.forever, ix);
    }
}

/// Complete a blocked thread's wait: unlink it from its waiter queue (if it
/// is in one) and timing list, store the outcome, and make it ready. The
/// caller performs the dispatch step.
pub(crate) fn unpark(
    threads: &mut Arena<ThreadCb>,
    sched: &mut Sched,
    queue: Option<&mut ListHead>,
    ix: u32,
    outcome: Result<Wakeup>,
) {
    debug_assert!(matches!(threads.by_index(ix).state, RunState::Blocked(_)));
    if let Some(queue) = queue {
        list::unlink::<Membership>(threads, queue, ix);
    }
    unlink_timing(threads, sched, ix);
    threads.by_index_mut(ix).wakeup = Some(outcome);
    sched::make_ready(threads, sched, ix);
}

/// Wake every thread in `queue` with [`Error::Resource`], for object
/// deletion. Waiters enter the ready list in queue (priority) order.
pub(crate) fn wake_all_err(
    threads: &mut Arena<ThreadCb>,
    sched: &mut Sched,
    queue: &mut ListHead,
) {
    while let Some(ix) = queue.first {
        unpark(threads, sched, Some(&mut *queue), ix, Err(Error::Resource));
    }
}
