//! Thread scheduler.
//!
//! The scheduler owns the ready list, the two timing lists, and the
//! round-robin bookkeeping. The routines here are free functions over
//! disjoint [`Kernel`](crate::Kernel) fields so subsystems can combine
//! them with a borrow of their own control block in a single expression.
//!
//! The delay list is delta-encoded: each thread stores the tick count
//! relative to its predecessor, so the per-tick work is a single decrement
//! of the head's delta regardless of how many threads are sleeping.
use crate::error::FatalError;
use crate::kernel::Ticks;
use crate::list::{self, ListHead, Membership, Timing};
use crate::thread::{ThreadCb, ThreadId, ThreadState};
use crate::utils::arena::Arena;
use crate::wait::WaitKind;

/// The scheduling state of a thread, including the wait detail the public
/// [`ThreadState`] hides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Ready,
    Running,
    Blocked(WaitKind),
    Terminated,
}

impl RunState {
    pub fn public(&self) -> ThreadState {
        match self {
            Self::Ready => ThreadState::Ready,
            Self::Running => ThreadState::Running,
            Self::Blocked(_) => ThreadState::Blocked,
            Self::Terminated => ThreadState::Terminated,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Sched {
    /// The one running thread. `None` before `start`, transiently `None`
    /// inside a service while the previous runner is parked.
    pub running: Option<u32>,
    /// Threads eligible to run, descending effective priority, FIFO among
    /// equals.
    pub ready: ListHead,
    /// Finite waits, delta-encoded.
    pub delay: ListHead,
    /// Infinite waits. Never ticked; threads leave it only by being woken
    /// or terminated.
    pub forever: ListHead,
    /// A dispatch was suppressed while the kernel was locked and must be
    /// replayed on unlock.
    pub pending_dispatch: bool,
    /// Round robin: the thread observed running at the last tick and for
    /// how many consecutive ticks.
    pub robin_ix: Option<u32>,
    pub robin_ticks: Ticks,
}

/// Make `ix` ready and enqueue it behind equal-priority threads.
pub(crate) fn make_ready(threads: &mut Arena<ThreadCb>, sched: &mut Sched, ix: u32) {
    threads.by_index_mut(ix).state = RunState::Ready;
    list::push_by_priority::<Membership>(threads, &mut sched.ready, ix);
}

/// Switch to `ix`, which must not be on any list. Returns a fatal report
/// if a stack watermark check fails.
fn switch_to(threads: &mut Arena<ThreadCb>, sched: &mut Sched, ix: u32) -> Option<FatalError> {
    let cb = threads.by_index_mut(ix);
    cb.state = RunState::Running;
    sched.running = Some(ix);
    sched.robin_ix = Some(ix);
    sched.robin_ticks = 0;
    log::trace!(
        "dispatch -> {:?} ({:?}) priority {}",
        cb.handle,
        &*cb.name,
        cb.effective_priority
    );
    if !cb.stack_intact() {
        return Some(FatalError::StackOverflow(ThreadId(cb.handle)));
    }
    None
}

/// One dispatch step.
///
/// With a candidate: the candidate preempts the running thread only if its
/// effective priority is strictly higher; otherwise it is enqueued ready.
/// Without one: the ready-list head preempts under the same condition, or
/// simply starts running if nothing is running.
///
/// The caller is responsible for the kernel-state gate (no dispatch while
/// locked or before start).
pub(crate) fn dispatch(
    threads: &mut Arena<ThreadCb>,
    sched: &mut Sched,
    candidate: Option<u32>,
) -> Option<FatalError> {
    if let Some(c) = candidate {
        list::push_by_priority::<Membership>(threads, &mut sched.ready, c);
        threads.by_index_mut(c).state = RunState::Ready;
    }
    let head = match sched.ready.first {
        Some(h) => h,
        None => return None,
    };
    match sched.running {
        None => {
            list::unlink::<Membership>(threads, &mut sched.ready, head);
            switch_to(threads, sched, head)
        }
        Some(r) => {
            if threads.by_index(head).effective_priority <= threads.by_index(r).effective_priority
            {
                return None;
            }
            let mut fatal = if threads.by_index(r).stack_intact() {
                None
            } else {
                Some(FatalError::StackOverflow(ThreadId(threads.by_index(r).handle)))
            };
            sched.running = None;
            make_ready(threads, sched, r);
            list::unlink::<Membership>(threads, &mut sched.ready, head);
            fatal = switch_to(threads, sched, head).or(fatal);
            fatal
        }
    }
}

/// Insert `ix` into the delay list `ticks` from now, maintaining the delta
/// encoding.
pub(crate) fn delay_insert(
    threads: &mut Arena<ThreadCb>,
    sched: &mut Sched,
    ix: u32,
    ticks: Ticks,
) {
    let mut remaining = ticks;
    let mut pos = sched.delay.first;
    while let Some(p) = pos {
        let delta = threads.by_index(p).delay;
        if remaining < delta {
            threads.by_index_mut(p).delay = delta - remaining;
            break;
        }
        remaining -= delta;
        pos = threads.by_index(p).dlink.next;
    }
    {
        let cb = threads.by_index_mut(ix);
        cb.timed = true;
        cb.delay = remaining;
    }
    list::insert_before::<Timing>(threads, &mut sched.delay, pos, ix);
}

/// Remove `ix` from the delay list, folding its delta into the successor.
pub(crate) fn delay_remove(threads: &mut Arena<ThreadCb>, sched: &mut Sched, ix: u32) {
    let delta = threads.by_index(ix).delay;
    if let Some(next) = threads.by_index(ix).dlink.next {
        threads.by_index_mut(next).delay += delta;
    }
    list::unlink::<Timing>(threads, &mut sched.delay, ix);
    threads.by_index_mut(ix).timed = false;
}

/// Advance the delay list by one tick: decrement the head's delta.
pub(crate) fn delay_tick(threads: &mut Arena<ThreadCb>, sched: &mut Sched) {
    if let Some(head) = sched.delay.first {
        let cb = threads.by_index_mut(head);
        cb.delay = cb.delay.saturating_sub(1);
    }
}

/// Pop the next expired thread, if any. Called in a loop after
/// [`delay_tick`] since several threads may share an expiry tick.
pub(crate) fn pop_expired(threads: &mut Arena<ThreadCb>, sched: &mut Sched) -> Option<u32> {
    let head = sched.delay.first?;
    if threads.by_index(head).delay != 0 {
        return None;
    }
    list::unlink::<Timing>(threads, &mut sched.delay, head);
    threads.by_index_mut(head).timed = false;
    Some(head)
}

/// Ticks until the next delay-list expiry, for `suspend`'s low-power
/// report. `None` when nothing is sleeping with a finite timeout.
pub(crate) fn next_expiry(threads: &Arena<ThreadCb>, sched: &Sched) -> Option<Ticks> {
    sched.delay.first.map(|h| threads.by_index(h).delay)
}
