//! Threads
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;
use arrayvec::ArrayString;

use crate::error::{Error, Result, Wait};
use crate::event_flags::{self, WaitOptions};
use crate::kernel::{Kernel, KernelState, Ticks};
use crate::list::Link;
use crate::msgqueue::Message;
use crate::sched::RunState;
use crate::utils::arena::RawHandle;
use crate::utils::atomic;
use crate::wait::{self, WaitKind, Wakeup};
use crate::{list, sched};

/// Maximum length of an object name, in bytes. Longer names are truncated
/// at creation.
pub const NAME_LEN: usize = 16;

/// Written to the lowest word of every thread stack at creation and
/// checked on each switch.
pub(crate) const STACK_WATERMARK: u32 = 0x5AFE_57AC;

/// A handle to a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub(crate) RawHandle);

/// The externally visible lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    /// Exited or terminated, waiting to be joined or detached.
    Terminated,
}

/// Creation attributes for [`Kernel::thread_spawn`].
///
/// ```
/// # use tern_kernel::ThreadAttr;
/// # fn worker(_: usize) {}
/// let attr = ThreadAttr::new(worker).name("worker").priority(8);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr<'a> {
    pub name: &'a str,
    /// 1 (lowest) ..= 255 (highest). 0 is reserved for the idle thread.
    pub priority: u8,
    /// `None` selects [`Config::default_stack_size`](crate::Config).
    pub stack_size: Option<usize>,
    pub detached: bool,
    pub entry: fn(usize),
    pub arg: usize,
}

impl<'a> ThreadAttr<'a> {
    pub fn new(entry: fn(usize)) -> Self {
        Self {
            name: "",
            priority: 1,
            stack_size: None,
            detached: false,
            entry,
            arg: 0,
        }
    }

    pub fn name(self, name: &'a str) -> Self {
        Self { name, ..self }
    }

    pub fn priority(self, priority: u8) -> Self {
        Self { priority, ..self }
    }

    pub fn stack_size(self, stack_size: usize) -> Self {
        Self {
            stack_size: Some(stack_size),
            ..self
        }
    }

    pub fn detached(self) -> Self {
        Self {
            detached: true,
            ..self
        }
    }

    pub fn arg(self, arg: usize) -> Self {
        Self { arg, ..self }
    }
}

/// A point-in-time snapshot returned by [`Kernel::thread_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStatus {
    pub name: ArrayString<NAME_LEN>,
    pub state: ThreadState,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub stack_size: usize,
}

/// *Thread control block* — the state data of a thread.
pub(crate) struct ThreadCb {
    pub name: ArrayString<NAME_LEN>,
    /// This thread's own full handle, so internal bare-index links can be
    /// turned back into public ids.
    pub handle: RawHandle,
    pub state: RunState,
    pub base_priority: u8,
    /// `base_priority`, possibly boosted by priority inheritance. All
    /// ordering decisions use this.
    pub effective_priority: u8,
    /// Ready-list / waiter-queue membership link.
    pub link: Link,
    /// Delay-list / infinite-wait-list membership link.
    pub dlink: Link,
    /// Whether `dlink` is threaded into the (finite) delay list rather
    /// than the infinite-wait list.
    pub timed: bool,
    /// Remaining delta ticks relative to the delay-list predecessor.
    pub delay: Ticks,
    /// Outcome of the last completed wait, until the port (or a test)
    /// collects it with [`Kernel::take_wakeup`].
    pub wakeup: Option<Result<Wakeup>>,
    /// Stored wait condition while blocked on event flags or thread flags.
    pub wait_mask: u32,
    pub wait_options: WaitOptions,
    /// Stashed outgoing message while blocked on a full message queue.
    pub wait_msg: Option<Message>,
    /// Thread flags, settable from interrupt context.
    pub flags: AtomicU32,
    /// Head of the chain of mutexes this thread holds (mutex arena
    /// indices).
    pub held_head: Option<u32>,
    /// The thread blocked joining this one, if any. At most one joiner.
    pub joiner: Option<u32>,
    pub detached: bool,
    pub entry: fn(usize),
    pub arg: usize,
    pub stack: Box<[u8]>,
}

impl ThreadCb {
    pub(crate) fn stack_intact(&self) -> bool {
        self.stack[..4] == STACK_WATERMARK.to_le_bytes()
    }

    #[cfg(test)]
    pub(crate) fn for_test(priority: u8) -> Self {
        fn nop(_: usize) {}
        let mut stack = alloc::vec![0u8; 64].into_boxed_slice();
        stack[..4].copy_from_slice(&STACK_WATERMARK.to_le_bytes());
        Self {
            name: ArrayString::new(),
            handle: RawHandle { index: 0, gen: 0 },
            state: RunState::Ready,
            base_priority: priority,
            effective_priority: priority,
            link: Link::default(),
            dlink: Link::default(),
            timed: false,
            delay: 0,
            wakeup: None,
            wait_mask: 0,
            wait_options: WaitOptions::empty(),
            wait_msg: None,
            flags: AtomicU32::new(0),
            held_head: None,
            joiner: None,
            detached: false,
            entry: nop,
            arg: 0,
            stack,
        }
    }
}

impl fmt::Debug for ThreadCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("name", &&*self.name)
            .field("state", &self.state)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub(crate) fn truncate_name(name: &str) -> ArrayString<NAME_LEN> {
    let mut out = ArrayString::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

/// Thread management and thread-flags services.
impl Kernel {
    /// Create a thread and make it ready.
    ///
    /// The new thread preempts the caller immediately if its priority is
    /// higher. Fails with [`Error::BadParam`] for priority 0 (reserved for
    /// the idle thread) or a stack smaller than the configured minimum.
    pub fn thread_spawn(&mut self, attr: ThreadAttr<'_>) -> Result<ThreadId> {
        self.check_thread_context()?;
        if attr.priority == 0 {
            return Err(Error::BadParam);
        }
        let stack_size = attr.stack_size.unwrap_or(self.cfg.default_stack_size);
        if stack_size < self.cfg.min_stack_size {
            return Err(Error::BadParam);
        }
        let id = self.spawn_raw(
            attr.name,
            attr.priority,
            stack_size,
            attr.entry,
            attr.arg,
            attr.detached,
        );
        self.dispatch(None);
        Ok(id)
    }

    /// Create a thread control block without attribute validation. Also
    /// used for the kernel-owned idle and timer-service threads.
    pub(crate) fn spawn_raw(
        &mut self,
        name: &str,
        priority: u8,
        stack_size: usize,
        entry: fn(usize),
        arg: usize,
        detached: bool,
    ) -> ThreadId {
        let mut stack = alloc::vec![0u8; stack_size.max(4)].into_boxed_slice();
        stack[..4].copy_from_slice(&STACK_WATERMARK.to_le_bytes());
        let cb = ThreadCb {
            name: truncate_name(name),
            handle: RawHandle { index: 0, gen: 0 },
            state: RunState::Ready,
            base_priority: priority,
            effective_priority: priority,
            link: Link::default(),
            dlink: Link::default(),
            timed: false,
            delay: 0,
            wakeup: None,
            wait_mask: 0,
            wait_options: WaitOptions::empty(),
            wait_msg: None,
            flags: AtomicU32::new(0),
            held_head: None,
            joiner: None,
            detached,
            entry,
            arg,
            stack,
        };
        let handle = self.threads.insert(cb);
        let ix = handle.index;
        self.threads.by_index_mut(ix).handle = handle;
        sched::make_ready(&mut self.threads, &mut self.sched, ix);
        log::debug!(
            "spawned thread {:?} ({:?}) priority {}",
            handle,
            name,
            priority
        );
        ThreadId(handle)
    }

    /// Terminate the calling thread.
    pub fn thread_exit(&mut self) -> Result<()> {
        if self.in_interrupt() {
            return Err(Error::IsrContext);
        }
        let cur = self.running_index()?;
        let id = ThreadId(self.threads.by_index(cur).handle);
        self.thread_terminate(id)
    }

    /// Terminate a thread in any state.
    ///
    /// The thread is removed from whatever list it is on. Held robust
    /// mutexes are released with ownership transfer; held non-robust
    /// mutexes are *abandoned* — they stay locked to a dead owner and any
    /// future acquirer blocks until the mutex is deleted. This is a known
    /// hazard carried over deliberately; prefer [`MutexAttr::ROBUST`] for
    /// mutexes a terminatable thread can hold.
    ///
    /// A joiner, if present, is woken; otherwise the thread lingers as a
    /// terminated zombie until joined or detached (unless it was spawned
    /// detached).
    ///
    /// [`MutexAttr::ROBUST`]: crate::MutexAttr::ROBUST
    pub fn thread_terminate(&mut self, id: ThreadId) -> Result<()> {
        self.check_thread_context()?;
        let ix = self.thread_index(id)?;
        if ix == self.idle_ix || ix == self.timer_svc.thread_ix {
            return Err(Error::BadParam);
        }
        match self.threads.by_index(ix).state {
            RunState::Terminated => return Err(Error::Resource),
            RunState::Running => {
                self.sched.running = None;
            }
            RunState::Ready => {
                list::unlink::<list::Membership>(&mut self.threads, &mut self.sched.ready, ix);
            }
            RunState::Blocked(kind) => self.unlink_blocked(ix, kind),
        }
        self.release_held_mutexes(ix);

        let joiner = self.threads.by_index_mut(ix).joiner.take();
        let detached = self.threads.by_index(ix).detached;
        log::debug!("thread {:?} terminated", self.threads.by_index(ix).handle);

        if let Some(j) = joiner {
            wait::unpark(&mut self.threads, &mut self.sched, None, j, Ok(Wakeup::Unit));
        }
        if joiner.is_some() || detached {
            let handle = self.threads.by_index(ix).handle;
            let _ = self.threads.remove(handle);
        } else {
            self.threads.by_index_mut(ix).state = RunState::Terminated;
        }
        self.dispatch(None);
        Ok(())
    }

    /// Wait for a thread to terminate, then release its control block.
    ///
    /// Joining a detached or already-joined thread, and joining with a
    /// zero timeout while the target is still live, fail with
    /// [`Error::Resource`]. Self-join is [`Error::BadParam`].
    pub fn thread_join(&mut self, id: ThreadId, timeout: Ticks) -> Result<Wait<()>> {
        if self.in_interrupt() {
            return Err(Error::IsrContext);
        }
        let cur = self.running_index()?;
        let ix = self.thread_index(id)?;
        if ix == cur || ix == self.idle_ix || ix == self.timer_svc.thread_ix {
            return Err(Error::BadParam);
        }
        {
            let cb = self.threads.by_index(ix);
            if cb.detached || cb.joiner.is_some() {
                return Err(Error::Resource);
            }
            if matches!(cb.state, RunState::Terminated) {
                let handle = cb.handle;
                let _ = self.threads.remove(handle);
                return Ok(Wait::Complete(()));
            }
        }
        if timeout == 0 {
            return Err(Error::Resource);
        }
        self.check_blockable()?;
        self.threads.by_index_mut(ix).joiner = Some(cur);
        wait::park(
            &mut self.threads,
            &mut self.sched,
            None,
            cur,
            WaitKind::Join { target: ix },
            timeout,
        );
        self.dispatch(None);
        Ok(Wait::Pending)
    }

    /// Mark a thread as not joinable. A terminated thread is released
    /// immediately.
    pub fn thread_detach(&mut self, id: ThreadId) -> Result<()> {
        self.check_thread_context()?;
        let ix = self.thread_index(id)?;
        if ix == self.idle_ix || ix == self.timer_svc.thread_ix {
            return Err(Error::BadParam);
        }
        let cb = self.threads.by_index(ix);
        if cb.detached {
            return Err(Error::Resource);
        }
        if matches!(cb.state, RunState::Terminated) {
            let handle = cb.handle;
            let _ = self.threads.remove(handle);
        } else {
            self.threads.by_index_mut(ix).detached = true;
        }
        Ok(())
    }

    /// Change a thread's base priority.
    ///
    /// The effective priority is recomputed (an inheritance boost from a
    /// held mutex is preserved) and the thread is re-sorted in whatever
    /// list it is on, going behind equal-priority threads.
    pub fn thread_set_priority(&mut self, id: ThreadId, priority: u8) -> Result<()> {
        self.check_thread_context()?;
        if priority == 0 {
            return Err(Error::BadParam);
        }
        let ix = self.thread_index(id)?;
        if ix == self.idle_ix {
            return Err(Error::BadParam);
        }
        if matches!(self.threads.by_index(ix).state, RunState::Terminated) {
            return Err(Error::Resource);
        }
        self.threads.by_index_mut(ix).base_priority = priority;
        self.apply_effective_priority(ix);
        self.dispatch(None);
        Ok(())
    }

    /// The thread's `(base, effective)` priority pair.
    pub fn thread_priority(&self, id: ThreadId) -> Result<(u8, u8)> {
        let ix = self.thread_index(id)?;
        let cb = self.threads.by_index(ix);
        Ok((cb.base_priority, cb.effective_priority))
    }

    /// Pass control to the next ready thread of the same priority, if any.
    pub fn thread_yield(&mut self) -> Result<()> {
        if self.in_interrupt() {
            return Err(Error::IsrContext);
        }
        if self.state != KernelState::Running {
            return Ok(());
        }
        let cur = self.running_index()?;
        let priority = self.threads.by_index(cur).effective_priority;
        let head_at_least_equal = self
            .sched
            .ready
            .first
            .map_or(false, |h| self.threads.by_index(h).effective_priority >= priority);
        if head_at_least_equal {
            self.sched.running = None;
            sched::make_ready(&mut self.threads, &mut self.sched, cur);
            self.dispatch(None);
        }
        Ok(())
    }

    /// Sleep for `ticks` tick periods ([`WAIT_FOREVER`] sleeps until
    /// terminated). `thread_delay(0)` returns immediately.
    ///
    /// [`WAIT_FOREVER`]: crate::WAIT_FOREVER
    pub fn thread_delay(&mut self, ticks: Ticks) -> Result<Wait<()>> {
        if self.in_interrupt() {
            return Err(Error::IsrContext);
        }
        let cur = self.running_index()?;
        if ticks == 0 {
            return Ok(Wait::Complete(()));
        }
        self.check_blockable()?;
        wait::park(
            &mut self.threads,
            &mut self.sched,
            None,
            cur,
            WaitKind::Sleep,
            ticks,
        );
        self.dispatch(None);
        Ok(Wait::Pending)
    }

    /// The currently running thread, or `None` before `start` and inside
    /// an interrupt handler.
    pub fn current_thread(&self) -> Option<ThreadId> {
        if self.in_interrupt() {
            return None;
        }
        let ix = self.sched.running?;
        Some(ThreadId(self.threads.by_index(ix).handle))
    }

    pub fn thread_status(&self, id: ThreadId) -> Result<ThreadStatus> {
        let ix = self.thread_index(id)?;
        let cb = self.threads.by_index(ix);
        Ok(ThreadStatus {
            name: cb.name,
            state: cb.state.public(),
            base_priority: cb.base_priority,
            effective_priority: cb.effective_priority,
            stack_size: cb.stack.len(),
        })
    }

    /// OR `bits` into a thread's flags and wake it if its stored wait is
    /// now satisfied. Returns the flags value after the OR.
    ///
    /// Callable from interrupt context; the wake-up is then routed through
    /// the deferred post-processing queue.
    pub fn thread_flags_set(&mut self, id: ThreadId, bits: u32) -> Result<u32> {
        if bits == 0 {
            return Err(Error::BadParam);
        }
        let ix = self.thread_index(id)?;
        if matches!(self.threads.by_index(ix).state, RunState::Terminated) {
            return Err(Error::Resource);
        }
        let after = atomic::set_bits(&self.threads.by_index(ix).flags, bits) | bits;
        if self.in_interrupt() {
            self.deferred_push(crate::deferred::Post::ThreadFlags(id.0));
            return Ok(after);
        }
        self.thread_flags_service(ix);
        self.dispatch(None);
        Ok(after)
    }

    /// Complete a pending thread-flags wait if the thread's flags now
    /// satisfy its stored condition. Shared between the synchronous path
    /// and the deferred-queue drain.
    pub(crate) fn thread_flags_service(&mut self, ix: u32) {
        if !matches!(
            self.threads.by_index(ix).state,
            RunState::Blocked(WaitKind::ThreadFlags)
        ) {
            return;
        }
        let cb = self.threads.by_index(ix);
        if let Some(pre) = event_flags::poll(&cb.flags, cb.wait_mask, cb.wait_options) {
            wait::unpark(
                &mut self.threads,
                &mut self.sched,
                None,
                ix,
                Ok(Wakeup::Flags(pre)),
            );
        }
    }

    /// Wait for the calling thread's own flags to satisfy `mask` under
    /// `options`. On success the matched bits are consumed (unless
    /// [`WaitOptions::NO_CLEAR`]) and the pre-clear value is returned.
    pub fn thread_flags_wait(
        &mut self,
        mask: u32,
        options: WaitOptions,
        timeout: Ticks,
    ) -> Result<Wait<u32>> {
        if mask == 0 {
            return Err(Error::BadParam);
        }
        if self.in_interrupt() {
            return Err(Error::IsrContext);
        }
        let cur = self.running_index()?;
        if let Some(pre) = event_flags::poll(&self.threads.by_index(cur).flags, mask, options) {
            return Ok(Wait::Complete(pre));
        }
        if timeout == 0 {
            return Err(Error::Resource);
        }
        self.check_blockable()?;
        {
            let cb = self.threads.by_index_mut(cur);
            cb.wait_mask = mask;
            cb.wait_options = options;
        }
        wait::park(
            &mut self.threads,
            &mut self.sched,
            None,
            cur,
            WaitKind::ThreadFlags,
            timeout,
        );
        self.dispatch(None);
        Ok(Wait::Pending)
    }
}
