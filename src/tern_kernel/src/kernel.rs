//! Kernel control.
//!
//! All runtime state lives in one [`Kernel`] value with an explicit
//! [`Kernel::new`] lifecycle; there is no ambient global. The surrounding
//! port layer owns the tick source, the context-switch trap, and the idle
//! loop body; it drives this state machine by calling [`Kernel::tick`]
//! from the tick interrupt, bracketing interrupt handlers with
//! [`Kernel::interrupt_enter`] / [`Kernel::interrupt_exit`], wiring
//! [`Kernel::deferred_dispatch`] to a low-priority interrupt, and patching
//! each completed wait's outcome ([`Kernel::take_wakeup`]) into the resumed
//! call site.
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::deferred::DeferredQueue;
use crate::error::{Error, FatalError, FatalHook, Result};
use crate::event_flags::EventFlagsCb;
use crate::list::{self, Membership};
use crate::mempool::PoolCb;
use crate::msgqueue::QueueCb;
use crate::mutex::{self, MutexCb};
use crate::sched::{self, RunState, Sched};
use crate::semaphore::SemaphoreCb;
use crate::thread::{ThreadCb, ThreadId};
use crate::timer::{TimerCb, TimerSvc};
use crate::utils::arena::Arena;
use crate::utils::atomic;
use crate::wait::{self, WaitKind, Wakeup};

/// The unit of kernel time. One tick is one period of the port's tick
/// interrupt.
pub type Ticks = u32;

/// Timeout value meaning "wait indefinitely".
pub const WAIT_FOREVER: Ticks = u32::MAX;

/// Kernel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// Initialized, not yet started. Objects may be created; nothing runs.
    Ready,
    Running,
    /// Running with preemption suppressed. The tick and the deferred queue
    /// keep working; dispatches are marked pending and replayed on unlock.
    Locked,
    /// The tick source is stopped; time is replayed on `resume`.
    Suspended,
}

/// Kernel-wide configuration, consumed by [`Kernel::new`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Tick frequency in Hz. Informational; the kernel counts ticks.
    pub tick_hz: u32,
    pub default_stack_size: usize,
    pub min_stack_size: usize,
    pub idle_stack_size: usize,
    /// Capacity of the deferred post-processing ring. Must be nonzero.
    pub deferred_capacity: usize,
    /// Round-robin time slice in ticks. 0 disables round robin.
    pub robin_quantum: Ticks,
    pub timer_thread_priority: u8,
    pub timer_thread_stack_size: usize,
    /// Capacity of the timer-service message queue. Must be nonzero.
    pub timer_queue_capacity: usize,
    /// Pre-allocation hint for the per-kind object arenas.
    pub object_capacity: usize,
    pub fatal_hook: Option<FatalHook>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_hz: 1000,
            default_stack_size: 4096,
            min_stack_size: 256,
            idle_stack_size: 256,
            deferred_capacity: 16,
            robin_quantum: 0,
            timer_thread_priority: 240,
            timer_thread_stack_size: 1024,
            timer_queue_capacity: 16,
            object_capacity: 16,
            fatal_hook: None,
        }
    }
}

fn idle_entry(_: usize) {}

fn timer_entry(_: usize) {}

/// The kernel runtime context.
pub struct Kernel {
    pub(crate) cfg: Config,
    pub(crate) state: KernelState,
    /// Depth of `interrupt_enter` nesting. Nonzero means interrupt
    /// context.
    pub(crate) irq_nesting: u32,
    pub(crate) tick: AtomicU32,
    pub(crate) sched: Sched,
    pub(crate) threads: Arena<ThreadCb>,
    pub(crate) mutexes: Arena<MutexCb>,
    pub(crate) semaphores: Arena<SemaphoreCb>,
    pub(crate) event_flags: Arena<EventFlagsCb>,
    pub(crate) pools: Arena<PoolCb>,
    pub(crate) queues: Arena<QueueCb>,
    pub(crate) timers: Arena<TimerCb>,
    pub(crate) timer_svc: TimerSvc,
    pub(crate) deferred: DeferredQueue,
    pub(crate) idle_ix: u32,
}

impl Kernel {
    /// Initialize the kernel: validate the configuration, allocate the
    /// object arenas, and create the idle thread and the timer service.
    ///
    /// All storage the kernel needs is allocated here; the service paths
    /// do not allocate (apart from object creation, which owns its
    /// stacks and pool storage).
    pub fn new(cfg: Config) -> Result<Self> {
        if cfg.min_stack_size < 16
            || cfg.default_stack_size < cfg.min_stack_size
            || cfg.idle_stack_size < 16
            || cfg.deferred_capacity == 0
            || cfg.timer_queue_capacity == 0
            || cfg.timer_thread_priority == 0
        {
            return Err(Error::BadParam);
        }
        let cap = cfg.object_capacity;
        let mut kernel = Self {
            state: KernelState::Ready,
            irq_nesting: 0,
            tick: AtomicU32::new(0),
            sched: Sched::default(),
            threads: Arena::with_capacity(cap),
            mutexes: Arena::with_capacity(cap),
            semaphores: Arena::with_capacity(cap),
            event_flags: Arena::with_capacity(cap),
            pools: Arena::with_capacity(cap),
            queues: Arena::with_capacity(cap),
            timers: Arena::with_capacity(cap),
            timer_svc: TimerSvc::default(),
            deferred: DeferredQueue::new(cfg.deferred_capacity),
            idle_ix: 0,
            cfg,
        };
        let idle = kernel.spawn_raw("idle", 0, cfg.idle_stack_size, idle_entry, 0, true);
        kernel.idle_ix = idle.0.index;
        kernel.create_timer_service(timer_entry)?;
        log::debug!("kernel initialized, tick {} Hz", cfg.tick_hz);
        Ok(kernel)
    }

    /// Start scheduling: dispatch the highest-priority ready thread.
    ///
    /// The port enables its tick source after this returns. Fails with
    /// [`Error::BadState`] unless the kernel is in the `Ready` state and
    /// with [`Error::Resource`] if nothing is runnable.
    pub fn start(&mut self) -> Result<()> {
        if self.state != KernelState::Ready {
            return Err(Error::BadState);
        }
        if self.sched.ready.is_empty() {
            return Err(Error::Resource);
        }
        self.state = KernelState::Running;
        self.dispatch(None);
        log::debug!("kernel started");
        Ok(())
    }

    /// Suppress preemption. Returns whether the kernel was already locked.
    pub fn lock(&mut self) -> Result<bool> {
        self.check_thread_context()?;
        match self.state {
            KernelState::Running => {
                self.state = KernelState::Locked;
                Ok(false)
            }
            KernelState::Locked => Ok(true),
            _ => Err(Error::BadState),
        }
    }

    /// Re-enable preemption, replaying any dispatch suppressed while
    /// locked. Returns whether the kernel was locked.
    pub fn unlock(&mut self) -> Result<bool> {
        self.check_thread_context()?;
        match self.state {
            KernelState::Locked => {
                self.state = KernelState::Running;
                if self.sched.pending_dispatch {
                    self.sched.pending_dispatch = false;
                    self.dispatch(None);
                }
                Ok(true)
            }
            KernelState::Running => Ok(false),
            _ => Err(Error::BadState),
        }
    }

    /// Enter the suspended (tickless) state.
    ///
    /// Returns the number of ticks until the next scheduled wake-up
    /// (thread delay or timer expiry), or [`WAIT_FOREVER`] if there is
    /// none, so the caller can program a low-power sleep of that length.
    /// The port stops the tick source while suspended.
    pub fn suspend(&mut self) -> Result<Ticks> {
        self.check_thread_context()?;
        if self.state != KernelState::Running {
            return Err(Error::BadState);
        }
        self.state = KernelState::Suspended;
        let delay = sched::next_expiry(&self.threads, &self.sched);
        let timer = self.timer_next_expiry();
        let horizon = match (delay, timer) {
            (Some(d), Some(t)) => d.min(t),
            (Some(d), None) => d,
            (None, Some(t)) => t,
            (None, None) => WAIT_FOREVER,
        };
        log::debug!("kernel suspended, next event in {} ticks", horizon);
        Ok(horizon)
    }

    /// Leave the suspended state, first replaying `ticks` ticks of delay
    /// and timer bookkeeping in one go.
    pub fn resume(&mut self, ticks: Ticks) -> Result<()> {
        self.check_thread_context()?;
        if self.state != KernelState::Suspended {
            return Err(Error::BadState);
        }
        for _ in 0..ticks {
            if self.sched.delay.is_empty() && self.timer_svc.active.is_none() {
                break;
            }
            self.tick_bookkeeping();
        }
        self.state = KernelState::Running;
        self.dispatch(None);
        Ok(())
    }

    /// Process one tick: advance the tick counter, expire delays and
    /// timers, and run the round-robin check. Called by the port's tick
    /// interrupt handler; ignored outside the `Running`/`Locked` states.
    pub fn tick(&mut self) {
        if !matches!(self.state, KernelState::Running | KernelState::Locked) {
            return;
        }
        self.tick_bookkeeping();
        self.robin_check();
        self.dispatch(None);
    }

    fn tick_bookkeeping(&mut self) {
        atomic::increment_wrapping(&self.tick);
        sched::delay_tick(&mut self.threads, &mut self.sched);
        while let Some(ix) = sched::pop_expired(&mut self.threads, &mut self.sched) {
            self.expire(ix);
        }
        self.timer_tick();
    }

    fn robin_check(&mut self) {
        if self.cfg.robin_quantum == 0 || self.state != KernelState::Running {
            return;
        }
        let r = match self.sched.running {
            Some(r) => r,
            None => return,
        };
        if self.sched.robin_ix == Some(r) {
            self.sched.robin_ticks += 1;
        } else {
            self.sched.robin_ix = Some(r);
            self.sched.robin_ticks = 1;
        }
        if self.sched.robin_ticks < self.cfg.robin_quantum {
            return;
        }
        let priority = self.threads.by_index(r).effective_priority;
        let peer_ready = self
            .sched
            .ready
            .first
            .map_or(false, |h| self.threads.by_index(h).effective_priority == priority);
        if peer_ready {
            self.sched.running = None;
            sched::make_ready(&mut self.threads, &mut self.sched, r);
            self.sched.robin_ticks = 0;
        }
    }

    /// Mark the beginning of an interrupt handler. Nestable.
    pub fn interrupt_enter(&mut self) {
        self.irq_nesting += 1;
    }

    /// Mark the end of an interrupt handler.
    pub fn interrupt_exit(&mut self) -> Result<()> {
        if self.irq_nesting == 0 {
            return Err(Error::BadState);
        }
        self.irq_nesting -= 1;
        Ok(())
    }

    #[inline]
    pub(crate) fn in_interrupt(&self) -> bool {
        self.irq_nesting > 0
    }

    /// Reject interrupt context outright, for services with no
    /// interrupt-context variant.
    pub(crate) fn check_thread_context(&self) -> Result<()> {
        if self.in_interrupt() {
            Err(Error::IsrContext)
        } else {
            Ok(())
        }
    }

    /// Gate for the park path of a blocking service: blocking with the
    /// scheduler locked would never resume the caller.
    pub(crate) fn check_blockable(&self) -> Result<()> {
        if self.state == KernelState::Locked {
            Err(Error::BadState)
        } else {
            Ok(())
        }
    }

    /// The running thread's arena index, or [`Error::BadState`] before
    /// `start`.
    pub(crate) fn running_index(&self) -> Result<u32> {
        self.sched.running.ok_or(Error::BadState)
    }

    pub(crate) fn thread_index(&self, id: ThreadId) -> Result<u32> {
        self.threads.get(id.0).map(|_| id.0.index).ok_or(Error::BadId)
    }

    /// One dispatch step, gated on the kernel state. While locked, the
    /// step is recorded as pending and replayed by `unlock`.
    pub(crate) fn dispatch(&mut self, candidate: Option<u32>) {
        match self.state {
            KernelState::Running => {
                if let Some(fatal) = sched::dispatch(&mut self.threads, &mut self.sched, candidate)
                {
                    self.fatal(fatal);
                }
            }
            KernelState::Locked => {
                if let Some(c) = candidate {
                    sched::make_ready(&mut self.threads, &mut self.sched, c);
                }
                self.sched.pending_dispatch = true;
            }
            _ => {
                if let Some(c) = candidate {
                    sched::make_ready(&mut self.threads, &mut self.sched, c);
                }
            }
        }
    }

    /// A finite wait expired. The thread is already off the delay list.
    fn expire(&mut self, ix: u32) {
        let kind = match self.threads.by_index(ix).state {
            RunState::Blocked(kind) => kind,
            _ => return,
        };
        self.detach_wait_object(ix, kind);
        // Delay expiry is the success path of `thread_delay`; everything
        // else timed out.
        let outcome = match kind {
            WaitKind::Sleep => Ok(Wakeup::Unit),
            _ => Err(Error::Timeout),
        };
        self.threads.by_index_mut(ix).wakeup = Some(outcome);
        sched::make_ready(&mut self.threads, &mut self.sched, ix);
    }

    /// Unlink a blocked thread from its wait object: the object's waiter
    /// queue, the stashed message of a queue-put wait, the joiner
    /// back-reference, and the priority bookkeeping of a mutex wait.
    pub(crate) fn detach_wait_object(&mut self, ix: u32, kind: WaitKind) {
        match kind {
            WaitKind::Sleep | WaitKind::ThreadFlags => {}
            WaitKind::Join { target } => {
                self.threads.by_index_mut(target).joiner = None;
            }
            WaitKind::Mutex { mutex } => {
                list::unlink::<Membership>(
                    &mut self.threads,
                    &mut self.mutexes.by_index_mut(mutex).wait_queue,
                    ix,
                );
                // A departing waiter may lower the owner's inherited
                // priority.
                if let Some(owner) = mutex::live_owner(&self.threads, &self.mutexes, mutex) {
                    self.apply_effective_priority(owner);
                }
            }
            WaitKind::Semaphore { sem } => {
                list::unlink::<Membership>(
                    &mut self.threads,
                    &mut self.semaphores.by_index_mut(sem).wait_queue,
                    ix,
                );
            }
            WaitKind::EventFlags { flags } => {
                list::unlink::<Membership>(
                    &mut self.threads,
                    &mut self.event_flags.by_index_mut(flags).wait_queue,
                    ix,
                );
            }
            WaitKind::Alloc { pool } => {
                list::unlink::<Membership>(
                    &mut self.threads,
                    &mut self.pools.by_index_mut(pool).wait_queue,
                    ix,
                );
            }
            WaitKind::QueueGet { queue } => {
                list::unlink::<Membership>(
                    &mut self.threads,
                    &mut self.queues.by_index_mut(queue).wait_queue,
                    ix,
                );
            }
            WaitKind::QueuePut { queue } => {
                list::unlink::<Membership>(
                    &mut self.threads,
                    &mut self.queues.by_index_mut(queue).wait_queue,
                    ix,
                );
                self.threads.by_index_mut(ix).wait_msg = None;
            }
        }
    }

    /// Fully unlink a blocked thread (wait object and timing list) without
    /// waking it. Used by termination.
    pub(crate) fn unlink_blocked(&mut self, ix: u32, kind: WaitKind) {
        self.detach_wait_object(ix, kind);
        wait::unlink_timing(&mut self.threads, &mut self.sched, ix);
    }

    /// Recompute a thread's effective priority from its base priority and
    /// the inheritance boost of its held mutexes, then re-sort it in
    /// whatever list it is on. Propagates one level to the owner of the
    /// mutex the thread is blocked on, if any.
    pub(crate) fn apply_effective_priority(&mut self, ix: u32) {
        let base = self.threads.by_index(ix).base_priority;
        let boost = mutex::inherited_boost(&self.threads, &self.mutexes, ix);
        let effective = base.max(boost);
        if effective == self.threads.by_index(ix).effective_priority {
            return;
        }
        self.threads.by_index_mut(ix).effective_priority = effective;
        self.reorder_in_place(ix);
        if let RunState::Blocked(WaitKind::Mutex { mutex }) = self.threads.by_index(ix).state {
            mutex::boost_owner(self, mutex);
        }
    }

    /// Raise a thread's effective priority to at least `floor` and re-sort
    /// it. No propagation; inheritance is single-level.
    pub(crate) fn raise_effective_priority(&mut self, ix: u32, floor: u8) {
        if self.threads.by_index(ix).effective_priority >= floor {
            return;
        }
        self.threads.by_index_mut(ix).effective_priority = floor;
        self.reorder_in_place(ix);
    }

    /// Re-sort a thread in the list its state says it is on.
    pub(crate) fn reorder_in_place(&mut self, ix: u32) {
        match self.threads.by_index(ix).state {
            RunState::Ready => {
                list::reorder::<Membership>(&mut self.threads, &mut self.sched.ready, ix);
            }
            RunState::Blocked(kind) => match kind {
                WaitKind::Sleep | WaitKind::Join { .. } | WaitKind::ThreadFlags => {}
                WaitKind::Mutex { mutex } => {
                    list::reorder::<Membership>(
                        &mut self.threads,
                        &mut self.mutexes.by_index_mut(mutex).wait_queue,
                        ix,
                    );
                }
                WaitKind::Semaphore { sem } => {
                    list::reorder::<Membership>(
                        &mut self.threads,
                        &mut self.semaphores.by_index_mut(sem).wait_queue,
                        ix,
                    );
                }
                WaitKind::EventFlags { flags } => {
                    list::reorder::<Membership>(
                        &mut self.threads,
                        &mut self.event_flags.by_index_mut(flags).wait_queue,
                        ix,
                    );
                }
                WaitKind::Alloc { pool } => {
                    list::reorder::<Membership>(
                        &mut self.threads,
                        &mut self.pools.by_index_mut(pool).wait_queue,
                        ix,
                    );
                }
                WaitKind::QueueGet { queue } | WaitKind::QueuePut { queue } => {
                    list::reorder::<Membership>(
                        &mut self.threads,
                        &mut self.queues.by_index_mut(queue).wait_queue,
                        ix,
                    );
                }
            },
            RunState::Running | RunState::Terminated => {}
        }
    }

    /// Collect the outcome of a thread's last completed wait.
    ///
    /// A port calls this when resuming a thread whose service call
    /// reported `Wait::Pending`, and patches the value into the resumed
    /// call site.
    pub fn take_wakeup(&mut self, id: ThreadId) -> Option<Result<Wakeup>> {
        let ix = self.thread_index(id).ok()?;
        self.threads.by_index_mut(ix).wakeup.take()
    }

    /// Report a fatal condition through the configured hook.
    pub(crate) fn fatal(&mut self, error: FatalError) {
        log::error!("fatal: {:?}", error);
        if let Some(hook) = self.cfg.fatal_hook {
            hook(error);
        }
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Ticks elapsed since `start`, wrapping.
    pub fn tick_count(&self) -> Ticks {
        self.tick.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("state", &self.state)
            .field("tick", &self.tick_count())
            .field("running", &self.sched.running)
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}
