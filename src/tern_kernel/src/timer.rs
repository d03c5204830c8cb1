//! Software timers.
//!
//! Active timers sit on a singly-linked list sorted by absolute expiry,
//! stored as deltas relative to each predecessor, so the tick handler
//! decrements only the head. An expiring timer is never invoked in
//! interrupt context: its handle is posted as an 8-byte message to the
//! kernel-owned timer-service queue, and the dedicated service thread
//! invokes the callback in thread context. [`Kernel::run_timer_callbacks`]
//! is that thread's loop body; the port calls it whenever the service
//! thread is scheduled, and tests call it directly.
use core::fmt;

use alloc::vec::Vec;
use arrayvec::ArrayString;

use crate::error::{Error, FatalError, Result};
use crate::kernel::{Kernel, Ticks};
use crate::list::{self, Membership, Timing};
use crate::msgqueue::Message;
use crate::sched::RunState;
use crate::thread::{self, NAME_LEN};
use crate::utils::arena::{Arena, RawHandle};
use crate::wait::WaitKind;

/// A handle to a software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) RawHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Fires once, then reports not-running.
    OneShot,
    /// Re-arms itself with its period after each firing.
    Periodic,
}

/// *Timer control block* — the state data of a software timer.
pub(crate) struct TimerCb {
    pub name: ArrayString<NAME_LEN>,
    pub handle: RawHandle,
    pub ty: TimerType,
    pub running: bool,
    /// Next timer in the active list.
    pub next: Option<u32>,
    /// Ticks remaining relative to the active-list predecessor.
    pub delta: Ticks,
    /// The interval `timer_start` armed, reused as the reload period.
    pub period: Ticks,
    pub callback: fn(usize),
    pub arg: usize,
}

impl fmt::Debug for TimerCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("name", &&*self.name)
            .field("ty", &self.ty)
            .field("running", &self.running)
            .field("delta", &self.delta)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

/// Timer-service bookkeeping: the active list head and the kernel-owned
/// service thread and queue.
#[derive(Debug, Default)]
pub(crate) struct TimerSvc {
    pub active: Option<u32>,
    pub queue_ix: u32,
    pub thread_ix: u32,
}

fn active_insert(timers: &mut Arena<TimerCb>, head: &mut Option<u32>, ix: u32, ticks: Ticks) {
    let mut remaining = ticks;
    let mut prev: Option<u32> = None;
    let mut pos = *head;
    while let Some(p) = pos {
        let delta = timers.by_index(p).delta;
        if remaining < delta {
            timers.by_index_mut(p).delta = delta - remaining;
            break;
        }
        remaining -= delta;
        prev = pos;
        pos = timers.by_index(p).next;
    }
    {
        let cb = timers.by_index_mut(ix);
        cb.delta = remaining;
        cb.next = pos;
    }
    match prev {
        Some(p) => timers.by_index_mut(p).next = Some(ix),
        None => *head = Some(ix),
    }
}

fn active_remove(timers: &mut Arena<TimerCb>, head: &mut Option<u32>, ix: u32) {
    let mut prev: Option<u32> = None;
    let mut pos = *head;
    while let Some(p) = pos {
        if p == ix {
            break;
        }
        prev = pos;
        pos = timers.by_index(p).next;
    }
    let next = timers.by_index(ix).next;
    if let Some(n) = next {
        timers.by_index_mut(n).delta += timers.by_index(ix).delta;
    }
    match prev {
        Some(p) => timers.by_index_mut(p).next = next,
        None => *head = next,
    }
    timers.by_index_mut(ix).next = None;
}

fn encode_notice(handle: RawHandle) -> Message {
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&handle.index.to_le_bytes());
    data[4..].copy_from_slice(&handle.gen.to_le_bytes());
    Message::new(0, &data[..])
}

fn decode_notice(msg: &Message) -> Option<RawHandle> {
    if msg.data.len() != 8 {
        return None;
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&msg.data[..4]);
    let index = u32::from_le_bytes(word);
    word.copy_from_slice(&msg.data[4..]);
    let gen = u32::from_le_bytes(word);
    Some(RawHandle { index, gen })
}

/// Timer services.
impl Kernel {
    fn timer_index(&self, id: TimerId) -> Result<u32> {
        self.timers.get(id.0).map(|_| id.0.index).ok_or(Error::BadId)
    }

    /// Create the timer-service queue and thread. Called once from
    /// [`Kernel::new`].
    pub(crate) fn create_timer_service(&mut self, entry: fn(usize)) -> Result<()> {
        let queue = self.msgqueue_new_raw("tmr svc", 8, self.cfg.timer_queue_capacity as u32);
        let thread = self.spawn_raw(
            "tmr svc",
            self.cfg.timer_thread_priority,
            self.cfg.timer_thread_stack_size,
            entry,
            0,
            true,
        );
        self.timer_svc.queue_ix = self.queue_index(queue)?;
        self.timer_svc.thread_ix = thread.0.index;
        self.park_timer_thread();
        Ok(())
    }

    /// Block the service thread on its queue, the state it idles in.
    fn park_timer_thread(&mut self) {
        let t = self.timer_svc.thread_ix;
        let q = self.timer_svc.queue_ix;
        match self.threads.by_index(t).state {
            RunState::Running => self.sched.running = None,
            RunState::Ready => {
                list::unlink::<Membership>(&mut self.threads, &mut self.sched.ready, t);
            }
            _ => return,
        }
        self.threads.by_index_mut(t).state = RunState::Blocked(WaitKind::QueueGet { queue: q });
        list::push_by_priority::<Membership>(
            &mut self.threads,
            &mut self.queues.by_index_mut(q).wait_queue,
            t,
        );
        self.threads.by_index_mut(t).timed = false;
        list::push_back::<Timing>(&mut self.threads, &mut self.sched.forever, t);
    }

    /// Create a timer in the stopped state.
    pub fn timer_new(
        &mut self,
        name: &str,
        ty: TimerType,
        callback: fn(usize),
        arg: usize,
    ) -> Result<TimerId> {
        self.check_thread_context()?;
        let handle = self.timers.insert(TimerCb {
            name: thread::truncate_name(name),
            handle: RawHandle { index: 0, gen: 0 },
            ty,
            running: false,
            next: None,
            delta: 0,
            period: 0,
            callback,
            arg,
        });
        self.timers.by_index_mut(handle.index).handle = handle;
        log::debug!("created {:?} timer {:?} ({:?})", ty, handle, name);
        Ok(TimerId(handle))
    }

    /// Arm a timer to fire `ticks` from now (the reload period of a
    /// periodic timer). Starting a running timer re-arms it from now.
    pub fn timer_start(&mut self, id: TimerId, ticks: Ticks) -> Result<()> {
        self.check_thread_context()?;
        if ticks == 0 {
            return Err(Error::BadParam);
        }
        let ix = self.timer_index(id)?;
        if self.timers.by_index(ix).running {
            active_remove(&mut self.timers, &mut self.timer_svc.active, ix);
        }
        self.timers.by_index_mut(ix).period = ticks;
        self.timers.by_index_mut(ix).running = true;
        active_insert(&mut self.timers, &mut self.timer_svc.active, ix, ticks);
        Ok(())
    }

    /// Stop a timer. Stopping a stopped timer fails with
    /// [`Error::Resource`].
    pub fn timer_stop(&mut self, id: TimerId) -> Result<()> {
        self.check_thread_context()?;
        let ix = self.timer_index(id)?;
        if !self.timers.by_index(ix).running {
            return Err(Error::Resource);
        }
        active_remove(&mut self.timers, &mut self.timer_svc.active, ix);
        self.timers.by_index_mut(ix).running = false;
        Ok(())
    }

    pub fn timer_is_running(&self, id: TimerId) -> Result<bool> {
        let ix = self.timer_index(id)?;
        Ok(self.timers.by_index(ix).running)
    }

    /// Delete a timer. An expiry notice already posted for it is ignored
    /// by the drain, since the notice's handle goes stale here.
    pub fn timer_delete(&mut self, id: TimerId) -> Result<()> {
        self.check_thread_context()?;
        let ix = self.timer_index(id)?;
        if self.timers.by_index(ix).running {
            active_remove(&mut self.timers, &mut self.timer_svc.active, ix);
        }
        log::debug!("deleted timer {:?}", self.timers.by_index(ix).handle);
        let _ = self.timers.remove(id.0);
        Ok(())
    }

    /// Advance the active list by one tick and post expiry notices.
    pub(crate) fn timer_tick(&mut self) {
        if let Some(head) = self.timer_svc.active {
            let cb = self.timers.by_index_mut(head);
            cb.delta = cb.delta.saturating_sub(1);
        }
        while let Some(head) = self.timer_svc.active {
            if self.timers.by_index(head).delta != 0 {
                break;
            }
            self.timer_svc.active = self.timers.by_index(head).next;
            self.timers.by_index_mut(head).next = None;
            let (handle, ty, period) = {
                let cb = self.timers.by_index(head);
                (cb.handle, cb.ty, cb.period)
            };
            match ty {
                TimerType::Periodic => {
                    active_insert(&mut self.timers, &mut self.timer_svc.active, head, period);
                }
                TimerType::OneShot => {
                    self.timers.by_index_mut(head).running = false;
                }
            }
            let q = self.timer_svc.queue_ix;
            if self.queue_post(q, encode_notice(handle)).is_err() {
                // The expiry is lost; the hook is the notice.
                self.fatal(FatalError::TimerQueueOverflow);
            }
        }
    }

    /// Ticks until the next timer expiry, for `suspend`.
    pub(crate) fn timer_next_expiry(&self) -> Option<Ticks> {
        self.timer_svc.active.map(|h| self.timers.by_index(h).delta)
    }

    /// Drain the timer-service queue, invoking each expired timer's
    /// callback, then put the service thread back to sleep on its queue.
    /// Returns the number of callbacks invoked.
    ///
    /// This is the service thread's loop body. A port calls it in that
    /// thread's context whenever the thread is scheduled; tests call it
    /// directly after `tick`.
    pub fn run_timer_callbacks(&mut self) -> Result<usize> {
        self.check_thread_context()?;
        let t = self.timer_svc.thread_ix;
        let q = self.timer_svc.queue_ix;

        let mut notices: Vec<Message> = Vec::new();
        if let Some(Ok(crate::wait::Wakeup::Message(msg))) =
            self.threads.by_index_mut(t).wakeup.take()
        {
            notices.push(msg);
        }
        while let Some(msg) = self.queues.by_index_mut(q).dequeue() {
            notices.push(msg);
        }

        let mut fired = 0;
        for msg in &notices {
            let handle = match decode_notice(msg) {
                Some(h) => h,
                None => continue,
            };
            // Stale handles (timer deleted since expiry) are skipped.
            let (callback, arg) = match self.timers.get(handle) {
                Some(cb) => (cb.callback, cb.arg),
                None => continue,
            };
            callback(arg);
            fired += 1;
        }

        self.park_timer_thread();
        self.dispatch(None);
        Ok(fired)
    }
}
