//! Event flags
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayString;

use crate::deferred::Post;
use crate::error::{Error, Result, Wait};
use crate::kernel::{Kernel, Ticks};
use crate::list::ListHead;
use crate::sched::Sched;
use crate::thread::{self, ThreadCb, NAME_LEN};
use crate::utils::arena::{Arena, RawHandle};
use crate::utils::atomic;
use crate::wait::{self, WaitKind, Wakeup};

bitflags::bitflags! {
    /// Wait options for event-flags and thread-flags waits. The defaults
    /// (empty set) are "any bit satisfies" and "clear matched bits on
    /// success".
    pub struct WaitOptions: u8 {
        /// Every requested bit must be set, not just one.
        const ALL = 1 << 0;
        /// Leave the flags unchanged on a successful wait.
        const NO_CLEAR = 1 << 1;
    }
}

/// A handle to an event-flags object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventFlagsId(pub(crate) RawHandle);

/// *Event flags control block* — the state data of an event-flags object.
pub(crate) struct EventFlagsCb {
    pub name: ArrayString<NAME_LEN>,
    pub handle: RawHandle,
    pub bits: AtomicU32,
    /// Each waiter's mask and options live in its thread control block.
    pub wait_queue: ListHead,
}

impl fmt::Debug for EventFlagsCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFlagsCb")
            .field("name", &&*self.name)
            .field("bits", &self.bits.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Check `cell` against `mask` under `options`; on success, consume the
/// matched bits (unless `NO_CLEAR`) and return the pre-clear value. One
/// atomic step, shared by event-flags and thread-flags waits.
pub(crate) fn poll(cell: &AtomicU32, mask: u32, options: WaitOptions) -> Option<u32> {
    if options.contains(WaitOptions::NO_CLEAR) {
        let v = cell.load(Ordering::Acquire);
        let met = if options.contains(WaitOptions::ALL) {
            v & mask == mask
        } else {
            v & mask != 0
        };
        return met.then(|| v);
    }
    if options.contains(WaitOptions::ALL) {
        atomic::try_clear_all(cell, mask)
    } else {
        atomic::try_clear_any(cell, mask)
    }
}

/// Wake every waiter whose stored condition is satisfied, in priority
/// order.
fn service(
    threads: &mut Arena<ThreadCb>,
    sched: &mut Sched,
    bits: &AtomicU32,
    queue: &mut ListHead,
) {
    let mut pos = queue.first;
    while let Some(w) = pos {
        pos = threads.by_index(w).link.next;
        let (mask, options) = {
            let cb = threads.by_index(w);
            (cb.wait_mask, cb.wait_options)
        };
        if let Some(pre) = poll(bits, mask, options) {
            wait::unpark(threads, sched, Some(&mut *queue), w, Ok(Wakeup::Flags(pre)));
        }
    }
}

/// Event-flags services.
impl Kernel {
    fn event_flags_index(&self, id: EventFlagsId) -> Result<u32> {
        self.event_flags
            .get(id.0)
            .map(|_| id.0.index)
            .ok_or(Error::BadId)
    }

    /// Create an event-flags object with all bits clear.
    pub fn event_flags_new(&mut self, name: &str) -> Result<EventFlagsId> {
        self.check_thread_context()?;
        let handle = self.event_flags.insert(EventFlagsCb {
            name: thread::truncate_name(name),
            handle: RawHandle { index: 0, gen: 0 },
            bits: AtomicU32::new(0),
            wait_queue: ListHead::default(),
        });
        self.event_flags.by_index_mut(handle.index).handle = handle;
        log::debug!("created event flags {:?} ({:?})", handle, name);
        Ok(EventFlagsId(handle))
    }

    /// OR `bits` into the flags and wake every waiter whose condition is
    /// now satisfied, highest priority first. Returns the value after the
    /// OR.
    ///
    /// Callable from interrupt context; the waiter re-evaluation is then
    /// routed through the deferred post-processing queue.
    pub fn event_flags_set(&mut self, id: EventFlagsId, bits: u32) -> Result<u32> {
        if bits == 0 {
            return Err(Error::BadParam);
        }
        let ix = self.event_flags_index(id)?;
        let after = atomic::set_bits(&self.event_flags.by_index(ix).bits, bits) | bits;
        if self.in_interrupt() {
            self.deferred_push(Post::EventFlags(id.0));
            return Ok(after);
        }
        self.event_flags_service(ix);
        self.dispatch(None);
        Ok(after)
    }

    /// Re-evaluate waiters after a set. Shared with the deferred-queue
    /// drain.
    pub(crate) fn event_flags_service(&mut self, ix: u32) {
        let cb = self.event_flags.by_index_mut(ix);
        let (bits, queue) = (&cb.bits, &mut cb.wait_queue);
        service(&mut self.threads, &mut self.sched, bits, queue);
    }

    /// AND out `bits` and return the prior value. Callable from interrupt
    /// context.
    pub fn event_flags_clear(&mut self, id: EventFlagsId, bits: u32) -> Result<u32> {
        let ix = self.event_flags_index(id)?;
        Ok(atomic::clear_bits(&self.event_flags.by_index(ix).bits, bits))
    }

    /// The current flags value.
    pub fn event_flags_get(&self, id: EventFlagsId) -> Result<u32> {
        let ix = self.event_flags_index(id)?;
        Ok(self.event_flags.by_index(ix).bits.load(Ordering::Acquire))
    }

    /// Wait for `mask` under `options`, blocking up to `timeout` ticks.
    /// On success the matched bits are consumed (unless
    /// [`WaitOptions::NO_CLEAR`]) and the pre-clear value is returned.
    ///
    /// With a zero timeout the check is a single atomic step and may be
    /// called from interrupt context.
    pub fn event_flags_wait(
        &mut self,
        id: EventFlagsId,
        mask: u32,
        options: WaitOptions,
        timeout: Ticks,
    ) -> Result<Wait<u32>> {
        if mask == 0 {
            return Err(Error::BadParam);
        }
        if self.in_interrupt() && timeout != 0 {
            return Err(Error::IsrContext);
        }
        let ix = self.event_flags_index(id)?;
        if let Some(pre) = poll(&self.event_flags.by_index(ix).bits, mask, options) {
            return Ok(Wait::Complete(pre));
        }
        if timeout == 0 {
            return Err(Error::Resource);
        }
        let cur = self.running_index()?;
        self.check_blockable()?;
        {
            let cb = self.threads.by_index_mut(cur);
            cb.wait_mask = mask;
            cb.wait_options = options;
        }
        wait::park(
            &mut self.threads,
            &mut self.sched,
            Some(&mut self.event_flags.by_index_mut(ix).wait_queue),
            cur,
            WaitKind::EventFlags { flags: ix },
            timeout,
        );
        self.dispatch(None);
        Ok(Wait::Pending)
    }

    /// Delete an event-flags object, waking every waiter with
    /// [`Error::Resource`].
    pub fn event_flags_delete(&mut self, id: EventFlagsId) -> Result<()> {
        self.check_thread_context()?;
        let ix = self.event_flags_index(id)?;
        wait::wake_all_err(
            &mut self.threads,
            &mut self.sched,
            &mut self.event_flags.by_index_mut(ix).wait_queue,
        );
        log::debug!("deleted event flags {:?}", self.event_flags.by_index(ix).handle);
        let _ = self.event_flags.remove(id.0);
        self.dispatch(None);
        Ok(())
    }
}
