//! Semaphores
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayString;

use crate::deferred::Post;
use crate::error::{Error, Result, Wait};
use crate::kernel::{Kernel, Ticks};
use crate::list::ListHead;
use crate::thread::{self, NAME_LEN};
use crate::utils::arena::RawHandle;
use crate::utils::atomic;
use crate::wait::{self, WaitKind, Wakeup};

/// A handle to a counting semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(pub(crate) RawHandle);

/// *Semaphore control block* — the state data of a semaphore.
pub(crate) struct SemaphoreCb {
    pub name: ArrayString<NAME_LEN>,
    pub handle: RawHandle,
    /// Invariant: `0 ≤ tokens ≤ max`. Atomic so the interrupt-context
    /// acquire/release variants can update it without a lock.
    pub tokens: AtomicU32,
    pub max: u32,
    pub wait_queue: ListHead,
}

impl fmt::Debug for SemaphoreCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("name", &&*self.name)
            .field("tokens", &self.tokens.load(Ordering::Relaxed))
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

/// Semaphore services.
impl Kernel {
    fn semaphore_index(&self, id: SemaphoreId) -> Result<u32> {
        self.semaphores
            .get(id.0)
            .map(|_| id.0.index)
            .ok_or(Error::BadId)
    }

    /// Create a semaphore with `initial` of `max` tokens available.
    pub fn semaphore_new(&mut self, name: &str, max: u32, initial: u32) -> Result<SemaphoreId> {
        self.check_thread_context()?;
        if max == 0 || initial > max {
            return Err(Error::BadParam);
        }
        let handle = self.semaphores.insert(SemaphoreCb {
            name: thread::truncate_name(name),
            handle: RawHandle { index: 0, gen: 0 },
            tokens: AtomicU32::new(initial),
            max,
            wait_queue: ListHead::default(),
        });
        self.semaphores.by_index_mut(handle.index).handle = handle;
        log::debug!("created semaphore {:?} ({:?}) {}/{}", handle, name, initial, max);
        Ok(SemaphoreId(handle))
    }

    /// Take a token, blocking up to `timeout` ticks if none is available.
    ///
    /// With a zero timeout this is a pure atomic decrement and may be
    /// called from interrupt context.
    pub fn semaphore_acquire(&mut self, id: SemaphoreId, timeout: Ticks) -> Result<Wait<()>> {
        if self.in_interrupt() && timeout != 0 {
            return Err(Error::IsrContext);
        }
        let ix = self.semaphore_index(id)?;
        if atomic::decrement_nonzero(&self.semaphores.by_index(ix).tokens).is_some() {
            return Ok(Wait::Complete(()));
        }
        if timeout == 0 {
            return Err(Error::Resource);
        }
        let cur = self.running_index()?;
        self.check_blockable()?;
        wait::park(
            &mut self.threads,
            &mut self.sched,
            Some(&mut self.semaphores.by_index_mut(ix).wait_queue),
            cur,
            WaitKind::Semaphore { sem: ix },
            timeout,
        );
        self.dispatch(None);
        Ok(Wait::Pending)
    }

    /// Return a token.
    ///
    /// From thread context, the token is handed directly to the
    /// highest-priority waiter if one exists, bypassing the counter, so
    /// there is no window where the count reads 1 while a waiter is
    /// queued. From interrupt context the counter is incremented
    /// atomically and the hand-off happens in the deferred-queue drain.
    /// Releasing past `max` fails with [`Error::Resource`].
    pub fn semaphore_release(&mut self, id: SemaphoreId) -> Result<()> {
        let ix = self.semaphore_index(id)?;
        if self.in_interrupt() {
            let cb = self.semaphores.by_index(ix);
            if atomic::increment_up_to(&cb.tokens, cb.max).is_none() {
                return Err(Error::Resource);
            }
            self.deferred_push(Post::Semaphore(id.0));
            return Ok(());
        }
        if let Some(waiter) = self.semaphores.by_index(ix).wait_queue.first {
            wait::unpark(
                &mut self.threads,
                &mut self.sched,
                Some(&mut self.semaphores.by_index_mut(ix).wait_queue),
                waiter,
                Ok(Wakeup::Unit),
            );
            self.dispatch(None);
            return Ok(());
        }
        let cb = self.semaphores.by_index(ix);
        if atomic::increment_up_to(&cb.tokens, cb.max).is_none() {
            return Err(Error::Resource);
        }
        Ok(())
    }

    /// Match tokens released from interrupt context with queued waiters.
    /// Called by the deferred-queue drain.
    pub(crate) fn semaphore_service(&mut self, ix: u32) {
        loop {
            let waiter = match self.semaphores.by_index(ix).wait_queue.first {
                Some(w) => w,
                None => return,
            };
            if atomic::decrement_nonzero(&self.semaphores.by_index(ix).tokens).is_none() {
                return;
            }
            wait::unpark(
                &mut self.threads,
                &mut self.sched,
                Some(&mut self.semaphores.by_index_mut(ix).wait_queue),
                waiter,
                Ok(Wakeup::Unit),
            );
        }
    }

    /// Delete a semaphore, waking every waiter with [`Error::Resource`].
    pub fn semaphore_delete(&mut self, id: SemaphoreId) -> Result<()> {
        self.check_thread_context()?;
        let ix = self.semaphore_index(id)?;
        wait::wake_all_err(
            &mut self.threads,
            &mut self.sched,
            &mut self.semaphores.by_index_mut(ix).wait_queue,
        );
        log::debug!("deleted semaphore {:?}", self.semaphores.by_index(ix).handle);
        let _ = self.semaphores.remove(id.0);
        self.dispatch(None);
        Ok(())
    }

    /// The number of tokens currently available.
    pub fn semaphore_count(&self, id: SemaphoreId) -> Result<u32> {
        let ix = self.semaphore_index(id)?;
        Ok(self.semaphores.by_index(ix).tokens.load(Ordering::Acquire))
    }
}
