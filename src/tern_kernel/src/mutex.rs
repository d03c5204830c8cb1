//! Mutexes
use core::fmt;

use arrayvec::ArrayString;

use crate::error::{Error, Result, Wait};
use crate::kernel::{Kernel, Ticks};
use crate::list::ListHead;
use crate::thread::{self, ThreadCb, ThreadId, NAME_LEN};
use crate::utils::arena::{Arena, RawHandle};
use crate::wait::{self, WaitKind, Wakeup};

/// Recursive lock depth limit. One more acquire fails with
/// [`Error::Resource`].
pub const MUTEX_LOCK_LIMIT: u8 = 255;

bitflags::bitflags! {
    /// Mutex creation attributes.
    pub struct MutexAttr: u8 {
        /// The owner may re-acquire, up to [`MUTEX_LOCK_LIMIT`] deep.
        const RECURSIVE = 1 << 0;
        /// Boost the owner's effective priority to that of the
        /// highest-priority waiter.
        const PRIO_INHERIT = 1 << 1;
        /// On owner termination, unlock and transfer ownership to the next
        /// waiter instead of abandoning the mutex.
        const ROBUST = 1 << 2;
    }
}

/// A handle to a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(pub(crate) RawHandle);

/// *Mutex control block* — the state data of a mutex.
pub(crate) struct MutexCb {
    pub name: ArrayString<NAME_LEN>,
    pub handle: RawHandle,
    pub attr: MutexAttr,
    /// Recursion depth. `lock == 0` ⇔ unlocked.
    pub lock: u8,
    /// The owning thread. Generation-checked on use, so the owner of an
    /// abandoned mutex reads as dead once its thread slot is released
    /// rather than aliasing whatever reuses the slot.
    pub owner: Option<RawHandle>,
    pub wait_queue: ListHead,
    /// Next mutex in the owner's held chain.
    pub next_held: Option<u32>,
}

impl fmt::Debug for MutexCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("name", &&*self.name)
            .field("attr", &self.attr)
            .field("lock", &self.lock)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// The arena index of a mutex's owner, if the owner thread is still live.
pub(crate) fn live_owner(
    threads: &Arena<ThreadCb>,
    mutexes: &Arena<MutexCb>,
    mx: u32,
) -> Option<u32> {
    let handle = mutexes.by_index(mx).owner?;
    threads.get(handle)?;
    Some(handle.index)
}

/// The inheritance boost a thread receives from the mutexes it holds: the
/// highest effective priority among waiters on its held
/// [`PRIO_INHERIT`](MutexAttr::PRIO_INHERIT) mutexes. Waiter queues are
/// priority-sorted, so only each queue's head matters.
pub(crate) fn inherited_boost(
    threads: &Arena<ThreadCb>,
    mutexes: &Arena<MutexCb>,
    ix: u32,
) -> u8 {
    let mut boost = 0;
    let mut held = threads.by_index(ix).held_head;
    while let Some(mx) = held {
        let cb = mutexes.by_index(mx);
        if cb.attr.contains(MutexAttr::PRIO_INHERIT) {
            if let Some(head) = cb.wait_queue.first {
                boost = boost.max(threads.by_index(head).effective_priority);
            }
        }
        held = cb.next_held;
    }
    boost
}

/// Boost the owner of `mx` to its head waiter's effective priority.
pub(crate) fn boost_owner(kernel: &mut Kernel, mx: u32) {
    let cb = kernel.mutexes.by_index(mx);
    if !cb.attr.contains(MutexAttr::PRIO_INHERIT) {
        return;
    }
    let floor = match cb.wait_queue.first {
        Some(head) => kernel.threads.by_index(head).effective_priority,
        None => return,
    };
    if let Some(owner) = live_owner(&kernel.threads, &kernel.mutexes, mx) {
        kernel.raise_effective_priority(owner, floor);
    }
}

fn chain_push(threads: &mut Arena<ThreadCb>, mutexes: &mut Arena<MutexCb>, owner: u32, mx: u32) {
    mutexes.by_index_mut(mx).next_held = threads.by_index(owner).held_head;
    threads.by_index_mut(owner).held_head = Some(mx);
}

fn chain_remove(threads: &mut Arena<ThreadCb>, mutexes: &mut Arena<MutexCb>, owner: u32, mx: u32) {
    let mut link = threads.by_index(owner).held_head;
    if link == Some(mx) {
        threads.by_index_mut(owner).held_head = mutexes.by_index(mx).next_held;
    } else {
        while let Some(p) = link {
            let next = mutexes.by_index(p).next_held;
            if next == Some(mx) {
                mutexes.by_index_mut(p).next_held = mutexes.by_index(mx).next_held;
                break;
            }
            link = next;
        }
    }
    mutexes.by_index_mut(mx).next_held = None;
}

/// Make `new_owner`, the head of `mx`'s waiter queue, the owner and wake
/// it.
fn transfer_to_waiter(kernel: &mut Kernel, mx: u32, new_owner: u32) {
    let handle = kernel.threads.by_index(new_owner).handle;
    {
        let cb = kernel.mutexes.by_index_mut(mx);
        cb.lock = 1;
        cb.owner = Some(handle);
    }
    chain_push(&mut kernel.threads, &mut kernel.mutexes, new_owner, mx);
    wait::unpark(
        &mut kernel.threads,
        &mut kernel.sched,
        Some(&mut kernel.mutexes.by_index_mut(mx).wait_queue),
        new_owner,
        Ok(Wakeup::Unit),
    );
}

/// Mutex services.
impl Kernel {
    fn mutex_index(&self, id: MutexId) -> Result<u32> {
        self.mutexes.get(id.0).map(|_| id.0.index).ok_or(Error::BadId)
    }

    /// Create a mutex. Not callable from interrupt context.
    pub fn mutex_new(&mut self, name: &str, attr: MutexAttr) -> Result<MutexId> {
        self.check_thread_context()?;
        let handle = self.mutexes.insert(MutexCb {
            name: thread::truncate_name(name),
            handle: RawHandle { index: 0, gen: 0 },
            attr,
            lock: 0,
            owner: None,
            wait_queue: ListHead::default(),
            next_held: None,
        });
        self.mutexes.by_index_mut(handle.index).handle = handle;
        log::debug!("created mutex {:?} ({:?}) {:?}", handle, name, attr);
        Ok(MutexId(handle))
    }

    /// Acquire a mutex, blocking up to `timeout` ticks if it is held by
    /// another thread.
    ///
    /// Re-acquiring as the owner increments the lock count on a
    /// [`RECURSIVE`](MutexAttr::RECURSIVE) mutex (up to
    /// [`MUTEX_LOCK_LIMIT`]) and fails with [`Error::Resource`] otherwise.
    /// Under [`PRIO_INHERIT`](MutexAttr::PRIO_INHERIT), blocking raises
    /// the owner's effective priority to at least the caller's. Mutexes
    /// have no interrupt-context variant.
    pub fn mutex_acquire(&mut self, id: MutexId, timeout: Ticks) -> Result<Wait<()>> {
        self.check_thread_context()?;
        let cur = self.running_index()?;
        let mx = self.mutex_index(id)?;

        if self.mutexes.by_index(mx).lock == 0 {
            let handle = self.threads.by_index(cur).handle;
            {
                let cb = self.mutexes.by_index_mut(mx);
                cb.lock = 1;
                cb.owner = Some(handle);
            }
            chain_push(&mut self.threads, &mut self.mutexes, cur, mx);
            return Ok(Wait::Complete(()));
        }

        let owner = live_owner(&self.threads, &self.mutexes, mx);
        if owner == Some(cur) {
            let cb = self.mutexes.by_index_mut(mx);
            if !cb.attr.contains(MutexAttr::RECURSIVE) || cb.lock == MUTEX_LOCK_LIMIT {
                return Err(Error::Resource);
            }
            cb.lock += 1;
            return Ok(Wait::Complete(()));
        }

        if timeout == 0 {
            return Err(Error::Resource);
        }
        self.check_blockable()?;
        if self.mutexes.by_index(mx).attr.contains(MutexAttr::PRIO_INHERIT) {
            // `owner` is `None` for a mutex abandoned by a terminated
            // thread; there is nobody left to boost.
            if let Some(owner) = owner {
                let floor = self.threads.by_index(cur).effective_priority;
                self.raise_effective_priority(owner, floor);
            }
        }
        wait::park(
            &mut self.threads,
            &mut self.sched,
            Some(&mut self.mutexes.by_index_mut(mx).wait_queue),
            cur,
            WaitKind::Mutex { mutex: mx },
            timeout,
        );
        self.dispatch(None);
        Ok(Wait::Pending)
    }

    /// Release a mutex.
    ///
    /// At lock count zero, ownership passes to the highest-priority waiter
    /// and the caller's effective priority drops back to the maximum of
    /// its base priority and the boost from mutexes it still holds.
    /// Releasing while not the owner, or releasing an unlocked mutex,
    /// fails with [`Error::Resource`].
    pub fn mutex_release(&mut self, id: MutexId) -> Result<()> {
        self.check_thread_context()?;
        let cur = self.running_index()?;
        let mx = self.mutex_index(id)?;

        if self.mutexes.by_index(mx).lock == 0
            || live_owner(&self.threads, &self.mutexes, mx) != Some(cur)
        {
            return Err(Error::Resource);
        }
        {
            let cb = self.mutexes.by_index_mut(mx);
            cb.lock -= 1;
            if cb.lock > 0 {
                return Ok(());
            }
            cb.owner = None;
        }
        chain_remove(&mut self.threads, &mut self.mutexes, cur, mx);
        if let Some(waiter) = self.mutexes.by_index(mx).wait_queue.first {
            transfer_to_waiter(self, mx, waiter);
        }
        self.apply_effective_priority(cur);
        self.dispatch(None);
        Ok(())
    }

    /// Delete a mutex, waking every waiter with [`Error::Resource`].
    pub fn mutex_delete(&mut self, id: MutexId) -> Result<()> {
        self.check_thread_context()?;
        let mx = self.mutex_index(id)?;
        let owner = live_owner(&self.threads, &self.mutexes, mx);
        {
            // Waiters leave the queue before the slot goes away.
            let (threads, sched, mutexes) = (&mut self.threads, &mut self.sched, &mut self.mutexes);
            wait::wake_all_err(threads, sched, &mut mutexes.by_index_mut(mx).wait_queue);
        }
        if let Some(owner) = owner {
            if self.mutexes.by_index(mx).lock > 0 {
                chain_remove(&mut self.threads, &mut self.mutexes, owner, mx);
            }
        }
        log::debug!("deleted mutex {:?}", self.mutexes.by_index(mx).handle);
        let _ = self.mutexes.remove(id.0);
        if let Some(owner) = owner {
            self.apply_effective_priority(owner);
        }
        self.dispatch(None);
        Ok(())
    }

    /// Release the terminating thread `ix`'s held mutexes: robust ones are
    /// unlocked and transferred to their next waiter, non-robust ones are
    /// abandoned with a dead owner (the documented hazard — their waiters
    /// stay blocked until the mutex is deleted).
    pub(crate) fn release_held_mutexes(&mut self, ix: u32) {
        let mut held = self.threads.by_index(ix).held_head;
        while let Some(mx) = held {
            held = self.mutexes.by_index(mx).next_held;
            self.mutexes.by_index_mut(mx).next_held = None;
            if self.mutexes.by_index(mx).attr.contains(MutexAttr::ROBUST) {
                {
                    let cb = self.mutexes.by_index_mut(mx);
                    cb.lock = 0;
                    cb.owner = None;
                }
                if let Some(waiter) = self.mutexes.by_index(mx).wait_queue.first {
                    transfer_to_waiter(self, mx, waiter);
                }
            } else if self.mutexes.by_index(mx).wait_queue.first.is_some() {
                log::warn!(
                    "mutex {:?} abandoned by terminated owner with waiters blocked",
                    self.mutexes.by_index(mx).handle
                );
            }
        }
        self.threads.by_index_mut(ix).held_head = None;
    }

    /// The current owner of a mutex, if any.
    pub fn mutex_owner(&self, id: MutexId) -> Result<Option<ThreadId>> {
        let mx = self.mutex_index(id)?;
        if self.mutexes.by_index(mx).lock == 0 {
            return Ok(None);
        }
        Ok(live_owner(&self.threads, &self.mutexes, mx)
            .map(|ix| ThreadId(self.threads.by_index(ix).handle)))
    }
}
