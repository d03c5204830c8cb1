//! Deferred ISR post-processing.
//!
//! Interrupt handlers never run the full wake-up logic inline: the
//! completion is recorded as a [`Post`] in a bounded ring and the port
//! raises its deferred-dispatch interrupt, whose handler calls
//! [`Kernel::deferred_dispatch`]. The drain routes each entry to the
//! kind-specific completion routine and ends with one thread-dispatch
//! step. Ring overflow is reported through the fatal-error hook, never
//! silently dropped.
use core::sync::atomic::AtomicU32;

use alloc::boxed::Box;

use crate::error::FatalError;
use crate::kernel::Kernel;
use crate::utils::arena::RawHandle;
use crate::utils::atomic;

/// A pending completion, tagged by object kind. Handles rather than
/// indices: the object may be deleted before the drain runs, and a stale
/// handle must be skipped, not misdirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Post {
    ThreadFlags(RawHandle),
    EventFlags(RawHandle),
    Semaphore(RawHandle),
    MemoryPool(RawHandle),
    MessageQueue(RawHandle),
}

/// Fixed-capacity ring of pending completions. The occupancy counter is
/// atomic so a producer in interrupt context and the drain agree on
/// fullness without a lock.
pub(crate) struct DeferredQueue {
    slots: Box<[Option<Post>]>,
    /// Consumer position.
    head: usize,
    /// Producer position.
    tail: usize,
    count: AtomicU32,
}

impl DeferredQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: alloc::vec![None; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            count: AtomicU32::new(0),
        }
    }

    /// Append a completion. `false` means the ring was full and the entry
    /// was dropped; the caller reports that through the fatal hook.
    #[must_use]
    pub fn push(&mut self, post: Post) -> bool {
        if atomic::increment_up_to(&self.count, self.slots.len() as u32).is_none() {
            return false;
        }
        self.slots[self.tail] = Some(post);
        self.tail = (self.tail + 1) % self.slots.len();
        true
    }

    pub fn pop(&mut self) -> Option<Post> {
        atomic::decrement_nonzero(&self.count)?;
        let post = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        debug_assert!(post.is_some());
        post
    }
}

impl Kernel {
    /// Record an interrupt-context completion for the deferred drain.
    pub(crate) fn deferred_push(&mut self, post: Post) {
        if !self.deferred.push(post) {
            self.fatal(FatalError::DeferredQueueOverflow);
        }
    }

    /// Drain the deferred ring, dispatching each entry to its completion
    /// routine, then run one thread-dispatch step. The port wires this to
    /// a low-priority interrupt; tests call it after the interrupt-context
    /// variant they exercise.
    pub fn deferred_dispatch(&mut self) {
        while let Some(post) = self.deferred.pop() {
            log::trace!("deferred: {:?}", post);
            match post {
                Post::ThreadFlags(h) => {
                    if self.threads.get(h).is_some() {
                        self.thread_flags_service(h.index);
                    }
                }
                Post::EventFlags(h) => {
                    if self.event_flags.get(h).is_some() {
                        self.event_flags_service(h.index);
                    }
                }
                Post::Semaphore(h) => {
                    if self.semaphores.get(h).is_some() {
                        self.semaphore_service(h.index);
                    }
                }
                Post::MemoryPool(h) => {
                    if self.pools.get(h).is_some() {
                        self.mempool_service(h.index);
                    }
                }
                Post::MessageQueue(h) => {
                    if self.queues.get(h).is_some() {
                        self.msgqueue_service(h.index);
                    }
                }
            }
        }
        self.dispatch(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: u32) -> RawHandle {
        RawHandle { index, gen: 1 }
    }

    #[test]
    fn ring_is_fifo() {
        let mut ring = DeferredQueue::new(4);
        assert!(ring.push(Post::Semaphore(handle(1))));
        assert!(ring.push(Post::EventFlags(handle(2))));
        assert_eq!(ring.pop(), Some(Post::Semaphore(handle(1))));
        assert_eq!(ring.pop(), Some(Post::EventFlags(handle(2))));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn push_refuses_when_full_and_recovers() {
        let mut ring = DeferredQueue::new(2);
        assert!(ring.push(Post::Semaphore(handle(1))));
        assert!(ring.push(Post::Semaphore(handle(2))));
        assert!(!ring.push(Post::Semaphore(handle(3))));

        assert_eq!(ring.pop(), Some(Post::Semaphore(handle(1))));
        assert!(ring.push(Post::Semaphore(handle(4))));
        assert_eq!(ring.pop(), Some(Post::Semaphore(handle(2))));
        assert_eq!(ring.pop(), Some(Post::Semaphore(handle(4))));
    }
}
