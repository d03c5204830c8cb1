//! Message queues.
//!
//! Each message carries a priority byte and a fixed-maximum payload.
//! Storage comes from an embedded [`PoolCore`]; queued messages form a
//! priority-sorted doubly-linked list threaded through a 16-byte header at
//! the front of each block, so put and get are O(1) apart from the sorted
//! insert's walk. Insertion is stable: a message goes behind queued
//! messages of equal priority.
use core::fmt;

use alloc::vec::Vec;
use arrayvec::ArrayString;

use crate::deferred::Post;
use crate::error::{Error, Result, Wait};
use crate::kernel::{Kernel, Ticks};
use crate::list::ListHead;
use crate::mempool::PoolCore;
use crate::sched::RunState;
use crate::thread::{self, NAME_LEN};
use crate::utils::arena::RawHandle;
use crate::wait::{self, WaitKind, Wakeup};

// Block layout: header, then the payload.
const OFF_NEXT: usize = 0;
const OFF_PREV: usize = 4;
const OFF_PRIO: usize = 8;
const OFF_LEN: usize = 12;
pub(crate) const MSG_HEADER: usize = 16;

/// List terminator in a header link word.
const LINK_NONE: u32 = u32::MAX;

/// A handle to a message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) RawHandle);

/// A message: a priority byte and a payload no longer than the queue's
/// message size. Higher priority is delivered first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub priority: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(priority: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            priority,
            data: data.into(),
        }
    }
}

/// *Message queue control block* — the state data of a message queue.
pub(crate) struct QueueCb {
    pub name: ArrayString<NAME_LEN>,
    pub handle: RawHandle,
    pub msg_size: usize,
    pub capacity: u32,
    pub count: u32,
    pub core: PoolCore,
    /// Message list, descending priority, FIFO among equals. Offsets into
    /// `core`.
    first: u32,
    last: u32,
    /// Blocked receivers when empty, blocked senders when full; never
    /// both.
    pub wait_queue: ListHead,
}

impl QueueCb {
    pub fn new(name: ArrayString<NAME_LEN>, msg_size: usize, capacity: u32) -> Self {
        Self {
            name,
            handle: RawHandle { index: 0, gen: 0 },
            msg_size,
            capacity,
            count: 0,
            core: PoolCore::new(MSG_HEADER + msg_size, capacity),
            first: LINK_NONE,
            last: LINK_NONE,
            wait_queue: ListHead::default(),
        }
    }

    fn read_word(&self, off: u32, field: usize) -> u32 {
        let at = off as usize + field;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.core.storage[at..at + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_word(&mut self, off: u32, field: usize, value: u32) {
        let at = off as usize + field;
        self.core.storage[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn priority_at(&self, off: u32) -> u8 {
        self.core.storage[off as usize + OFF_PRIO]
    }

    fn write_message(&mut self, off: u32, msg: &Message) {
        self.core.storage[off as usize + OFF_PRIO] = msg.priority;
        self.write_word(off, OFF_LEN, msg.data.len() as u32);
        let payload = off as usize + MSG_HEADER;
        self.core.storage[payload..payload + msg.data.len()].copy_from_slice(&msg.data);
    }

    fn read_message(&self, off: u32) -> Message {
        let len = self.read_word(off, OFF_LEN) as usize;
        let payload = off as usize + MSG_HEADER;
        Message {
            priority: self.priority_at(off),
            data: self.core.storage[payload..payload + len].to_vec(),
        }
    }

    /// Insert an occupied block into the message list, behind queued
    /// messages of equal or higher priority.
    fn insert_sorted(&mut self, off: u32) {
        let priority = self.priority_at(off);
        let mut pos = self.first;
        while pos != LINK_NONE {
            if self.priority_at(pos) < priority {
                break;
            }
            pos = self.read_word(pos, OFF_NEXT);
        }
        let prev = if pos == LINK_NONE {
            self.last
        } else {
            self.read_word(pos, OFF_PREV)
        };
        self.write_word(off, OFF_NEXT, pos);
        self.write_word(off, OFF_PREV, prev);
        if prev == LINK_NONE {
            self.first = off;
        } else {
            self.write_word(prev, OFF_NEXT, off);
        }
        if pos == LINK_NONE {
            self.last = off;
        } else {
            self.write_word(pos, OFF_PREV, off);
        }
        self.count += 1;
    }

    /// Pop the highest-priority, earliest-inserted message block.
    fn pop_front(&mut self) -> Option<u32> {
        if self.first == LINK_NONE {
            return None;
        }
        let off = self.first;
        let next = self.read_word(off, OFF_NEXT);
        self.first = next;
        if next == LINK_NONE {
            self.last = LINK_NONE;
        } else {
            self.write_word(next, OFF_PREV, LINK_NONE);
        }
        self.count -= 1;
        Some(off)
    }

    /// Store a message, or give it back if the queue is full.
    fn enqueue(&mut self, msg: Message) -> core::result::Result<(), Message> {
        let off = match self.core.alloc() {
            Some(off) => off,
            None => return Err(msg),
        };
        self.write_message(off, &msg);
        self.insert_sorted(off);
        Ok(())
    }

    /// Remove and return the front message, releasing its block.
    pub(crate) fn dequeue(&mut self) -> Option<Message> {
        let off = self.pop_front()?;
        let msg = self.read_message(off);
        // The block was just popped, so the free cannot fail.
        let _ = self.core.free(off);
        Some(msg)
    }
}

impl fmt::Debug for QueueCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("name", &&*self.name)
            .field("msg_size", &self.msg_size)
            .field("count", &self.count)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Message-queue services.
impl Kernel {
    pub(crate) fn queue_index(&self, id: QueueId) -> Result<u32> {
        self.queues.get(id.0).map(|_| id.0.index).ok_or(Error::BadId)
    }

    /// Create a queue of up to `capacity` messages of at most `msg_size`
    /// bytes.
    pub fn msgqueue_new(&mut self, name: &str, msg_size: usize, capacity: u32) -> Result<QueueId> {
        self.check_thread_context()?;
        if msg_size == 0 || capacity == 0 {
            return Err(Error::BadParam);
        }
        Ok(self.msgqueue_new_raw(name, msg_size, capacity))
    }

    pub(crate) fn msgqueue_new_raw(
        &mut self,
        name: &str,
        msg_size: usize,
        capacity: u32,
    ) -> QueueId {
        let handle = self
            .queues
            .insert(QueueCb::new(thread::truncate_name(name), msg_size, capacity));
        self.queues.by_index_mut(handle.index).handle = handle;
        log::debug!(
            "created queue {:?} ({:?}) {} x {} bytes",
            handle,
            name,
            capacity,
            msg_size
        );
        QueueId(handle)
    }

    /// Send a message, blocking up to `timeout` ticks while the queue is
    /// full.
    ///
    /// A waiting receiver gets the payload directly, bypassing storage.
    /// With a zero timeout this may be called from interrupt context; the
    /// message then always goes through storage and delivery happens in
    /// the deferred-queue drain.
    pub fn msgqueue_put(&mut self, id: QueueId, msg: Message, timeout: Ticks) -> Result<Wait<()>> {
        let ix = self.queue_index(id)?;
        if msg.data.len() > self.queues.by_index(ix).msg_size {
            return Err(Error::BadParam);
        }
        if self.in_interrupt() {
            if timeout != 0 {
                return Err(Error::IsrContext);
            }
            if self.queues.by_index_mut(ix).enqueue(msg).is_err() {
                return Err(Error::Resource);
            }
            self.deferred_push(Post::MessageQueue(id.0));
            return Ok(Wait::Complete(()));
        }
        match self.queue_post(ix, msg) {
            Ok(()) => {
                self.dispatch(None);
                Ok(Wait::Complete(()))
            }
            Err(msg) => {
                if timeout == 0 {
                    return Err(Error::Resource);
                }
                let cur = self.running_index()?;
                self.check_blockable()?;
                self.threads.by_index_mut(cur).wait_msg = Some(msg);
                wait::park(
                    &mut self.threads,
                    &mut self.sched,
                    Some(&mut self.queues.by_index_mut(ix).wait_queue),
                    cur,
                    WaitKind::QueuePut { queue: ix },
                    timeout,
                );
                self.dispatch(None);
                Ok(Wait::Pending)
            }
        }
    }

    /// Deliver a message to a waiting receiver or store it. `Err` returns
    /// the message when the queue is full. Thread/kernel context only;
    /// also used by the timer service to post expiry notices.
    pub(crate) fn queue_post(&mut self, ix: u32, msg: Message) -> core::result::Result<(), Message> {
        if let Some(w) = self.queues.by_index(ix).wait_queue.first {
            if matches!(
                self.threads.by_index(w).state,
                RunState::Blocked(WaitKind::QueueGet { .. })
            ) {
                wait::unpark(
                    &mut self.threads,
                    &mut self.sched,
                    Some(&mut self.queues.by_index_mut(ix).wait_queue),
                    w,
                    Ok(Wakeup::Message(msg)),
                );
                return Ok(());
            }
        }
        self.queues.by_index_mut(ix).enqueue(msg)
    }

    /// Receive the highest-priority (earliest among equals) message,
    /// blocking up to `timeout` ticks while the queue is empty. With a
    /// zero timeout this may be called from interrupt context.
    pub fn msgqueue_get(&mut self, id: QueueId, timeout: Ticks) -> Result<Wait<Message>> {
        if self.in_interrupt() && timeout != 0 {
            return Err(Error::IsrContext);
        }
        let ix = self.queue_index(id)?;
        if let Some(msg) = self.queues.by_index_mut(ix).dequeue() {
            // A sender may be blocked on the now-free block.
            if self.in_interrupt() {
                if !self.queues.by_index(ix).wait_queue.is_empty() {
                    self.deferred_push(Post::MessageQueue(id.0));
                }
            } else {
                self.msgqueue_service(ix);
                self.dispatch(None);
            }
            return Ok(Wait::Complete(msg));
        }
        if timeout == 0 {
            return Err(Error::Resource);
        }
        let cur = self.running_index()?;
        self.check_blockable()?;
        wait::park(
            &mut self.threads,
            &mut self.sched,
            Some(&mut self.queues.by_index_mut(ix).wait_queue),
            cur,
            WaitKind::QueueGet { queue: ix },
            timeout,
        );
        self.dispatch(None);
        Ok(Wait::Pending)
    }

    /// Serve the waiter queue: move blocked senders' messages into
    /// storage and deliver stored messages to blocked receivers. Shared
    /// with the deferred-queue drain.
    pub(crate) fn msgqueue_service(&mut self, ix: u32) {
        loop {
            let w = match self.queues.by_index(ix).wait_queue.first {
                Some(w) => w,
                None => return,
            };
            match self.threads.by_index(w).state {
                RunState::Blocked(WaitKind::QueuePut { .. }) => {
                    let msg = match self.threads.by_index_mut(w).wait_msg.take() {
                        Some(msg) => msg,
                        None => return,
                    };
                    if let Err(msg) = self.queues.by_index_mut(ix).enqueue(msg) {
                        self.threads.by_index_mut(w).wait_msg = Some(msg);
                        return;
                    }
                    wait::unpark(
                        &mut self.threads,
                        &mut self.sched,
                        Some(&mut self.queues.by_index_mut(ix).wait_queue),
                        w,
                        Ok(Wakeup::Unit),
                    );
                }
                RunState::Blocked(WaitKind::QueueGet { .. }) => {
                    let msg = match self.queues.by_index_mut(ix).dequeue() {
                        Some(msg) => msg,
                        None => return,
                    };
                    wait::unpark(
                        &mut self.threads,
                        &mut self.sched,
                        Some(&mut self.queues.by_index_mut(ix).wait_queue),
                        w,
                        Ok(Wakeup::Message(msg)),
                    );
                }
                _ => return,
            }
        }
    }

    /// Discard every queued message, then admit blocked senders.
    pub fn msgqueue_reset(&mut self, id: QueueId) -> Result<()> {
        self.check_thread_context()?;
        let ix = self.queue_index(id)?;
        while self.queues.by_index_mut(ix).dequeue().is_some() {}
        self.msgqueue_service(ix);
        self.dispatch(None);
        Ok(())
    }

    /// Delete a queue, waking every blocked sender and receiver with
    /// [`Error::Resource`].
    pub fn msgqueue_delete(&mut self, id: QueueId) -> Result<()> {
        self.check_thread_context()?;
        let ix = self.queue_index(id)?;
        wait::wake_all_err(
            &mut self.threads,
            &mut self.sched,
            &mut self.queues.by_index_mut(ix).wait_queue,
        );
        log::debug!("deleted queue {:?}", self.queues.by_index(ix).handle);
        let _ = self.queues.remove(id.0);
        self.dispatch(None);
        Ok(())
    }

    /// The number of messages currently queued.
    pub fn msgqueue_count(&self, id: QueueId) -> Result<u32> {
        let ix = self.queue_index(id)?;
        Ok(self.queues.by_index(ix).count)
    }
}
