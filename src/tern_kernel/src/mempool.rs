//! Fixed-block memory pools.
//!
//! The free list is intrusive: the first word of each free block holds the
//! byte offset of the next free block, written and read as plain bytes of
//! the pool storage. Reuse is LIFO. [`PoolCore`] is the raw allocator,
//! shared with the message queue's backing store; [`PoolCb`] adds the
//! waiter queue for blocking allocation.
use core::fmt;

use alloc::boxed::Box;
use arrayvec::ArrayString;
use num_integer::Integer;

use crate::deferred::Post;
use crate::error::{Error, Result, Wait};
use crate::kernel::{Kernel, Ticks};
use crate::list::ListHead;
use crate::thread::{self, NAME_LEN};
use crate::utils::arena::RawHandle;
use crate::wait::{self, WaitKind, Wakeup};

/// Free-list terminator stored in the last free block's link word.
const LINK_NONE: u32 = u32::MAX;

/// A block obtained from a memory pool: a byte offset into that pool's
/// storage. Only meaningful together with the pool it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block(pub(crate) u32);

/// A handle to a memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) RawHandle);

/// The allocator proper: storage, free list, occupancy.
pub(crate) struct PoolCore {
    /// Rounded up to a word multiple, at least one word, so the link fits
    /// and blocks stay aligned.
    pub block_size: usize,
    pub capacity: u32,
    pub used: u32,
    /// Offset of the first free block.
    free_head: u32,
    pub storage: Box<[u8]>,
}

impl PoolCore {
    pub fn new(block_size: usize, capacity: u32) -> Self {
        let block_size = Integer::div_ceil(&block_size.max(1), &4) * 4;
        let mut core = Self {
            block_size,
            capacity,
            used: 0,
            free_head: LINK_NONE,
            storage: alloc::vec![0u8; block_size * capacity as usize].into_boxed_slice(),
        };
        // Chain the blocks back to front so the initial allocation order
        // is front to back.
        for i in (0..capacity).rev() {
            let off = i * block_size as u32;
            core.write_link(off, core.free_head);
            core.free_head = off;
        }
        core
    }

    fn read_link(&self, off: u32) -> u32 {
        let off = off as usize;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.storage[off..off + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_link(&mut self, off: u32, link: u32) {
        let off = off as usize;
        self.storage[off..off + 4].copy_from_slice(&link.to_le_bytes());
    }

    /// A block offset that lies within the storage on a block boundary.
    pub fn offset_valid(&self, off: u32) -> bool {
        (off as usize) < self.storage.len() && off as usize % self.block_size == 0
    }

    /// Pop the free-list head.
    pub fn alloc(&mut self) -> Option<u32> {
        if self.free_head == LINK_NONE {
            return None;
        }
        let off = self.free_head;
        self.free_head = self.read_link(off);
        self.used += 1;
        Some(off)
    }

    /// Push a block back onto the free-list head.
    ///
    /// An out-of-range or misaligned offset is [`Error::BadParam`]; a free
    /// into a pool with nothing allocated is [`Error::Resource`].
    pub fn free(&mut self, off: u32) -> Result<()> {
        if !self.offset_valid(off) {
            return Err(Error::BadParam);
        }
        if self.used == 0 {
            return Err(Error::Resource);
        }
        self.write_link(off, self.free_head);
        self.free_head = off;
        self.used -= 1;
        Ok(())
    }

    pub fn block(&self, off: u32) -> &[u8] {
        &self.storage[off as usize..off as usize + self.block_size]
    }

    pub fn block_mut(&mut self, off: u32) -> &mut [u8] {
        &mut self.storage[off as usize..off as usize + self.block_size]
    }
}

impl fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCore")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

/// *Memory pool control block* — the state data of a memory pool.
#[derive(Debug)]
pub(crate) struct PoolCb {
    pub name: ArrayString<NAME_LEN>,
    pub handle: RawHandle,
    pub core: PoolCore,
    pub wait_queue: ListHead,
}

/// Memory-pool services.
impl Kernel {
    fn pool_index(&self, id: PoolId) -> Result<u32> {
        self.pools.get(id.0).map(|_| id.0.index).ok_or(Error::BadId)
    }

    /// Create a pool of `capacity` blocks of `block_size` bytes
    /// (rounded up to a word multiple).
    pub fn mempool_new(&mut self, name: &str, block_size: usize, capacity: u32) -> Result<PoolId> {
        self.check_thread_context()?;
        if block_size == 0 || capacity == 0 {
            return Err(Error::BadParam);
        }
        let handle = self.pools.insert(PoolCb {
            name: thread::truncate_name(name),
            handle: RawHandle { index: 0, gen: 0 },
            core: PoolCore::new(block_size, capacity),
            wait_queue: ListHead::default(),
        });
        self.pools.by_index_mut(handle.index).handle = handle;
        log::debug!(
            "created pool {:?} ({:?}) {} x {} bytes",
            handle,
            name,
            capacity,
            block_size
        );
        Ok(PoolId(handle))
    }

    /// Allocate a block, blocking up to `timeout` ticks while the pool is
    /// exhausted. With a zero timeout this may be called from interrupt
    /// context.
    pub fn mempool_alloc(&mut self, id: PoolId, timeout: Ticks) -> Result<Wait<Block>> {
        if self.in_interrupt() && timeout != 0 {
            return Err(Error::IsrContext);
        }
        let ix = self.pool_index(id)?;
        if let Some(off) = self.pools.by_index_mut(ix).core.alloc() {
            return Ok(Wait::Complete(Block(off)));
        }
        if timeout == 0 {
            return Err(Error::Resource);
        }
        let cur = self.running_index()?;
        self.check_blockable()?;
        wait::park(
            &mut self.threads,
            &mut self.sched,
            Some(&mut self.pools.by_index_mut(ix).wait_queue),
            cur,
            WaitKind::Alloc { pool: ix },
            timeout,
        );
        self.dispatch(None);
        Ok(Wait::Pending)
    }

    /// Return a block to its pool.
    ///
    /// If a thread is blocked allocating, the block is immediately handed
    /// to the highest-priority waiter (via the deferred queue when called
    /// from interrupt context).
    pub fn mempool_free(&mut self, id: PoolId, block: Block) -> Result<()> {
        let ix = self.pool_index(id)?;
        self.pools.by_index_mut(ix).core.free(block.0)?;
        if self.in_interrupt() {
            if !self.pools.by_index(ix).wait_queue.is_empty() {
                self.deferred_push(Post::MemoryPool(id.0));
            }
            return Ok(());
        }
        self.mempool_service(ix);
        self.dispatch(None);
        Ok(())
    }

    /// Hand freed blocks to blocked allocators. Shared with the
    /// deferred-queue drain.
    pub(crate) fn mempool_service(&mut self, ix: u32) {
        loop {
            let waiter = match self.pools.by_index(ix).wait_queue.first {
                Some(w) => w,
                None => return,
            };
            let off = match self.pools.by_index_mut(ix).core.alloc() {
                Some(off) => off,
                None => return,
            };
            wait::unpark(
                &mut self.threads,
                &mut self.sched,
                Some(&mut self.pools.by_index_mut(ix).wait_queue),
                waiter,
                Ok(Wakeup::Block(Block(off))),
            );
        }
    }

    /// Delete a pool, waking every blocked allocator with
    /// [`Error::Resource`]. Outstanding blocks become dangling.
    pub fn mempool_delete(&mut self, id: PoolId) -> Result<()> {
        self.check_thread_context()?;
        let ix = self.pool_index(id)?;
        wait::wake_all_err(
            &mut self.threads,
            &mut self.sched,
            &mut self.pools.by_index_mut(ix).wait_queue,
        );
        log::debug!("deleted pool {:?}", self.pools.by_index(ix).handle);
        let _ = self.pools.remove(id.0);
        self.dispatch(None);
        Ok(())
    }

    /// Read access to an allocated block's bytes.
    pub fn pool_block(&self, id: PoolId, block: Block) -> Result<&[u8]> {
        let ix = self.pool_index(id)?;
        let core = &self.pools.by_index(ix).core;
        if !core.offset_valid(block.0) {
            return Err(Error::BadParam);
        }
        Ok(core.block(block.0))
    }

    /// Write access to an allocated block's bytes.
    pub fn pool_block_mut(&mut self, id: PoolId, block: Block) -> Result<&mut [u8]> {
        let ix = self.pool_index(id)?;
        let core = &mut self.pools.by_index_mut(ix).core;
        if !core.offset_valid(block.0) {
            return Err(Error::BadParam);
        }
        Ok(core.block_mut(block.0))
    }

    /// `(used, capacity)` block counts.
    pub fn mempool_info(&self, id: PoolId) -> Result<(u32, u32)> {
        let ix = self.pool_index(id)?;
        let core = &self.pools.by_index(ix).core;
        Ok((core.used, core.capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_front_to_back_and_reuses_lifo() {
        let mut core = PoolCore::new(16, 4);
        let offs: alloc::vec::Vec<u32> = (0..4).map(|_| core.alloc().unwrap()).collect();
        assert_eq!(offs, [0, 16, 32, 48]);
        assert_eq!(core.alloc(), None);

        core.free(16).unwrap();
        core.free(48).unwrap();
        // Last freed, first reused.
        assert_eq!(core.alloc(), Some(48));
        assert_eq!(core.alloc(), Some(16));
    }

    #[test]
    fn block_size_rounds_up_to_word() {
        let core = PoolCore::new(5, 2);
        assert_eq!(core.block_size, 8);
        assert_eq!(core.storage.len(), 16);
    }

    #[test]
    fn free_validates_offset_and_occupancy() {
        let mut core = PoolCore::new(16, 2);
        assert_eq!(core.free(64), Err(Error::BadParam));
        assert_eq!(core.free(7), Err(Error::BadParam));
        // Nothing allocated: a well-formed offset is still a double free.
        assert_eq!(core.free(0), Err(Error::Resource));

        let off = core.alloc().unwrap();
        core.free(off).unwrap();
        assert_eq!(core.used, 0);
    }
}
