//! Fixed-size block pools.
//!
//! Each block is a header word followed by the payload. A free block's header
//! holds the offset of the next free block; an allocated block's header holds
//! the pool stamp, which is how release tells a live block from a stale or
//! foreign one.

use alloc::vec;
use alloc::vec::Vec;

use crate::arena::{handle, Slot};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::{kind, linked, Link, Ring};
use crate::state::KernelState;
use crate::suspend::{Blocking, QueueEnd, SuspendInfo, Timeout, WaitTarget, WakePayload};
use crate::thread::{ThreadId, ThreadState};
use crate::trace::{records::block_pool as rec, Payload};

handle!(
    /// Handle of a block pool.
    BlockPoolId
);

const HEADER: usize = 4;
const END_OF_LIST: u32 = u32::MAX;
const STAMP_TAG: u32 = 0xB10C_0000;

fn stamp_of(slot: Slot) -> u32 {
    STAMP_TAG | (slot.index() & 0xFFFF)
}

/// A block allocated from a [`BlockPoolId`] pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryBlock {
    pool: BlockPoolId,
    offset: u32,
}

impl MemoryBlock {
    pub fn pool(&self) -> BlockPoolId {
        self.pool
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: u32,
    pub free: u32,
    pub used: u32,
    /// Lowest free count observed since creation.
    pub min_free: u32,
}

pub(crate) struct BlockPoolCb {
    pub name: &'static str,
    pub block_size: usize,
    pub total: u32,
    pub available: u32,
    pub min_available: u32,
    pub storage: Vec<u8>,
    pub free_head: u32,
    pub stamp: u32,
    pub waiters: Ring<kind::Suspended>,
    pub created: Link,
}

linked!(BlockPoolCb, kind::Created, created);

impl BlockPoolCb {
    fn stride(&self) -> usize {
        HEADER + self.block_size
    }

    fn header(&self, block: u32) -> u32 {
        let at = block as usize;
        let mut word = [0; HEADER];
        word.copy_from_slice(&self.storage[at..at + HEADER]);
        u32::from_le_bytes(word)
    }

    fn set_header(&mut self, block: u32, value: u32) {
        let at = block as usize;
        self.storage[at..at + HEADER].copy_from_slice(&value.to_le_bytes());
    }

    /// Header offset of the payload at `offset`, when it names an allocated
    /// block of this pool.
    fn allocated_header(&self, offset: u32) -> Option<u32> {
        let header = (offset as usize).checked_sub(HEADER)?;
        if header % self.stride() != 0 || header >= self.storage.len() {
            return None;
        }
        let header = header as u32;
        (self.header(header) == self.stamp).then_some(header)
    }

    fn pop_free(&mut self) -> Option<u32> {
        if self.free_head == END_OF_LIST {
            return None;
        }
        let block = self.free_head;
        self.free_head = self.header(block);
        self.set_header(block, self.stamp);
        self.available -= 1;
        self.min_available = self.min_available.min(self.available);
        Some(block + HEADER as u32)
    }

    fn push_free(&mut self, header: u32) {
        self.set_header(header, self.free_head);
        self.free_head = header;
        self.available += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPoolInfo {
    pub name: &'static str,
    pub available: u32,
    pub total: u32,
    pub first_waiter: Option<ThreadId>,
    pub suspended_count: usize,
}

impl KernelState {
    fn block_pool_mut(&mut self, id: BlockPoolId) -> KernelResult<&mut BlockPoolCb> {
        self.block_pools.get_mut(id.0).ok_or(KernelError::PoolError)
    }
}

impl Kernel {
    /// Creates a pool of `blocks` blocks of `block_size` bytes. The size is
    /// rounded up to a whole number of words.
    pub fn block_pool_create(
        &self,
        name: &'static str,
        block_size: usize,
        blocks: u32,
    ) -> KernelResult<BlockPoolId> {
        if block_size == 0 || blocks == 0 {
            return Err(KernelError::SizeError);
        }
        let block_size = block_size.div_ceil(HEADER) * HEADER;
        let stride = HEADER + block_size;
        self.critical(|s| {
            let slot = s.block_pools.insert(BlockPoolCb {
                name,
                block_size,
                total: blocks,
                available: 0,
                min_available: blocks,
                storage: vec![0; stride * blocks as usize],
                free_head: END_OF_LIST,
                stamp: 0,
                waiters: Ring::default(),
                created: Link::default(),
            });
            let pool = s.block_pools.node_mut(slot.index());
            pool.stamp = stamp_of(slot);
            for block in (0..blocks).rev() {
                pool.push_free(block * stride as u32);
            }
            s.created.block_pools.push_back(&mut s.block_pools, slot.index());
            log::debug!("block pool '{name}' created: {blocks} x {block_size} bytes");
            s.trace(rec::CREATE, Payload::new().u32(slot.index()).u32(blocks));
            Ok(BlockPoolId(slot))
        })
    }

    /// Deletes the pool; every waiter resumes with [`KernelError::Deleted`].
    /// Outstanding blocks become invalid.
    pub fn block_pool_delete(&self, id: BlockPoolId) -> KernelResult<()> {
        self.critical(|s| {
            s.block_pool_mut(id)?;
            s.created.block_pools.remove(&mut s.block_pools, id.0.index());
            let pool = s.block_pools.remove(id.0).ok_or(KernelError::PoolError)?;
            log::debug!("block pool '{}' deleted", pool.name);
            s.trace(rec::DELETE, Payload::new().u32(id.0.index()));
            s.drain_deleted(pool.waiters);
            Ok(())
        })
    }

    pub fn block_allocate(
        &self,
        id: BlockPoolId,
        timeout: Timeout,
    ) -> KernelResult<Blocking<MemoryBlock>> {
        self.critical(|s| {
            let pool = s.block_pool_mut(id)?;
            if let Some(offset) = pool.pop_free() {
                let available = pool.available;
                s.trace(rec::ALLOCATE, Payload::new().u32(id.0.index()).u32(available));
                return Ok(Blocking::Complete(MemoryBlock { pool: id, offset }));
            }
            if timeout == Timeout::NoWait {
                return Err(KernelError::NoMemory);
            }
            let thread = s.blocking_caller()?;
            s.block_on(
                thread,
                WaitTarget::BlockPool(id),
                ThreadState::BlockMemory,
                SuspendInfo::None,
                QueueEnd::Back,
                timeout,
            );
            Ok(Blocking::Suspended)
        })
    }

    /// Returns `block` to its pool, or hands it straight to the first
    /// waiter. A block that is not currently allocated from a live pool is
    /// rejected with [`KernelError::PtrError`].
    pub fn block_release(&self, block: MemoryBlock) -> KernelResult<()> {
        self.critical(|s| {
            let id = block.pool;
            let pool = s.block_pools.get_mut(id.0).ok_or(KernelError::PtrError)?;
            let header = pool
                .allocated_header(block.offset)
                .ok_or(KernelError::PtrError)?;

            if let Some(waiter) = s.take_waiter(WaitTarget::BlockPool(id)) {
                s.trace(rec::RELEASE, Payload::new().u32(id.0.index()).u32(0));
                s.finish_wait(waiter, Ok(WakePayload::Block(block)));
                return Ok(());
            }
            let pool = s.block_pool_mut(id)?;
            pool.push_free(header);
            let available = pool.available;
            s.trace(rec::RELEASE, Payload::new().u32(id.0.index()).u32(available));
            Ok(())
        })
    }

    /// Runs `f` over the payload of `block` inside the critical section.
    /// `f` must not call back into the kernel.
    pub fn with_block<R>(
        &self,
        block: &MemoryBlock,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> KernelResult<R> {
        self.critical(|s| {
            let pool = s.block_pools.get_mut(block.pool.0).ok_or(KernelError::PtrError)?;
            pool.allocated_header(block.offset).ok_or(KernelError::PtrError)?;
            let start = block.offset as usize;
            let end = start + pool.block_size;
            Ok(f(&mut pool.storage[start..end]))
        })
    }

    pub fn block_pool_prioritize(&self, id: BlockPoolId) -> KernelResult<()> {
        self.critical(|s| {
            s.block_pool_mut(id)?;
            s.prioritize(WaitTarget::BlockPool(id));
            Ok(())
        })
    }

    pub fn block_pool_info(&self, id: BlockPoolId) -> KernelResult<BlockPoolInfo> {
        self.critical(|s| {
            let pool = s.block_pools.get(id.0).ok_or(KernelError::PoolError)?;
            Ok(BlockPoolInfo {
                name: pool.name,
                available: pool.available,
                total: pool.total,
                first_waiter: pool.waiters.head().map(|t| s.thread_id(t)),
                suspended_count: pool.waiters.len(),
            })
        })
    }

    pub fn block_pool_stats(&self, id: BlockPoolId) -> KernelResult<PoolStats> {
        self.critical(|s| {
            let pool = s.block_pools.get(id.0).ok_or(KernelError::PoolError)?;
            Ok(PoolStats {
                total: pool.total,
                free: pool.available,
                used: pool.total - pool.available,
                min_free: pool.min_available,
            })
        })
    }

    /// Block pools in creation order.
    pub fn block_pool_list(&self) -> Vec<BlockPoolId> {
        self.critical(|s| {
            s.created
                .block_pools
                .iter(&s.block_pools)
                .map(|index| BlockPoolId(s.block_pools.slot_of(index)))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelBuilder;

    fn take(kernel: &Kernel, pool: BlockPoolId) -> Result<MemoryBlock, KernelError> {
        kernel
            .block_allocate(pool, Timeout::NoWait)?
            .complete()
            .ok_or(KernelError::NoMemory)
    }

    #[test]
    fn blocks_are_handed_out_in_address_order() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let pool = kernel.block_pool_create("bp", 10, 3)?;
        let a = take(&kernel, pool)?;
        let b = take(&kernel, pool)?;
        assert_eq!(a.offset, 4);
        assert_eq!(b.offset, 4 + 16);

        let stats = kernel.block_pool_stats(pool)?;
        assert_eq!(stats, PoolStats { total: 3, free: 1, used: 2, min_free: 1 });
        Ok(())
    }

    #[test]
    fn double_release_is_rejected() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let pool = kernel.block_pool_create("bp", 8, 2)?;
        let block = take(&kernel, pool)?;
        let copy = block.clone();
        kernel.block_release(block)?;
        assert_eq!(kernel.block_release(copy), Err(KernelError::PtrError));
        assert_eq!(kernel.block_pool_info(pool)?.available, 2);
        Ok(())
    }

    #[test]
    fn foreign_and_misaligned_blocks_are_rejected() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let first = kernel.block_pool_create("a", 8, 2)?;
        let second = kernel.block_pool_create("b", 8, 2)?;
        let block = take(&kernel, first)?;
        let forged = MemoryBlock {
            pool: second,
            offset: block.offset,
        };
        assert_eq!(kernel.block_release(forged), Err(KernelError::PtrError));
        let skewed = MemoryBlock {
            pool: first,
            offset: block.offset + 4,
        };
        assert_eq!(kernel.block_release(skewed), Err(KernelError::PtrError));
        Ok(())
    }

    #[test]
    fn payload_is_writable() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let pool = kernel.block_pool_create("bp", 6, 1)?;
        let block = take(&kernel, pool)?;
        let len = kernel.with_block(&block, |bytes| {
            bytes.fill(0xAA);
            bytes.len()
        })?;
        assert_eq!(len, 8);
        assert_eq!(kernel.with_block(&block, |bytes| bytes[7])?, 0xAA);
        assert_eq!(
            kernel.block_allocate(pool, Timeout::NoWait),
            Err(KernelError::NoMemory)
        );
        Ok(())
    }
}
