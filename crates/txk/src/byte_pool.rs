//! Variable-size byte pools.
//!
//! The pool storage carries its own block list. Every block starts with a
//! 4-byte header holding the offset of the next block, with [`OWNED`] set
//! while the block is allocated. A permanently owned sentinel header at the
//! end closes the ring back to offset 0.
//!
//! Allocation is first fit from a rotating search cursor. Release merges the
//! block with free physical neighbours and then serves suspended requests in
//! FIFO order for as long as they fit.

use alloc::vec;
use alloc::vec::Vec;

use crate::arena::handle;
use crate::error::{FatalError, KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::{kind, linked, Link, Ring};
use crate::state::KernelState;
use crate::suspend::{Blocking, QueueEnd, SuspendInfo, Timeout, WaitTarget, WakePayload};
use crate::thread::{ThreadId, ThreadState};
use crate::trace::{records::byte_pool as rec, Payload};

handle!(
    /// Handle of a byte pool.
    BytePoolId
);

const HEADER: u32 = 4;
const ALIGN: u32 = 4;
/// Smallest payload worth splitting off into a free block of its own.
const MIN_PAYLOAD: u32 = 12;
const OWNED: u32 = 0x8000_0000;

/// A block header links backwards or outside the pool.
#[derive(Debug, PartialEq, Eq)]
struct BrokenList;

/// Memory allocated from a [`BytePoolId`] pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ByteBlock {
    pool: BytePoolId,
    offset: u32,
    len: u32,
}

impl ByteBlock {
    pub fn pool(&self) -> BytePoolId {
        self.pool
    }

    /// Usable length: the requested size rounded up to whole words.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BytePoolStats {
    pub available: u32,
    pub fragments: u32,
    pub searches: u32,
    pub splits: u32,
    pub merges: u32,
}

pub(crate) struct BytePoolCb {
    pub name: &'static str,
    pub storage: Vec<u8>,
    /// Free payload bytes.
    pub available: u32,
    /// Blocks in the list, sentinel included.
    pub fragments: u32,
    pub cursor: u32,
    pub searches: u32,
    pub splits: u32,
    pub merges: u32,
    pub waiters: Ring<kind::Suspended>,
    pub created: Link,
}

linked!(BytePoolCb, kind::Created, created);

impl BytePoolCb {
    fn new(name: &'static str, size: u32) -> Self {
        let sentinel = size - HEADER;
        let mut pool = Self {
            name,
            storage: vec![0; size as usize],
            available: sentinel - HEADER,
            fragments: 2,
            cursor: 0,
            searches: 0,
            splits: 0,
            merges: 0,
            waiters: Ring::default(),
            created: Link::default(),
        };
        pool.write(0, sentinel);
        pool.write(sentinel, OWNED);
        pool
    }

    fn read(&self, at: u32) -> u32 {
        let at = at as usize;
        let mut word = [0; 4];
        word.copy_from_slice(&self.storage[at..at + 4]);
        u32::from_le_bytes(word)
    }

    fn write(&mut self, at: u32, value: u32) {
        let at = at as usize;
        self.storage[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn sentinel(&self) -> u32 {
        self.storage.len() as u32 - HEADER
    }

    fn next(&self, block: u32) -> u32 {
        self.read(block) & !OWNED
    }

    /// Block physically before `block`, found by walking the list.
    fn prev(&self, block: u32) -> Option<u32> {
        if block == 0 {
            return None;
        }
        let mut at = 0;
        for _ in 0..self.fragments {
            let next = self.next(at);
            if next == block {
                return Some(at);
            }
            at = next;
        }
        None
    }

    fn owned(&self, block: u32) -> bool {
        self.read(block) & OWNED != 0
    }

    fn set_next(&mut self, block: u32, next: u32, owned: bool) {
        self.write(block, if owned { next | OWNED } else { next });
    }

    /// Payload bytes of a non-sentinel block.
    fn payload(&self, block: u32) -> u32 {
        self.next(block) - block - HEADER
    }

    /// First-fit search from the cursor. Marks the chosen block owned,
    /// splitting off the remainder when it is large enough, and returns the
    /// payload offset.
    fn search(&mut self, size: u32) -> Result<Option<u32>, BrokenList> {
        if size > self.available {
            return Ok(None);
        }
        self.searches += 1;
        let sentinel = self.sentinel();
        let mut block = self.cursor;
        for _ in 0..self.fragments {
            if block == sentinel {
                block = 0;
                continue;
            }
            let next = self.next(block);
            if next <= block || next > sentinel {
                return Err(BrokenList);
            }
            if !self.owned(block) && next - block - HEADER >= size {
                self.claim(block, size);
                return Ok(Some(block + HEADER));
            }
            block = next;
        }
        Ok(None)
    }

    fn claim(&mut self, block: u32, size: u32) {
        let next = self.next(block);
        let payload = self.payload(block);
        if payload - size >= HEADER + MIN_PAYLOAD {
            let rest = block + HEADER + size;
            self.set_next(rest, next, false);
            self.set_next(block, rest, true);
            self.fragments += 1;
            self.splits += 1;
            self.available -= size + HEADER;
            self.cursor = rest;
        } else {
            self.set_next(block, next, true);
            self.available -= payload;
            self.cursor = next;
        }
    }

    /// Header offset of the allocated block whose payload starts at
    /// `offset`. Walks the list so that arbitrary offsets are rejected.
    fn allocated_header(&self, offset: u32) -> Option<u32> {
        let header = offset.checked_sub(HEADER)?;
        let sentinel = self.sentinel();
        let mut block = 0;
        for _ in 0..self.fragments {
            if block == header {
                return (block != sentinel && self.owned(block)).then_some(block);
            }
            block = self.next(block);
        }
        None
    }

    /// Absorbs the block after `block` into it.
    fn absorb_next(&mut self, block: u32) {
        let victim = self.next(block);
        let after = self.next(victim);
        self.set_next(block, after, false);
        if self.cursor == victim {
            self.cursor = block;
        }
        self.fragments -= 1;
        self.merges += 1;
        self.available += HEADER;
    }

    fn free(&mut self, block: u32) {
        let next = self.next(block);
        self.set_next(block, next, false);
        self.available += self.payload(block);

        if next != self.sentinel() && !self.owned(next) {
            self.absorb_next(block);
        }
        if let Some(prev) = self.prev(block).filter(|&prev| !self.owned(prev)) {
            self.absorb_next(prev);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePoolInfo {
    pub name: &'static str,
    pub available: u32,
    pub fragments: u32,
    pub first_waiter: Option<ThreadId>,
    pub suspended_count: usize,
}

fn round_up(size: usize) -> KernelResult<u32> {
    let size = u32::try_from(size).map_err(|_| KernelError::SizeError)?;
    size.checked_next_multiple_of(ALIGN).ok_or(KernelError::SizeError)
}

impl KernelState {
    fn byte_pool_mut(&mut self, id: BytePoolId) -> KernelResult<&mut BytePoolCb> {
        self.byte_pools.get_mut(id.0).ok_or(KernelError::PoolError)
    }

    /// Serves suspended requests in arrival order until one does not fit.
    fn serve_byte_waiters(&mut self, id: BytePoolId) {
        let target = WaitTarget::BytePool(id);
        while let Some(waiter) = self.first_waiter(target) {
            let SuspendInfo::Bytes(size) = self.threads.node(waiter).suspend_info else {
                break;
            };
            let Some(pool) = self.byte_pools.get_mut(id.0) else {
                break;
            };
            let offset = match pool.search(size) {
                Ok(Some(offset)) => offset,
                Ok(None) => break,
                Err(BrokenList) => {
                    self.raise(FatalError::Corrupted { index: id.0.index() });
                    break;
                }
            };
            self.take_waiter(target);
            let block = ByteBlock {
                pool: id,
                offset,
                len: size,
            };
            self.finish_wait(waiter, Ok(WakePayload::Bytes(block)));
        }
    }
}

impl Kernel {
    /// Creates a pool managing `size` bytes (rounded down to whole words).
    pub fn byte_pool_create(&self, name: &'static str, size: usize) -> KernelResult<BytePoolId> {
        let size = u32::try_from(size).map_err(|_| KernelError::SizeError)? & !(ALIGN - 1);
        if size < 2 * HEADER + MIN_PAYLOAD || size & OWNED != 0 {
            return Err(KernelError::SizeError);
        }
        self.critical(|s| {
            let slot = s.byte_pools.insert(BytePoolCb::new(name, size));
            s.created.byte_pools.push_back(&mut s.byte_pools, slot.index());
            log::debug!("byte pool '{name}' created with {size} bytes");
            s.trace(rec::CREATE, Payload::new().u32(slot.index()).u32(size));
            Ok(BytePoolId(slot))
        })
    }

    /// Deletes the pool; every waiter resumes with [`KernelError::Deleted`].
    pub fn byte_pool_delete(&self, id: BytePoolId) -> KernelResult<()> {
        self.critical(|s| {
            s.byte_pool_mut(id)?;
            s.created.byte_pools.remove(&mut s.byte_pools, id.0.index());
            let pool = s.byte_pools.remove(id.0).ok_or(KernelError::PoolError)?;
            log::debug!("byte pool '{}' deleted", pool.name);
            s.trace(rec::DELETE, Payload::new().u32(id.0.index()));
            s.drain_deleted(pool.waiters);
            Ok(())
        })
    }

    /// Allocates `size` bytes, waiting up to `timeout` for memory to be
    /// released.
    pub fn byte_allocate(
        &self,
        id: BytePoolId,
        size: usize,
        timeout: Timeout,
    ) -> KernelResult<Blocking<ByteBlock>> {
        if size == 0 {
            return Err(KernelError::SizeError);
        }
        let size = round_up(size)?;
        self.critical(|s| {
            let pool = s.byte_pool_mut(id)?;
            if size > pool.storage.len() as u32 {
                return Err(KernelError::SizeError);
            }
            match pool.search(size) {
                Ok(Some(offset)) => {
                    let available = pool.available;
                    s.trace(rec::ALLOCATE, Payload::new().u32(id.0.index()).u32(available));
                    return Ok(Blocking::Complete(ByteBlock {
                        pool: id,
                        offset,
                        len: size,
                    }));
                }
                Ok(None) => {}
                Err(BrokenList) => {
                    s.raise(FatalError::Corrupted { index: id.0.index() });
                    return Err(KernelError::PoolError);
                }
            }
            if timeout == Timeout::NoWait {
                return Err(KernelError::NoMemory);
            }
            let thread = s.blocking_caller()?;
            s.block_on(
                thread,
                WaitTarget::BytePool(id),
                ThreadState::ByteMemory,
                SuspendInfo::Bytes(size),
                QueueEnd::Back,
                timeout,
            );
            Ok(Blocking::Suspended)
        })
    }

    /// Returns `block` to its pool and serves waiting requests.
    pub fn byte_release(&self, block: ByteBlock) -> KernelResult<()> {
        self.critical(|s| {
            let id = block.pool;
            let pool = s.byte_pools.get_mut(id.0).ok_or(KernelError::PtrError)?;
            let header = pool
                .allocated_header(block.offset)
                .ok_or(KernelError::PtrError)?;
            pool.free(header);
            let available = pool.available;
            s.trace(rec::RELEASE, Payload::new().u32(id.0.index()).u32(available));
            s.serve_byte_waiters(id);
            Ok(())
        })
    }

    /// Runs `f` over the bytes of `block` inside the critical section.
    /// `f` must not call back into the kernel.
    pub fn with_bytes<R>(&self, block: &ByteBlock, f: impl FnOnce(&mut [u8]) -> R) -> KernelResult<R> {
        self.critical(|s| {
            let pool = s.byte_pools.get_mut(block.pool.0).ok_or(KernelError::PtrError)?;
            pool.allocated_header(block.offset).ok_or(KernelError::PtrError)?;
            let start = block.offset as usize;
            Ok(f(&mut pool.storage[start..start + block.len as usize]))
        })
    }

    pub fn byte_pool_prioritize(&self, id: BytePoolId) -> KernelResult<()> {
        self.critical(|s| {
            s.byte_pool_mut(id)?;
            s.prioritize(WaitTarget::BytePool(id));
            Ok(())
        })
    }

    pub fn byte_pool_info(&self, id: BytePoolId) -> KernelResult<BytePoolInfo> {
        self.critical(|s| {
            let pool = s.byte_pools.get(id.0).ok_or(KernelError::PoolError)?;
            Ok(BytePoolInfo {
                name: pool.name,
                available: pool.available,
                fragments: pool.fragments,
                first_waiter: pool.waiters.head().map(|t| s.thread_id(t)),
                suspended_count: pool.waiters.len(),
            })
        })
    }

    pub fn byte_pool_stats(&self, id: BytePoolId) -> KernelResult<BytePoolStats> {
        self.critical(|s| {
            let pool = s.byte_pools.get(id.0).ok_or(KernelError::PoolError)?;
            Ok(BytePoolStats {
                available: pool.available,
                fragments: pool.fragments,
                searches: pool.searches,
                splits: pool.splits,
                merges: pool.merges,
            })
        })
    }

    /// Byte pools in creation order.
    pub fn byte_pool_list(&self) -> Vec<BytePoolId> {
        self.critical(|s| {
            s.created
                .byte_pools
                .iter(&s.byte_pools)
                .map(|index| BytePoolId(s.byte_pools.slot_of(index)))
                .collect()
        })
    }
}
