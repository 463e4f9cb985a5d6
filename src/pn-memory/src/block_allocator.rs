//! The 2 MiB-granular physical block pool. Grounded on `bmalloc`/`bfree`/`bmalloc_total`/
//! `bmalloc_used` in the original kernel's `gmalloc.c`: a fixed-size pool of block addresses,
//! each tagged in-use or free, handed out by a first-fit linear scan.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{error::BlockError, layout::BLOCK_SIZE};

/// A single physical block handed out by [`BlockAllocator::alloc`]. Carries its address, not a
/// borrow of the pool, since consumers (the guest's page tables, the [`GlobalHeap`] extending
/// itself) outlive any one call into the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub addr: u64,
}

impl Block {
    pub const SIZE: u64 = BLOCK_SIZE;

    pub fn end(&self) -> u64 {
        self.addr + Self::SIZE
    }
}

struct Inner {
    addrs: Vec<u64>,
    used: Vec<bool>,
}

/// A fixed pool of 2 MiB-aligned physical blocks, each either free or in use.
///
/// The pool's extent is fixed at construction (from [`MemoryMap::block_starts`]
/// (crate::MemoryMap)); this type only tracks which of those addresses are currently checked
/// out. Unlike the original `bfree`, which silently ignores a free of an address it doesn't
/// recognize, [`BlockAllocator::free`] here reports [`BlockError::UnknownAddress`] so that a
/// caller's bookkeeping bug doesn't vanish silently.
pub struct BlockAllocator {
    inner: Mutex<Inner>,
    used_count: AtomicUsize,
    total: usize,
}

impl BlockAllocator {
    pub fn new(mut addrs: Vec<u64>) -> Self {
        addrs.sort_unstable();
        addrs.dedup();

        let total = addrs.len();
        let used = vec![false; total];

        Self {
            inner: Mutex::new(Inner { addrs, used }),
            used_count: AtomicUsize::new(0),
            total,
        }
    }

    /// Returns the first free block, marking it in use. First-fit, `O(n)` in the size of the
    /// pool, matching `bmalloc`'s linear scan.
    pub fn alloc(&self) -> Result<Block, BlockError> {
        let mut inner = self.inner.lock();

        for i in 0..inner.addrs.len() {
            if !inner.used[i] {
                inner.used[i] = true;
                self.used_count.fetch_add(1, Ordering::Relaxed);
                return Ok(Block {
                    addr: inner.addrs[i],
                });
            }
        }

        Err(BlockError::PoolExhausted { total: self.total })
    }

    /// Returns `block` to the pool. Errors if `block`'s address was never part of this pool, or
    /// is not currently checked out (a double free).
    pub fn free(&self, block: Block) -> Result<(), BlockError> {
        let mut inner = self.inner.lock();

        let Some(i) = inner.addrs.iter().position(|&a| a == block.addr) else {
            return Err(BlockError::UnknownAddress { addr: block.addr });
        };

        if !inner.used[i] {
            return Err(BlockError::UnknownAddress { addr: block.addr });
        }

        inner.used[i] = false;
        self.used_count.fetch_sub(1, Ordering::Relaxed);

        Ok(())
    }

    pub fn total_bytes(&self) -> usize {
        self.total * Block::SIZE as usize
    }

    pub fn used_bytes(&self) -> usize {
        self.used_count.load(Ordering::Relaxed) * Block::SIZE as usize
    }

    pub fn total_blocks(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> BlockAllocator {
        BlockAllocator::new((0..n as u64).map(|i| i * BLOCK_SIZE).collect())
    }

    #[test]
    fn alloc_then_free_allows_reuse() {
        let pool = pool(2);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a.addr, b.addr);
        assert!(pool.alloc().is_err());

        pool.free(a).unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(c.addr, a.addr);
    }

    #[test]
    fn free_unknown_address_is_an_error() {
        let pool = pool(1);
        assert_eq!(
            pool.free(Block { addr: 0xdead_0000 }),
            Err(BlockError::UnknownAddress { addr: 0xdead_0000 })
        );
    }

    #[test]
    fn double_free_is_an_error() {
        let pool = pool(1);
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        assert!(pool.free(a).is_err());
    }

    #[test]
    fn accounting_tracks_used_and_total() {
        let pool = pool(4);
        assert_eq!(pool.total_bytes(), 4 * BLOCK_SIZE as usize);
        assert_eq!(pool.used_bytes(), 0);

        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert_eq!(pool.used_bytes(), 2 * BLOCK_SIZE as usize);
    }
}
