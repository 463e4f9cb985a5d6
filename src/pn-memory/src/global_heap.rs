//! The byte-granular global heap. Grounded on `gmalloc`/`gfree`/`grealloc`/`gcalloc` in the
//! original kernel's `gmalloc.c`: a heap that, on exhaustion, pulls one whole block from the
//! [`BlockAllocator`] and registers it as a new free area before retrying, rather than failing
//! outright.
//!
//! Unlike the TLSF pool the original links against, this keeps an explicit address-sorted free
//! list (in the style of the linked-list allocator used elsewhere in this workspace's reference
//! material) since this heap only does address-space bookkeeping — it hands out physical
//! addresses for the caller to back with real bytes via [`pn_guest_memory`](../pn_guest_memory),
//! it does not itself own a byte arena.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use counter::TotalCounter;

use crate::{
    block_allocator::{Block, BlockAllocator},
    error::HeapError,
    memory_map::Region,
};

counter::counter! {
    GHEAP_EXTENSIONS_TOTAL: TotalCounter = TotalCounter::new("gheap.extensions.total");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRegion {
    addr: u64,
    size: u64,
}

struct Inner {
    /// Sorted by `addr`, no two entries touching or overlapping.
    free: Vec<FreeRegion>,
    allocations: HashMap<u64, u64>,
    total_bytes: u64,
}

fn try_alloc_locked(inner: &mut Inner, size: u64) -> Option<u64> {
    let i = inner.free.iter().position(|r| r.size >= size)?;
    let region = inner.free[i];

    if region.size == size {
        inner.free.remove(i);
    } else {
        inner.free[i] = FreeRegion {
            addr: region.addr + size,
            size: region.size - size,
        };
    }

    inner.allocations.insert(region.addr, size);
    Some(region.addr)
}

fn insert_free_locked(inner: &mut Inner, addr: u64, size: u64) {
    let pos = inner.free.partition_point(|r| r.addr < addr);

    let merges_with_next = inner
        .free
        .get(pos)
        .is_some_and(|next| addr + size == next.addr);
    let merges_with_prev = pos > 0 && {
        let prev = inner.free[pos - 1];
        prev.addr + prev.size == addr
    };

    match (merges_with_prev, merges_with_next) {
        (true, true) => {
            let next = inner.free.remove(pos);
            inner.free[pos - 1].size += size + next.size;
        }
        (true, false) => {
            inner.free[pos - 1].size += size;
        }
        (false, true) => {
            inner.free[pos].addr = addr;
            inner.free[pos].size += size;
        }
        (false, false) => {
            inner.free.insert(pos, FreeRegion { addr, size });
        }
    }
}

/// Auto-extending byte-granular physical address space allocator.
pub struct GlobalHeap {
    blocks: Arc<BlockAllocator>,
    inner: Mutex<Inner>,
}

impl GlobalHeap {
    pub fn new(regions: Vec<Region>, blocks: Arc<BlockAllocator>) -> Self {
        let mut free: Vec<FreeRegion> = regions
            .into_iter()
            .filter(|r| !r.is_empty())
            .map(|r| FreeRegion {
                addr: r.start,
                size: r.len(),
            })
            .collect();
        free.sort_unstable_by_key(|r| r.addr);

        let total_bytes = free.iter().map(|r| r.size).sum();

        Self {
            blocks,
            inner: Mutex::new(Inner {
                free,
                allocations: HashMap::new(),
                total_bytes,
            }),
        }
    }

    /// Allocates `size` bytes, extending the heap with whole blocks from the backing
    /// [`BlockAllocator`] as many times as needed if the heap can't currently satisfy the
    /// request. Fails only once the block allocator itself is exhausted.
    pub fn alloc(&self, size: u64) -> Result<u64, HeapError> {
        let size = size.max(1);

        loop {
            let mut inner = self.inner.lock();
            if let Some(addr) = try_alloc_locked(&mut inner, size) {
                return Ok(addr);
            }
            drop(inner);

            // spec.md §7: "GlobalHeap exhaustion logs a warning and continues iterating (it may
            // succeed after block-allocator extension)".
            tracing::warn!(size, "gmalloc exhausted current areas, extending from block allocator");
            let block = self.blocks.alloc()?;
            GHEAP_EXTENSIONS_TOTAL.count();

            let mut inner = self.inner.lock();
            insert_free_locked(&mut inner, block.addr, Block::SIZE);
            inner.total_bytes += Block::SIZE;
        }
    }

    /// Returns a previously allocated address to the heap, coalescing it with any adjacent free
    /// regions. Note that this never hands blocks back to the [`BlockAllocator`]: once extended,
    /// the heap keeps the capacity, matching the original's one-way growth.
    pub fn free(&self, addr: u64) -> Result<(), HeapError> {
        let mut inner = self.inner.lock();

        let Some(size) = inner.allocations.remove(&addr) else {
            return Err(HeapError::Block(crate::error::BlockError::UnknownAddress { addr }));
        };

        insert_free_locked(&mut inner, addr, size);
        Ok(())
    }

    /// Resizes an allocation. The caller is responsible for copying any live bytes from `addr`
    /// to the returned address when they differ — this layer only tracks address-space
    /// ownership, not a byte arena.
    pub fn realloc(&self, addr: u64, new_size: u64) -> Result<u64, HeapError> {
        self.free(addr)?;
        self.alloc(new_size)
    }

    /// Allocates `nmemb * size` bytes. The caller is responsible for zeroing the returned range.
    pub fn calloc(&self, nmemb: u64, size: u64) -> Result<u64, HeapError> {
        self.alloc(nmemb.saturating_mul(size))
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        inner.total_bytes - inner.free.iter().map(|r| r.size).sum::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BLOCK_SIZE;

    fn heap_with_blocks(region: Region, block_count: usize) -> GlobalHeap {
        let blocks = Arc::new(BlockAllocator::new(
            (0..block_count as u64)
                .map(|i| (region.end + 1) + i * BLOCK_SIZE)
                .collect(),
        ));
        GlobalHeap::new(vec![region], blocks)
    }

    #[test]
    fn basic_alloc_free_reuse() {
        let heap = heap_with_blocks(Region::new(0x1000, 0x2000), 0);

        let a = heap.alloc(0x100).unwrap();
        let b = heap.alloc(0x100).unwrap();
        assert_ne!(a, b);

        heap.free(a).unwrap();
        let c = heap.alloc(0x100).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn free_unknown_address_errors() {
        let heap = heap_with_blocks(Region::new(0x1000, 0x2000), 0);
        assert!(heap.free(0xbeef).is_err());
    }

    #[test]
    fn exhaustion_extends_from_block_allocator() {
        // A heap with a tiny region that can satisfy exactly one request; the next request must
        // trigger an automatic extension from the block pool.
        let heap = heap_with_blocks(Region::new(0x1000, 0x1010), 1);

        let _a = heap.alloc(0x10).unwrap();
        assert_eq!(heap.total_bytes(), 0x10);

        // This must succeed only because the heap pulls a new block in.
        let _b = heap.alloc(0x10).unwrap();
        assert_eq!(heap.total_bytes(), 0x10 + BLOCK_SIZE);
    }

    #[test]
    fn exhaustion_with_no_blocks_left_is_an_error() {
        let heap = heap_with_blocks(Region::new(0x1000, 0x1010), 0);

        let _a = heap.alloc(0x10).unwrap();
        assert!(heap.alloc(0x10).is_err());
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let heap = heap_with_blocks(Region::new(0x1000, 0x3000), 0);

        let a = heap.alloc(0x1000).unwrap();
        let b = heap.alloc(0x1000).unwrap();
        assert_eq!(b, a + 0x1000);

        heap.free(a).unwrap();
        heap.free(b).unwrap();

        // A single coalesced free region should be able to satisfy a full-size request again.
        let c = heap.alloc(0x2000).unwrap();
        assert_eq!(c, a);
    }
}
