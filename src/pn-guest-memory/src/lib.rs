//! Assembles a VM's guest-visible address space out of the 2 MiB physical blocks handed out by
//! [`pn_memory::BlockAllocator`]. Grounded on the teacher's `kernel` crate (`vm-memory` +
//! `utils`, no further source retrieved for it in this pack) and `pn_util::GuestMemoryExt`,
//! which this crate's byte-range helpers are built directly on top of.
//!
//! This workspace has no real firmware page tables: a block's address (as handed out by the
//! block allocator) *is* its guest-physical address, since guest memory is pre-pinned and
//! identity-mapped (spec.md §1 Non-goals: "no paging of guest memory"). Building a
//! [`GuestMemoryMmap`] out of a block list is therefore just `GuestMemoryMmap::from_ranges` over
//! each block's `(addr, size)`, exactly as the original's guest memory is a flat array of
//! pinned 2 MiB pages.

use pn_memory::Block;
use pn_util::GuestMemoryExt;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

#[derive(Debug, Error)]
pub enum GuestMemoryBuildError {
    #[error("cannot build guest memory from an empty block list")]
    Empty,

    #[error("failed to map guest memory: {0}")]
    Mmap(#[source] vm_memory::Error),
}

#[derive(Debug, Error)]
pub enum GuestMemoryAccessError {
    #[error("offset {offset:#x} is out of range for a {total:#x}-byte block list")]
    OutOfRange { offset: u64, total: u64 },

    #[error(transparent)]
    Memory(#[from] vm_memory::GuestMemoryError),
}

/// Builds the [`GuestMemoryMmap`] backing one VM's `memory` or `storage` block list. Blocks need
/// not be contiguous; each becomes its own `vm-memory` region at its own address, sorted by
/// address first since `GuestMemoryMmap::from_ranges` requires non-overlapping, ascending
/// regions.
pub fn build_guest_memory(blocks: &[Block]) -> Result<GuestMemoryMmap, GuestMemoryBuildError> {
    if blocks.is_empty() {
        return Err(GuestMemoryBuildError::Empty);
    }

    let mut sorted = blocks.to_vec();
    sorted.sort_unstable_by_key(|b| b.addr);

    let ranges: Vec<(GuestAddress, usize)> = sorted
        .iter()
        .map(|b| (GuestAddress(b.addr), Block::SIZE as usize))
        .collect();

    GuestMemoryMmap::from_ranges(&ranges).map_err(GuestMemoryBuildError::Mmap)
}

/// A block list's memory viewed as one flat, byte-addressable span, for `vm_storage_*` (spec.md
/// §4.7). Blocks are assumed contiguous-by-index but not necessarily contiguous-by-address;
/// reads/writes are clamped to the owning block's remainder exactly as spec.md requires
/// ("a single read call returns at most one block's worth of contiguous bytes").
pub struct BlockList<'a> {
    blocks: &'a [Block],
    mem: &'a GuestMemoryMmap,
}

impl<'a> BlockList<'a> {
    pub fn new(blocks: &'a [Block], mem: &'a GuestMemoryMmap) -> Self {
        Self { blocks, mem }
    }

    pub fn total_bytes(&self) -> u64 {
        self.blocks.len() as u64 * Block::SIZE
    }

    /// Resolves a flat `offset` into `(block_addr, offset_within_block, bytes_left_in_block)`.
    fn locate(&self, offset: u64) -> Result<(u64, u64, u64), GuestMemoryAccessError> {
        let total = self.total_bytes();
        if offset >= total {
            return Err(GuestMemoryAccessError::OutOfRange { offset, total });
        }

        let block_index = (offset / Block::SIZE) as usize;
        let within = offset % Block::SIZE;
        let block = self.blocks[block_index];

        Ok((block.addr, within, Block::SIZE - within))
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, clamped to the remainder of the block
    /// `offset` falls in. Returns the number of bytes actually read.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, GuestMemoryAccessError> {
        let (block_addr, within, remaining) = self.locate(offset)?;
        let n = buf.len().min(remaining as usize);
        let slice = self.mem.get_slice_fast(GuestAddress(block_addr + within), n)?;
        // Safe: `n` was computed from the slice's own length.
        unsafe {
            std::ptr::copy_nonoverlapping(slice.ptr_guard().as_ptr(), buf.as_mut_ptr(), n);
        }
        Ok(n)
    }

    /// Writes `src`, spanning as many blocks as needed, starting at `offset`. Returns the number
    /// of bytes actually written (short only if `offset + src.len()` runs past the block list).
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<usize, GuestMemoryAccessError> {
        let mut written = 0usize;
        while written < src.len() {
            let (block_addr, within, remaining) = match self.locate(offset + written as u64) {
                Ok(v) => v,
                Err(_) if written > 0 => break,
                Err(e) => return Err(e),
            };

            let chunk_len = (src.len() - written).min(remaining as usize);
            self.mem
                .write_slice(&src[written..written + chunk_len], GuestAddress(block_addr + within))?;
            written += chunk_len;
        }
        Ok(written)
    }

    /// Zeroes every byte in the block list ("lazy clean up" on VM start, spec.md §4.7).
    pub fn clear(&self) -> Result<(), GuestMemoryAccessError> {
        let zeros = vec![0u8; Block::SIZE as usize];
        for block in self.blocks {
            self.mem.write_slice(&zeros, GuestAddress(block.addr))?;
        }
        Ok(())
    }

    /// Feeds the first `size` bytes of the block list into `hasher` in block order, for
    /// `vm_storage_md5` (spec.md §4.7).
    pub fn digest_into(&self, size: u64, hasher: &mut md5::Md5) -> Result<(), GuestMemoryAccessError> {
        use md5::Digest;

        let mut remaining = size.min(self.total_bytes());
        let mut offset = 0u64;
        let mut buf = vec![0u8; Block::SIZE as usize];

        while remaining > 0 {
            let want = remaining.min(Block::SIZE) as usize;
            let n = self.read(offset, &mut buf[..want])?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            offset += n as u64;
            remaining -= n as u64;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(addrs: &[u64]) -> Vec<Block> {
        addrs.iter().map(|&addr| Block { addr }).collect()
    }

    #[test]
    fn build_rejects_empty_block_list() {
        assert!(matches!(
            build_guest_memory(&[]),
            Err(GuestMemoryBuildError::Empty)
        ));
    }

    #[test]
    fn write_then_read_round_trips_within_one_block() {
        let bs = blocks(&[0x10_0000_0000]);
        let mem = build_guest_memory(&bs).unwrap();
        let list = BlockList::new(&bs, &mem);

        list.write(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = list.read(0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_spans_blocks_read_is_clamped_to_one_block() {
        let bs = blocks(&[0x10_0000_0000, 0x10_0020_0000]);
        let mem = build_guest_memory(&bs).unwrap();
        let list = BlockList::new(&bs, &mem);

        let payload = vec![0xABu8; (Block::SIZE as usize) + 16];
        let written = list.write(0, &payload).unwrap();
        assert_eq!(written, payload.len());

        // A single read at the block boundary returns at most the remainder of that block.
        let mut buf = vec![0u8; 64];
        let n = list
            .read(Block::SIZE - 8, &mut buf)
            .unwrap();
        assert_eq!(n, 8);
    }

    #[test]
    fn clear_zeroes_every_block() {
        let bs = blocks(&[0x10_0000_0000]);
        let mem = build_guest_memory(&bs).unwrap();
        let list = BlockList::new(&bs, &mem);

        list.write(0, &[0xFFu8; 32]).unwrap();
        list.clear().unwrap();

        let mut buf = [1u8; 32];
        list.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn digest_matches_reference_md5() {
        use md5::Digest;

        let bs = blocks(&[0x10_0000_0000]);
        let mem = build_guest_memory(&bs).unwrap();
        let list = BlockList::new(&bs, &mem);

        let payload = b"the quick brown fox";
        list.write(0, payload).unwrap();

        let mut hasher = md5::Md5::new();
        list.digest_into(payload.len() as u64, &mut hasher).unwrap();
        let got = hasher.finalize();

        let mut reference = md5::Md5::new();
        reference.update(payload);
        let want = reference.finalize();

        assert_eq!(got, want);
    }

    #[test]
    fn out_of_range_offset_errors() {
        let bs = blocks(&[0x10_0000_0000]);
        let mem = build_guest_memory(&bs).unwrap();
        let list = BlockList::new(&bs, &mem);

        let mut buf = [0u8; 4];
        assert!(list.read(Block::SIZE, &mut buf).is_err());
    }
}
