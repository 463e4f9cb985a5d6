pub mod block_allocator;
pub mod castable_ref;
pub mod dyn_ptr;
pub mod error;
pub mod global_heap;
pub mod layout;
pub mod memory_map;

pub use block_allocator::{Block, BlockAllocator};
pub use castable_ref::CastableRef;
pub use dyn_ptr::{CloneDynRef, DynMut, DynRef};
pub use error::{BlockError, HeapError};
pub use global_heap::GlobalHeap;
pub use memory_map::{MemoryMap, Region};
