use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("block pool exhausted: all {total} blocks are in use")]
    PoolExhausted { total: usize },

    #[error("attempted to free a block at {addr:#x} that was not allocated from this pool")]
    UnknownAddress { addr: u64 },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    #[error("global heap exhausted and the backing block allocator has no free blocks left")]
    OutOfMemory,

    #[error(transparent)]
    Block(#[from] BlockError),
}
