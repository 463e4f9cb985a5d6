use thiserror::Error;

use crate::message::IccMessageType;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IccError {
    #[error("no handler registered for ICC message type {0:?}")]
    NoHandler(IccMessageType),

    #[error("a handler for ICC message type {0:?} is already registered")]
    HandlerAlreadyRegistered(IccMessageType),

    #[error("ICC mailbox for core {core} is full ({capacity} slots in use)")]
    PoolExhausted { core: u32, capacity: usize },

    #[error("ICC message to core {core} was reposted {retries} times without success, giving up")]
    RetryExhausted { core: u32, retries: u32 },

    #[error("core {0} is not registered with this ICC router")]
    UnknownCore(u32),
}
