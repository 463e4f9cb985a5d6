pub mod dispatcher;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod shutdown;

pub use dispatcher::{IccHandler, IccHandlerTable};
pub use error::IccError;
pub use mailbox::{IccRouter, DEFAULT_MAILBOX_CAPACITY};
pub use message::{
    IccMessage, IccMessageType, IccPayload, StartedPayload, StdioRingHandle, StoppedPayload,
    ICC_RETRY_LATER, MAX_RETRIES, PAUSE_VECTOR,
};
pub use shutdown::{VmShutdownPhase, VmShutdownSignal};
