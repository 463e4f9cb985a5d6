//! The ICC wire vocabulary. Grounded on the `{type, apic_id, result, data}` record and the
//! START/STARTED/PAUSE/PAUSED/RESUME/RESUMED/STOP/STOPPED type table in the original kernel's
//! `icc.h`/`vm.c`; `data` becomes a payload enum keyed by the message type instead of a C union.

use newt::define_num_enum;

define_num_enum! {
    pub enum IccMessageType {
        /// manager -> worker: start executing the given VM.
        Start,
        /// worker -> manager: execution began; carries the guest's stdio ring addresses.
        Started,
        /// manager -> worker: pause execution. Dispatched through the same mailbox as every
        /// other type; [`crate::PAUSE_VECTOR`] names the wire-level vector this corresponds to
        /// but is not used for a separate out-of-band delivery path in this workspace.
        Pause,
        /// worker -> manager: execution paused.
        Paused,
        /// manager -> worker: resume a paused VM.
        Resume,
        /// worker -> manager: execution resumed.
        Resumed,
        /// manager -> worker: stop execution.
        Stop,
        /// worker -> manager: execution ended, carrying the guest's return code.
        Stopped,
    }
}

/// A `{ptr, head, tail, size}` ring descriptor, handed from worker to manager so the manager's
/// idle loop knows where to find that core's stdio rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioRingHandle {
    pub ptr: u64,
    pub head: u64,
    pub tail: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedPayload {
    pub stdin: StdioRingHandle,
    pub stdout: StdioRingHandle,
    pub stderr: StdioRingHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoppedPayload {
    pub return_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IccPayload {
    Start { vm_addr: u64 },
    Started(StartedPayload),
    Pause,
    Paused,
    Resume,
    Resumed,
    Stop,
    Stopped(StoppedPayload),
}

impl IccPayload {
    pub fn ty(&self) -> IccMessageType {
        match self {
            IccPayload::Start { .. } => IccMessageType::Start,
            IccPayload::Started(_) => IccMessageType::Started,
            IccPayload::Pause => IccMessageType::Pause,
            IccPayload::Paused => IccMessageType::Paused,
            IccPayload::Resume => IccMessageType::Resume,
            IccPayload::Resumed => IccMessageType::Resumed,
            IccPayload::Stop => IccMessageType::Stop,
            IccPayload::Stopped(_) => IccMessageType::Stopped,
        }
    }
}

/// `result` value meaning "precondition not met, repost the same request" (`icc_resumed`,
/// `icc_stopped` in `vm.c`).
pub const ICC_RETRY_LATER: i32 = -1000;

/// The interrupt vector PAUSE corresponds to in the wire format (spec.md §4.5); kept as a named
/// constant for fidelity to that type table even though this workspace delivers PAUSE through
/// the ordinary mailbox rather than a real out-of-band interrupt.
pub const PAUSE_VECTOR: u8 = 49;

/// Bound on [`crate::IccRouter::repost_or_fail`]'s automatic repost loop (spec Open Question:
/// the original's `result == -1000` repost in `icc_resumed`/`icc_stopped` is unbounded).
pub const MAX_RETRIES: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IccMessage {
    /// APIC id of the core that sent this message.
    pub sender: u32,
    /// 0 on success, [`ICC_RETRY_LATER`] to request a repost, any other negative value is a
    /// terminal error.
    pub result: i32,
    /// Number of times this exact request has already been reposted by
    /// [`crate::IccRouter::repost_or_fail`]. Bounds the original's unbounded retry loop.
    pub retries: u32,
    pub payload: IccPayload,
}

impl IccMessage {
    /// The `icc_alloc(type)` equivalent: a fresh, successful message carrying `payload`.
    pub fn new(sender: u32, payload: IccPayload) -> Self {
        Self {
            sender,
            result: 0,
            retries: 0,
            payload,
        }
    }

    pub fn with_result(sender: u32, payload: IccPayload, result: i32) -> Self {
        Self {
            sender,
            result,
            retries: 0,
            payload,
        }
    }

    pub fn ty(&self) -> IccMessageType {
        self.payload.ty()
    }

    pub fn is_retry_later(&self) -> bool {
        self.result == ICC_RETRY_LATER
    }
}
