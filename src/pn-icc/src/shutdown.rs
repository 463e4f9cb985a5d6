//! The VM teardown phase sequence, adapted from the original `vmm-ids` crate's
//! `VmmShutdownPhase`: a [`MultiShutdownSignal`](pn_event::MultiShutdownSignal) indexed by an
//! ordered phase enum, so every subsystem that must finish before the next phase starts can
//! register a [`ShutdownTask`](pn_event::ShutdownTask) and be waited on. The phase list itself is
//! rebased on this workspace's own worker-thread-per-core runtime (`WorkerJoin`) in place of the
//! teacher's `HvfDestroy`/`NotifyLibkrunWorker`, which named a collaborator this crate doesn't
//! have.

use newt::define_num_enum;
use pn_event::MultiShutdownSignal;

pub type VmShutdownSignal = MultiShutdownSignal<VmShutdownPhase>;

define_num_enum! {
    pub enum VmShutdownPhase {
        /// Send STOP to every worker core still executing and wait for STOPPED.
        VcpuPause,

        /// Flush and close the guest's stdio rings.
        Console,

        /// Tear down any virtio-style devices attached to the VM.
        Devices,

        /// Free the VM's memory, storage, and NIC blocks.
        VcpuDestroy,

        /// Join each worker thread that was executing one of this VM's cores.
        WorkerJoin,
    }
}
