//! The manager and worker runtimes described in spec.md §4.6-4.8: the per-core status table and
//! stdio rings, VM lifecycle/orchestration driven from the manager core, and the ICC-driven
//! worker loop a non-manager core runs.
//!
//! This crate's previous, platform-specific incarnation (HVF-backed vCPU plumbing, a virtio-fs
//! config builder) had no counterpart in this workspace's spec and was removed — see DESIGN.md.

pub mod core_table;
pub mod stdio_ring;
pub mod vm_registry;
pub mod vmm_config;
pub mod worker;

pub use core_table::{CoreEntry, CoreStatus, CoreTable};
pub use stdio_ring::StdioRing;
pub use vm_registry::{StorageError, VmCreateError, VmRegistry, VmStatus};
pub use vmm_config::vm_spec::{NicConfig, NicSpec, VmConfig, VmConfigError, VmSpec, VmSpecBuilder};
pub use worker::{GuestExit, GuestLoader, GuestTask, LoaderError, WorkerRuntime};
