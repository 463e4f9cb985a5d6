//! Guest-memory access helpers shared by `pn-guest-memory` and `pn-core`.
//!
//! This is the surviving sliver of the teacher's `utils` crate: a byte-valued-object accessor
//! extension trait over `vm_memory::GuestMemoryMmap`. `utils` also carried HVF/macOS-specific
//! bring-up helpers (QoS class tuning, `os_unfair_lock`, an `eventfd` shim, kernel symbol-table
//! decoding) that had no counterpart anywhere in this workspace's spec and were dropped — see
//! DESIGN.md.

mod memory;

pub use memory::GuestMemoryExt;
