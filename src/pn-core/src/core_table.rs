//! Per-core status table (spec.md §4.6). Indexed by APIC id, grounded on `original_source/kernel/
//! src/vm.c`'s boot-time marking in `vm_init`: at boot every present core is `STOP`, absent slots
//! are `INVALID`, and core 0 (the manager) is `START`. The only legal mutations are the transitions
//! the VM state machine drives (spec.md §4.7); this table does not validate those itself —
//! [`crate::VmRegistry`] owns that — it is just the shared, APIC-id-indexed slot storage plus the
//! stdio ring handles.

use std::collections::HashMap;

use newt::define_num_enum;

use crate::stdio_ring::{StdioRing, STDIO_RING_CAPACITY};

define_num_enum! {
    pub enum CoreStatus {
        /// No core is present at this APIC id.
        Invalid,
        Stop,
        Pause,
        Start,
    }
}

/// One core's row in the table. A `vm` is attached only while `status` is `Pause` or `Start`
/// (spec.md §3 Core invariant).
#[derive(Debug, Clone)]
pub struct CoreEntry {
    pub apic_id: u32,
    pub status: CoreStatus,
    pub error_code: i32,
    pub return_code: i32,
    pub vm: Option<u64>,
    pub stdin: StdioRing,
    pub stdout: StdioRing,
    pub stderr: StdioRing,
}

impl CoreEntry {
    fn invalid(apic_id: u32) -> Self {
        Self {
            apic_id,
            status: CoreStatus::Invalid,
            error_code: 0,
            return_code: 0,
            vm: None,
            stdin: StdioRing::empty(),
            stdout: StdioRing::empty(),
            stderr: StdioRing::empty(),
        }
    }

    /// A present core's rings are allocated up front, not lazily on START: `vm_stdio` (spec.md
    /// §4.7) must be able to write bytes into a core reserved by a just-created, not-yet-started
    /// VM the moment it transitions to `PAUSE`/`START`, and nothing else in this workspace ever
    /// resizes a core's rings afterward.
    fn stopped(apic_id: u32) -> Self {
        Self {
            status: CoreStatus::Stop,
            stdin: StdioRing::with_capacity(STDIO_RING_CAPACITY),
            stdout: StdioRing::with_capacity(STDIO_RING_CAPACITY),
            stderr: StdioRing::with_capacity(STDIO_RING_CAPACITY),
            ..Self::invalid(apic_id)
        }
    }
}

/// The fixed-size, boot-time-constructed core table. `present` lists every APIC id the host
/// actually has a logical core for (core 0 is always present — it's the manager).
pub struct CoreTable {
    cores: HashMap<u32, CoreEntry>,
}

impl CoreTable {
    /// Builds the table: core 0 and every id in `present` start `Stop` (core 0 is then
    /// immediately promoted to `Start`, since the manager is always running once booted); any
    /// APIC id not in `present` and not 0 is `Invalid`.
    pub fn boot(present: impl IntoIterator<Item = u32>, max_apic_id: u32) -> Self {
        let mut cores = HashMap::new();
        let mut present: std::collections::HashSet<u32> = present.into_iter().collect();
        present.insert(0);

        for apic_id in 0..=max_apic_id {
            let entry = if present.contains(&apic_id) {
                CoreEntry::stopped(apic_id)
            } else {
                CoreEntry::invalid(apic_id)
            };
            cores.insert(apic_id, entry);
        }

        if let Some(manager) = cores.get_mut(&0) {
            manager.status = CoreStatus::Start;
        }

        Self { cores }
    }

    pub fn get(&self, apic_id: u32) -> Option<&CoreEntry> {
        self.cores.get(&apic_id)
    }

    pub fn get_mut(&mut self, apic_id: u32) -> Option<&mut CoreEntry> {
        self.cores.get_mut(&apic_id)
    }

    pub fn is_present(&self, apic_id: u32) -> bool {
        self.cores
            .get(&apic_id)
            .is_some_and(|c| c.status != CoreStatus::Invalid)
    }

    /// Every APIC id not currently `Invalid`, for the idle stdio poll (spec.md §4.7).
    pub fn present_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.cores
            .values()
            .filter(|c| c.status != CoreStatus::Invalid)
            .map(|c| c.apic_id)
    }

    /// Every `Stop` core not currently reserved by a VM, in ascending APIC-id order, for
    /// `vm_create`'s core reservation step.
    pub fn free_stopped(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .cores
            .values()
            .filter(|c| c.status == CoreStatus::Stop && c.vm.is_none() && c.apic_id != 0)
            .map(|c| c.apic_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_core_boots_as_start_others_as_stop() {
        let table = CoreTable::boot([1, 2], 3);
        assert_eq!(table.get(0).unwrap().status, CoreStatus::Start);
        assert_eq!(table.get(1).unwrap().status, CoreStatus::Stop);
        assert_eq!(table.get(2).unwrap().status, CoreStatus::Stop);
        assert_eq!(table.get(3).unwrap().status, CoreStatus::Invalid);
    }

    #[test]
    fn free_stopped_excludes_manager_and_reserved_cores() {
        let mut table = CoreTable::boot([1, 2, 3], 3);
        table.get_mut(2).unwrap().vm = Some(1);

        assert_eq!(table.free_stopped(), vec![1, 3]);
    }
}
