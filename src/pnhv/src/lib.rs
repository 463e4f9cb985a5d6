//! The boot sequence and composition root (spec.md §9's "model as a single owning `System`
//! object constructed at boot"). Grounded on `libkrun::main`'s configure-then-build-then-run
//! shape: parse the firmware memory map, partition it into the two-tier allocator, boot the
//! per-core status table, wire one ICC router shared by every core, hand the manager core a
//! [`VmRegistry`] and every other core a [`WorkerRuntime`] on its own thread, then drive the
//! manager loop until asked to stop.
//!
//! The RPC layer that binds `System`'s methods to a wire protocol, the ELF loader, and the
//! argument parser are all out-of-scope collaborators (spec.md §1); [`System`] only assembles
//! and drives the parts spec.md actually specifies.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Context;

use pn_core::{
    vm_registry::StdioHandler,
    worker::{GuestLoader, GuestTask, LoaderError, WorkerRuntime},
    CoreTable, StorageError, VmRegistry, VmSpec, VmStatus,
};
use pn_icc::{IccRouter, VmShutdownPhase, VmShutdownSignal, DEFAULT_MAILBOX_CAPACITY};
use pn_memory::{layout, BlockAllocator, GlobalHeap, MemoryMap, Region};

/// Boot-time parameters a real firmware/bootloader collaborator would supply (spec.md §6's
/// firmware memory map input, reduced to what this workspace can synthesize without one).
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Number of logical cores present, including the manager (core 0).
    pub core_count: u32,
    /// Total physical memory reported by firmware, starting at address 0.
    pub total_memory_bytes: u64,
    /// Length of the ramdisk reserved at [`layout::RAMDISK_START`]; `0` if none is loaded.
    pub ramdisk_len: u64,
    /// NIC device names [`pn_core::VmRegistry`] will accept in a VM spec's `nics`.
    pub known_devices: Vec<String>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            core_count: 4,
            total_memory_bytes: 256 * 1024 * 1024,
            ramdisk_len: 0,
            known_devices: Vec::new(),
        }
    }
}

/// Every byte reserved by the fixed physical layout (spec.md §6): IVT, BDA, descriptor tables,
/// kernel text, one kernel-data stripe per slot up to [`layout::MAX_CORE_COUNT`] (whether or not
/// a core is actually present at that APIC id — the stripes are reserved by position, not by
/// occupancy), and the ramdisk if one is loaded.
fn reserved_regions(ramdisk_len: u64) -> Vec<Region> {
    let mut regions = vec![
        Region::new(layout::IVT_AREA_START, layout::IVT_AREA_END),
        Region::new(layout::BDA_AREA_START, layout::BDA_AREA_END),
        Region::new(layout::DESC_TABLE_AREA_START, layout::DESC_TABLE_AREA_END),
        Region::new(layout::KERNEL_TEXT_AREA_START, layout::KERNEL_TEXT_AREA_END),
    ];

    for i in 0..layout::MAX_CORE_COUNT {
        let (start, end) = layout::kernel_data_area(i);
        regions.push(Region::new(start, end));
    }

    if ramdisk_len > 0 {
        regions.push(Region::new(layout::RAMDISK_START, layout::RAMDISK_START + ramdisk_len));
    }

    regions
}

/// Stands in for the out-of-scope ELF loader (spec.md §1, §4.8's `GuestLoader` seam) when no
/// real one is supplied. Every load fails, so a core booted with it only ever reports
/// `LoaderFailure` back to the manager — enough to exercise the full state machine without a
/// guest execution engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGuestLoader;

/// Never actually produced — [`NullGuestLoader::load`] always fails — but [`GuestLoader::Task`]
/// needs a concrete, `Send` type to name.
#[derive(Debug, Clone, Copy)]
pub struct NullGuestTask;

impl GuestTask for NullGuestTask {
    fn step(&mut self) -> pn_core::GuestExit {
        pn_core::GuestExit::Exited { return_code: 0 }
    }
}

impl GuestLoader for NullGuestLoader {
    type Task = NullGuestTask;

    fn load(&mut self, _vm_addr: u64) -> Result<Self::Task, LoaderError> {
        Err(LoaderError {
            reason: "no guest loader configured".to_string(),
        })
    }
}

struct Worker {
    core: u32,
    join: JoinHandle<()>,
}

/// The single owning object spec.md §9 calls for: the manager core's [`VmRegistry`], the shared
/// [`IccRouter`], and every worker core's thread handle. Not `Send`/`Sync` (it holds the
/// manager's `VmRegistry`, which isn't) — construct it and call [`System::run`] from the same
/// thread.
pub struct System {
    registry: VmRegistry,
    icc: Arc<IccRouter>,
    workers: Vec<Worker>,
    shutdown: VmShutdownSignal,
    shutdown_requested: Arc<AtomicBool>,
}

impl System {
    /// Boots with [`NullGuestLoader`] on every worker core. A real binding supplies its own
    /// loader via [`System::boot_with_loader`].
    pub fn boot(config: BootConfig) -> anyhow::Result<Self> {
        Self::boot_with_loader(config, |_core| NullGuestLoader)
    }

    /// Parses the memory map, builds the two-tier allocator, boots the core table, wires the ICC
    /// router, and spawns one thread per non-manager core running a [`WorkerRuntime`] built from
    /// `loader_factory(apic_id)`.
    pub fn boot_with_loader<L, F>(config: BootConfig, loader_factory: F) -> anyhow::Result<Self>
    where
        L: GuestLoader + Send + 'static,
        L::Task: Send,
        F: Fn(u32) -> L,
    {
        anyhow::ensure!(config.core_count >= 1, "core_count must be at least 1");
        anyhow::ensure!(
            (config.core_count as usize) <= layout::MAX_CORE_COUNT,
            "core_count {} exceeds the {} cores this layout reserves kernel-data stripes for",
            config.core_count,
            layout::MAX_CORE_COUNT,
        );

        let available = vec![Region::new(0, config.total_memory_bytes)];
        let reserved = reserved_regions(config.ramdisk_len);
        let map = MemoryMap::build(available, &reserved);

        let blocks = Arc::new(BlockAllocator::new(map.block_starts));
        let heap = Arc::new(GlobalHeap::new(map.heap_regions, Arc::clone(&blocks)));

        let max_apic_id = layout::MAX_CORE_COUNT as u32 - 1;
        let core_table = CoreTable::boot(0..config.core_count, max_apic_id);

        let icc = Arc::new(IccRouter::new(DEFAULT_MAILBOX_CAPACITY));
        icc.register_core(0);
        for core in 1..config.core_count {
            icc.register_core(core);
        }

        let registry = VmRegistry::new(
            core_table,
            Arc::clone(&blocks),
            Arc::clone(&heap),
            Arc::clone(&icc),
            config.known_devices.clone(),
        );

        let shutdown = VmShutdownSignal::new();
        let mut workers = Vec::with_capacity(config.core_count.saturating_sub(1) as usize);
        for core in 1..config.core_count {
            let core_icc = Arc::clone(&icc);
            let loader = loader_factory(core);
            let core_shutdown = shutdown.clone();
            let join = std::thread::Builder::new()
                .name(format!("pnhv-core-{core}"))
                .spawn(move || worker_loop(core, core_icc, loader, core_shutdown))
                .with_context(|| format!("failed to spawn worker thread for core {core}"))?;
            workers.push(Worker { core, join });
        }

        tracing::info!(
            cores = config.core_count,
            total_memory_bytes = config.total_memory_bytes,
            block_count = blocks.total_blocks(),
            "system booted"
        );

        Ok(Self {
            registry,
            icc,
            workers,
            shutdown,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// spec.md §9's `vm_stdio_handler(cb)` RPC op.
    pub fn vm_stdio_handler(&self, handler: StdioHandler) {
        self.registry.set_stdio_handler(handler);
    }

    /// Installs a Ctrl+C handler and drives the manager loop until it fires, then stops every
    /// running VM and joins each worker thread before returning.
    pub fn run(self) -> anyhow::Result<()> {
        let shutdown_requested = Arc::clone(&self.shutdown_requested);
        ctrlc::set_handler(move || {
            tracing::info!("shutdown requested");
            shutdown_requested.store(true, Ordering::SeqCst);
        })
        .context("failed to install Ctrl+C handler")?;

        self.run_until_shutdown()
    }

    /// The manager loop itself (spec.md §4.7/§4.8's data flow: poll the event loop, forward any
    /// pending reply from a worker into the registry), separated from [`System::run`]'s Ctrl+C
    /// wiring so tests can drive shutdown directly.
    fn run_until_shutdown(mut self) -> anyhow::Result<()> {
        while !self.shutdown_requested.load(Ordering::SeqCst) {
            self.registry.poll();
            self.drain_one_reply();
        }

        tracing::info!("stopping every running VM before exit");
        for vmid in self.registry.vm_list() {
            if !matches!(self.registry.vm_status_get(vmid), Some(VmStatus::Stop) | None) {
                self.registry.vm_status_set(vmid, VmStatus::Stop, |_| {});
            }
        }

        // Give in-flight STOP transitions a chance to actually resolve before the worker threads
        // are told to exit out from under them.
        for _ in 0..64 {
            self.registry.poll();
            self.drain_one_reply();
            std::thread::sleep(Duration::from_millis(2));
        }

        self.shutdown.shutdown();
        for worker in self.workers {
            if worker.join.join().is_err() {
                tracing::error!(core = worker.core, "worker thread panicked");
            }
        }

        Ok(())
    }

    fn drain_one_reply(&mut self) {
        match self.icc.try_recv(0) {
            Ok(Some(msg)) => {
                self.registry.handle_core_reply(msg.sender, msg);
                let _ = self.icc.free(0, msg);
            }
            _ => std::thread::park_timeout(Duration::from_millis(2)),
        }
    }

    // The RPC surface spec.md §6 names, bound by an out-of-scope wire protocol.

    pub fn vm_create(&mut self, spec: VmSpec) -> u64 {
        self.registry.vm_create(spec)
    }

    pub fn vm_destroy(&mut self, vmid: u64) -> bool {
        self.registry.vm_destroy(vmid)
    }

    pub fn vm_list(&self) -> Vec<u64> {
        self.registry.vm_list()
    }

    pub fn vm_status_get(&self, vmid: u64) -> Option<VmStatus> {
        self.registry.vm_status_get(vmid)
    }

    pub fn vm_status_set(&mut self, vmid: u64, target: VmStatus, callback: impl FnOnce(bool) + 'static) {
        self.registry.vm_status_set(vmid, target, callback)
    }

    pub fn vm_storage_read(&self, vmid: u64, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.registry.vm_storage_read(vmid, offset, buf)
    }

    pub fn vm_storage_write(&self, vmid: u64, offset: u64, src: &[u8]) -> Result<usize, StorageError> {
        self.registry.vm_storage_write(vmid, offset, src)
    }

    pub fn vm_storage_clear(&self, vmid: u64) -> Result<(), StorageError> {
        self.registry.vm_storage_clear(vmid)
    }

    pub fn vm_storage_md5(&self, vmid: u64, size: u64) -> Result<[u8; 16], StorageError> {
        self.registry.vm_storage_md5(vmid, size)
    }

    pub fn vm_stdio(&self, vmid: u64, thread: usize, fd: u32, buf: &[u8]) -> Result<usize, StorageError> {
        self.registry.vm_stdio(vmid, thread, fd, buf)
    }

    #[cfg(test)]
    fn poll_once_for_test(&mut self) {
        self.registry.poll();
        self.drain_one_reply();
    }
}

/// One non-manager core's thread body: registers a [`WorkerRuntime`], polls it until asked to
/// stop, then releases its `WorkerJoin` shutdown task so [`System::run`]'s final `shutdown()`
/// call can return.
fn worker_loop<L>(core: u32, icc: Arc<IccRouter>, loader: L, shutdown: VmShutdownSignal)
where
    L: GuestLoader + Send + 'static,
    L::Task: Send,
{
    let running = Arc::new(AtomicBool::new(true));
    let kick_running = Arc::clone(&running);
    let task = match shutdown.spawn(VmShutdownPhase::WorkerJoin, move || {
        kick_running.store(false, Ordering::SeqCst);
    }) {
        Ok(task) => task,
        Err(_) => {
            tracing::warn!(core, "worker thread started after shutdown was already requested");
            return;
        }
    };

    let worker = WorkerRuntime::new(core, icc, loader);
    while running.load(Ordering::SeqCst) {
        if !worker.poll() {
            std::thread::park_timeout(Duration::from_millis(5));
        }
    }

    tracing::info!(core, "worker thread stopping");
    drop(task);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(core_count: u32) -> BootConfig {
        BootConfig {
            core_count,
            total_memory_bytes: 256 * 1024 * 1024,
            ramdisk_len: 0,
            known_devices: vec!["eth0".to_string()],
        }
    }

    #[test]
    fn boot_starts_with_no_vms_and_an_idle_manager_mailbox() {
        let system = System::boot(small_config(2)).unwrap();
        assert_eq!(system.registry.vm_list(), Vec::<u64>::new());
        assert_eq!(system.icc.outstanding(0), Ok(0));
    }

    #[test]
    fn boot_rejects_more_cores_than_the_layout_reserves_stripes_for() {
        let config = small_config((layout::MAX_CORE_COUNT + 1) as u32);
        assert!(System::boot(config).is_err());
    }

    #[test]
    fn run_until_shutdown_stops_every_worker_thread() {
        let system = System::boot(small_config(3)).unwrap();
        let shutdown_requested = Arc::clone(&system.shutdown_requested);

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            shutdown_requested.store(true, Ordering::SeqCst);
        });

        system.run_until_shutdown().unwrap();
    }

    #[test]
    fn vm_created_before_shutdown_is_stopped_gracefully() {
        let mut system = System::boot(small_config(2)).unwrap();

        let id = system.vm_create(VmSpec {
            argv: vec!["/init".to_string()],
            core_size: 1,
            memory_blocks: 1,
            storage_blocks: 1,
            nics: vec![],
        });
        assert_ne!(id, 0);

        let shutdown_requested = Arc::clone(&system.shutdown_requested);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            shutdown_requested.store(true, Ordering::SeqCst);
        });

        system.run_until_shutdown().unwrap();
    }
}
