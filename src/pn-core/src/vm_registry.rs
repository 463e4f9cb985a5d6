//! VM lifecycle and ICC-driven orchestration (spec.md §4.7). Grounded on `original_source/kernel/
//! src/vm.c`'s `vm_create`/`vm_destroy`/`vm_status_set`/`vm_storage_*`/`vm_stdio`, translated from
//! a single global table guarded by the manager core's exclusivity into a `Registry` that owns an
//! [`EventLoop`] directly — per spec.md §9's design note ("model as a single owning `System`
//! object constructed at boot; the manager-core singleton contract is enforced by keeping these
//! fields accessible only from that core"), this type is never shared across threads.
//!
//! The event loop's trigger callbacks need to mutate the same state `vm_create`/`vm_status_set`
//! mutate, which a plain `&mut self`-owned `EventLoop` can't do (a registered closure can't also
//! borrow its owner). State therefore lives behind `Rc<RefCell<_>>`, cloned into each closure —
//! the single-threaded, `!Send` discipline `EventLoop` already requires makes `Rc`/`RefCell`
//! exactly as sound as a plain owned field would be.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use md5::Digest;
use newt::define_num_enum;
use pn_event::EventLoop;
use pn_guest_memory::{build_guest_memory, BlockList, GuestMemoryAccessError};
use pn_icc::{IccMessage, IccPayload, IccRouter};
use pn_memory::{Block, BlockAllocator, GlobalHeap};
use vm_memory::GuestMemoryMmap;

use crate::core_table::{CoreStatus, CoreTable};
use crate::vmm_config::vm_spec::{NicSpec, VmSpec};

define_num_enum! {
    pub enum VmStatus {
        Stop,
        Pause,
        Start,
    }
}

/// `EVENT_VM_{STARTED,PAUSED,RESUMED,STOPPED}` (spec.md §4.7). Fired with a `(u32, bool)` payload
/// — the reporting core's APIC id and whether its sub-event completed without error.
const EVENT_VM_STARTED: u32 = 1;
const EVENT_VM_PAUSED: u32 = 2;
const EVENT_VM_RESUMED: u32 = 3;
const EVENT_VM_STOPPED: u32 = 4;

fn trigger_event_for(status: VmStatus) -> u32 {
    match status {
        VmStatus::Start => EVENT_VM_STARTED,
        VmStatus::Pause => EVENT_VM_PAUSED,
        VmStatus::Stop => EVENT_VM_STOPPED,
    }
}

/// Bit 1 of MAC byte 0 ("locally administered"), byte 0 being the high byte of the 48-bit value.
const LOCAL_ADMIN_BIT: u64 = 1 << 41;
const MAC_MASK: u64 = (1 << 48) - 1;

#[derive(Debug)]
pub enum VmCreateError {
    OutOfMemory,
    NotEnoughCores { requested: u32, available: usize },
    InvalidDevice { dev: String },
    DuplicateMac { mac: u64 },
}

impl fmt::Display for VmCreateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory (heap or block pool exhausted)"),
            Self::NotEnoughCores {
                requested,
                available,
            } => write!(f, "requested {requested} cores, only {available} free"),
            Self::InvalidDevice { dev } => write!(f, "unknown NIC device {dev:?}"),
            Self::DuplicateMac { mac } => write!(f, "MAC {mac:012x} already in use on this device"),
        }
    }
}

impl std::error::Error for VmCreateError {}

#[derive(Debug, PartialEq, Eq)]
pub enum StorageError {
    OutOfRange,
    NoStorage,
}

impl From<GuestMemoryAccessError> for StorageError {
    fn from(_: GuestMemoryAccessError) -> Self {
        StorageError::OutOfRange
    }
}

struct Vnic {
    dev: String,
    mac: u64,
    pool_blocks: Vec<Block>,
}

struct Vm {
    id: u64,
    argv: Vec<String>,
    heap_record: u64,
    cores: Vec<u32>,
    status: VmStatus,
    memory_blocks: Vec<Block>,
    memory_mem: Option<GuestMemoryMmap>,
    storage_blocks: Vec<Block>,
    storage_mem: Option<GuestMemoryMmap>,
    nics: Vec<Vnic>,
}

impl Vm {
    fn storage(&self) -> Option<BlockList<'_>> {
        Some(BlockList::new(&self.storage_blocks, self.storage_mem.as_ref()?))
    }

    fn memory(&self) -> Option<BlockList<'_>> {
        Some(BlockList::new(&self.memory_blocks, self.memory_mem.as_ref()?))
    }
}

/// A registered stdio consumer: `(vmid, thread, fd, bytes)`, `fd` following the conventional
/// 0=stdin/1=stdout/2=stderr numbering (only 1/2 are ever produced by the idle poll).
pub type StdioHandler = Box<dyn FnMut(u64, u32, u32, &[u8])>;

struct State {
    core_table: CoreTable,
    blocks: Arc<BlockAllocator>,
    heap: Arc<GlobalHeap>,
    icc: Arc<IccRouter>,
    known_devices: HashSet<String>,
    mac_by_device: HashMap<String, HashSet<u64>>,
    vms: HashMap<u64, Vm>,
    next_vmid: u64,
    in_flight: HashSet<u64>,
    stdio_handler: Option<StdioHandler>,
}

/// The manager-core VM registry: creation/teardown, storage I/O, status transitions and the idle
/// stdio pump. Not `Send`/`Sync` — construct and drive it from the manager core only.
pub struct VmRegistry {
    state: Rc<RefCell<State>>,
    events: EventLoop,
}

impl VmRegistry {
    pub fn new(
        core_table: CoreTable,
        blocks: Arc<BlockAllocator>,
        heap: Arc<GlobalHeap>,
        icc: Arc<IccRouter>,
        known_devices: impl IntoIterator<Item = String>,
    ) -> Self {
        let state = Rc::new(RefCell::new(State {
            core_table,
            blocks,
            heap,
            icc,
            known_devices: known_devices.into_iter().collect(),
            mac_by_device: HashMap::new(),
            vms: HashMap::new(),
            next_vmid: 0,
            in_flight: HashSet::new(),
            stdio_handler: None,
        }));

        let mut events = EventLoop::new();
        let idle_state = Rc::clone(&state);
        events.add_idle(move || {
            pump_stdio(&idle_state);
            true
        });

        Self { state, events }
    }

    pub fn set_stdio_handler(&self, handler: StdioHandler) {
        self.state.borrow_mut().stdio_handler = Some(handler);
    }

    /// Must be called from the manager core's own loop; drives the idle stdio pump and resolves
    /// any `vm_status_set` callbacks whose cores have all reported in.
    pub fn poll(&mut self) {
        self.events.run_once();
    }

    pub fn vm_list(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.borrow().vms.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn vm_status_get(&self, vmid: u64) -> Option<VmStatus> {
        self.state.borrow().vms.get(&vmid).map(|vm| vm.status)
    }

    /// spec.md §4.7 `vm_create`. Returns `0` on any failure after rolling back every partial
    /// allocation made by this call.
    pub fn vm_create(&mut self, spec: VmSpec) -> u64 {
        match self.try_vm_create(spec) {
            Ok(id) => id,
            Err(_) => 0,
        }
    }

    fn try_vm_create(&mut self, spec: VmSpec) -> Result<u64, VmCreateError> {
        let mut state = self.state.borrow_mut();

        // 1-2. VM record + argv: a nominal GlobalHeap reservation mirrors the original's
        // `gmalloc`; the bytes themselves just live in the `Vm` struct.
        let argv_bytes: usize = spec.argv.iter().map(|a| a.len() + 1).sum::<usize>().max(1);
        let heap_record = state
            .heap
            .alloc(argv_bytes as u64)
            .map_err(|_| VmCreateError::OutOfMemory)?;

        // 3. Reserve core_size cores in STOP state; mark each PAUSE and attach the VM
        // (original `vm.c`'s vm_create: `cores[i].status = VM_STATUS_PAUSE; cores[i].vm = vm;`).
        let available = state.core_table.free_stopped();
        if available.len() < spec.core_size as usize {
            let _ = state.heap.free(heap_record);
            return Err(VmCreateError::NotEnoughCores {
                requested: spec.core_size,
                available: available.len(),
            });
        }
        let cores: Vec<u32> = available[..spec.core_size as usize].to_vec();

        // 4-5. Memory and storage block pools.
        let memory_blocks = match alloc_blocks(&state.blocks, spec.memory_blocks) {
            Ok(b) => b,
            Err(e) => {
                let _ = state.heap.free(heap_record);
                return Err(e);
            }
        };
        let storage_blocks = match alloc_blocks(&state.blocks, spec.storage_blocks) {
            Ok(b) => b,
            Err(e) => {
                free_blocks(&state.blocks, &memory_blocks);
                let _ = state.heap.free(heap_record);
                return Err(e);
            }
        };

        // 7. NICs: device resolution, MAC assignment, pool blocks.
        let mut nics: Vec<Vnic> = Vec::with_capacity(spec.nics.len());
        for (index, nic) in spec.nics.iter().enumerate() {
            if !state.known_devices.contains(&nic.dev) {
                for already in &nics {
                    free_blocks(&state.blocks, &already.pool_blocks);
                }
                free_blocks(&state.blocks, &storage_blocks);
                free_blocks(&state.blocks, &memory_blocks);
                let _ = state.heap.free(heap_record);
                return Err(VmCreateError::InvalidDevice {
                    dev: nic.dev.clone(),
                });
            }

            let pool_blocks = match alloc_blocks(&state.blocks, nic.pool_blocks) {
                Ok(b) => b,
                Err(e) => {
                    for already in &nics {
                        free_blocks(&state.blocks, &already.pool_blocks);
                    }
                    free_blocks(&state.blocks, &storage_blocks);
                    free_blocks(&state.blocks, &memory_blocks);
                    let _ = state.heap.free(heap_record);
                    return Err(e);
                }
            };

            let seed = ((index as u64) << 8) ^ heap_record;
            let mac = match resolve_mac(&mut state.mac_by_device, &nic.dev, nic.mac, seed) {
                Ok(mac) => mac,
                Err(e) => {
                    free_blocks(&state.blocks, &pool_blocks);
                    for already in &nics {
                        free_blocks(&state.blocks, &already.pool_blocks);
                    }
                    free_blocks(&state.blocks, &storage_blocks);
                    free_blocks(&state.blocks, &memory_blocks);
                    let _ = state.heap.free(heap_record);
                    return Err(e);
                }
            };

            nics.push(Vnic {
                dev: nic.dev.clone(),
                mac,
                pool_blocks,
            });
        }

        // 6. Unique non-zero vmid.
        let vmid = alloc_vmid(&mut state);

        for &core in &cores {
            if let Some(entry) = state.core_table.get_mut(core) {
                entry.status = CoreStatus::Pause;
                entry.vm = Some(vmid);
            }
        }

        let memory_mem = if memory_blocks.is_empty() {
            None
        } else {
            build_guest_memory(&memory_blocks).ok()
        };
        let storage_mem = if storage_blocks.is_empty() {
            None
        } else {
            build_guest_memory(&storage_blocks).ok()
        };

        tracing::info!(vmid, cores = ?cores, "vm created");

        state.vms.insert(
            vmid,
            Vm {
                id: vmid,
                argv: spec.argv,
                heap_record,
                cores,
                status: VmStatus::Stop,
                memory_blocks,
                memory_mem,
                storage_blocks,
                storage_mem,
                nics,
            },
        );

        Ok(vmid)
    }

    /// spec.md §4.7 `vm_destroy`. Refuses (returns `false`) while any assigned core is `START`.
    pub fn vm_destroy(&mut self, vmid: u64) -> bool {
        let mut state = self.state.borrow_mut();

        let Some(vm) = state.vms.get(&vmid) else {
            return false;
        };
        let any_running = vm
            .cores
            .iter()
            .any(|&c| state.core_table.get(c).map(|e| e.status) == Some(CoreStatus::Start));
        if any_running {
            tracing::warn!(vmid, "vm_destroy refused: a core is still START");
            return false;
        }

        let vm = state.vms.remove(&vmid).expect("checked above");

        for &core in &vm.cores {
            if let Some(entry) = state.core_table.get_mut(core) {
                entry.status = CoreStatus::Stop;
                entry.vm = None;
            }
        }
        free_blocks(&state.blocks, &vm.memory_blocks);
        free_blocks(&state.blocks, &vm.storage_blocks);
        for nic in &vm.nics {
            free_blocks(&state.blocks, &nic.pool_blocks);
            if let Some(set) = state.mac_by_device.get_mut(&nic.dev) {
                set.remove(&nic.mac);
            }
        }
        let _ = state.heap.free(vm.heap_record);
        state.in_flight.remove(&vmid);

        tracing::info!(vmid, "vm destroyed");
        true
    }

    /// spec.md §4.7 `vm_status_set`. `callback` resolves once every assigned core has reported
    /// the corresponding terminal sub-event (or immediately with `false` if the transition is
    /// illegal or another transition is already in flight for this VM).
    pub fn vm_status_set(
        &mut self,
        vmid: u64,
        target: VmStatus,
        callback: impl FnOnce(bool) + 'static,
    ) {
        let mut state = self.state.borrow_mut();

        let Some(vm) = state.vms.get(&vmid) else {
            drop(state);
            callback(false);
            return;
        };
        let current_status = vm.status;
        let cores: HashSet<u32> = vm.cores.iter().copied().collect();

        if !is_legal_transition(current_status, target) || state.in_flight.contains(&vmid) {
            tracing::warn!(vmid, ?current_status, ?target, "illegal or overlapping status transition rejected");
            drop(state);
            callback(false);
            return;
        }

        state.in_flight.insert(vmid);

        if target == VmStatus::Start {
            if let Some(list) = state.vms.get(&vmid).and_then(|vm| vm.memory()) {
                let _ = list.clear();
            }
        }

        let message_ty = outgoing_message(target);
        for &core in &cores {
            let _ = state.icc.send(core, IccMessage::new(0, message_ty));
        }

        let core_list: Vec<u32> = cores.iter().copied().collect();

        drop(state);

        let mut remaining = cores;
        let mut aborted = false;
        let mut callback = Some(callback);
        let resolve_state = Rc::clone(&self.state);

        self.events.add_trigger(trigger_event_for(target), move |payload, _handle| {
            let Some(&(core, ok)) = payload.downcast_ref::<(u32, bool)>() else {
                return true;
            };
            if !remaining.remove(&core) {
                return true;
            }
            if !ok {
                aborted = true;
            }
            if remaining.is_empty() {
                let resolved_status = if aborted { VmStatus::Stop } else { target };
                let core_status = core_status_for(resolved_status);

                let mut state = resolve_state.borrow_mut();
                if let Some(vm) = state.vms.get_mut(&vmid) {
                    vm.status = resolved_status;
                }
                for &c in &core_list {
                    if let Some(entry) = state.core_table.get_mut(c) {
                        entry.status = core_status;
                    }
                }
                state.in_flight.remove(&vmid);
                drop(state);
                tracing::info!(vmid, ?resolved_status, aborted, "vm status transition resolved");
                if let Some(cb) = callback.take() {
                    cb(!aborted);
                }
                false
            } else {
                true
            }
        });
    }

    /// Delivers a worker's reply (`Started`/`Paused`/`Resumed`/`Stopped`) into the pending
    /// transition awaiting it. A `Stopped` for a VM with no transition in flight is a guest
    /// fault or a voluntary exit (spec.md §4.8) rather than a reply to `vm_status_set`, and is
    /// handled directly: the reporting core (and its VM) go straight to `STOP`, `error_code`
    /// set from `msg.result`.
    ///
    /// `result == -1000` ("precondition not met, retry later", spec.md §4.5/§7) is checked
    /// first, matching `icc_resumed`/`icc_stopped` in the original `vm.c`: it is not a terminal
    /// sub-event at all, just a request to repost the same ICC message, bounded by
    /// [`pn_icc::MAX_RETRIES`] (Open Question (c)) rather than retried forever.
    pub fn handle_core_reply(&mut self, core: u32, msg: IccMessage) {
        if msg.is_retry_later() {
            if let Some(retry_payload) = retry_payload_for(msg.ty()) {
                self.repost_pending(core, msg, retry_payload);
                return;
            }
        }

        if msg.ty() == pn_icc::IccMessageType::Stopped {
            let vmid = self
                .state
                .borrow()
                .vms
                .values()
                .find(|vm| vm.cores.contains(&core))
                .map(|vm| vm.id);
            let in_flight = vmid.is_some_and(|id| self.state.borrow().in_flight.contains(&id));
            if !in_flight {
                self.handle_unsolicited_stop(core, vmid, msg);
                return;
            }
        }

        let event = match msg.ty() {
            pn_icc::IccMessageType::Started => EVENT_VM_STARTED,
            pn_icc::IccMessageType::Paused => EVENT_VM_PAUSED,
            pn_icc::IccMessageType::Resumed => EVENT_VM_RESUMED,
            pn_icc::IccMessageType::Stopped => EVENT_VM_STOPPED,
            _ => return,
        };
        self.events.fire(event, (core, msg.result == 0));
    }

    /// Reposts `msg`'s originating request (`RESUME` for a `-1000` `RESUMED`, `STOP` for a
    /// `-1000` `STOPPED`) to `core`, carrying its retry count forward via
    /// [`pn_icc::IccRouter::repost_or_fail`]. Once [`pn_icc::MAX_RETRIES`] is exhausted, the
    /// retry is abandoned and the pending `vm_status_set` sub-event is resolved as a terminal
    /// failure for this core instead of looping forever.
    fn repost_pending(&mut self, core: u32, msg: IccMessage, retry_payload: IccPayload) {
        let retry_msg = IccMessage {
            sender: 0,
            result: 0,
            retries: msg.retries,
            payload: retry_payload,
        };

        let result = self.state.borrow().icc.repost_or_fail(core, retry_msg);
        match result {
            Ok(()) => {
                tracing::debug!(core, ty = ?msg.ty(), "icc precondition not met, reposting request");
            }
            Err(_) => {
                tracing::error!(core, ty = ?msg.ty(), retries = msg.retries, "icc retry exhausted, treating as terminal error");
                let event = match msg.ty() {
                    pn_icc::IccMessageType::Resumed => EVENT_VM_RESUMED,
                    pn_icc::IccMessageType::Stopped => EVENT_VM_STOPPED,
                    _ => return,
                };
                self.events.fire(event, (core, false));
            }
        }
    }

    fn handle_unsolicited_stop(&mut self, core: u32, vmid: Option<u64>, msg: IccMessage) {
        tracing::warn!(core, ?vmid, error_code = msg.result, "unsolicited stop (guest fault or voluntary exit)");
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.core_table.get_mut(core) {
            entry.status = CoreStatus::Stop;
            entry.error_code = msg.result;
        }
        if let Some(vmid) = vmid {
            if let Some(vm) = state.vms.get_mut(&vmid) {
                vm.status = VmStatus::Stop;
            }
        }
    }

    pub fn vm_storage_read(&self, vmid: u64, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let state = self.state.borrow();
        let vm = state.vms.get(&vmid).ok_or(StorageError::NoStorage)?;
        let list = vm.storage().ok_or(StorageError::NoStorage)?;
        Ok(list.read(offset, buf)?)
    }

    pub fn vm_storage_write(&self, vmid: u64, offset: u64, src: &[u8]) -> Result<usize, StorageError> {
        let state = self.state.borrow();
        let vm = state.vms.get(&vmid).ok_or(StorageError::NoStorage)?;
        let list = vm.storage().ok_or(StorageError::NoStorage)?;
        Ok(list.write(offset, src)?)
    }

    pub fn vm_storage_clear(&self, vmid: u64) -> Result<(), StorageError> {
        let state = self.state.borrow();
        let vm = state.vms.get(&vmid).ok_or(StorageError::NoStorage)?;
        let list = vm.storage().ok_or(StorageError::NoStorage)?;
        Ok(list.clear()?)
    }

    pub fn vm_storage_md5(&self, vmid: u64, size: u64) -> Result<[u8; 16], StorageError> {
        let state = self.state.borrow();
        let vm = state.vms.get(&vmid).ok_or(StorageError::NoStorage)?;
        let list = vm.storage().ok_or(StorageError::NoStorage)?;
        let mut hasher = md5::Md5::new();
        list.digest_into(size, &mut hasher)?;
        Ok(hasher.finalize().into())
    }

    /// spec.md §4.7 `vm_stdio`. Rejects if `thread` is out of range or the owning core isn't
    /// `PAUSE`/`START`.
    pub fn vm_stdio(&self, vmid: u64, thread: usize, fd: u32, buf: &[u8]) -> Result<usize, StorageError> {
        let mut state = self.state.borrow_mut();
        let Some(vm) = state.vms.get(&vmid) else {
            return Err(StorageError::NoStorage);
        };
        let Some(&core) = vm.cores.get(thread) else {
            return Err(StorageError::OutOfRange);
        };
        let Some(entry) = state.core_table.get(core) else {
            return Err(StorageError::OutOfRange);
        };
        if !matches!(entry.status, CoreStatus::Pause | CoreStatus::Start) {
            return Err(StorageError::OutOfRange);
        }

        let entry = state.core_table.get_mut(core).expect("checked above");
        let ring = match fd {
            0 => &mut entry.stdin,
            1 => &mut entry.stdout,
            2 => &mut entry.stderr,
            _ => return Err(StorageError::OutOfRange),
        };
        Ok(ring.write(buf))
    }
}

fn pump_stdio(state: &Rc<RefCell<State>>) {
    let mut state = state.borrow_mut();
    let core_to_vm: HashMap<u32, u64> = state
        .vms
        .values()
        .flat_map(|vm| vm.cores.iter().enumerate().map(move |(i, &c)| (c, (vm.id, i))))
        .map(|(c, (id, _i))| (c, id))
        .collect();

    let ids: Vec<u32> = state.core_table.present_ids().collect();
    for core_id in ids {
        for fd in [1u32, 2u32] {
            let mut buf = [0u8; 4096];
            let n = {
                let Some(entry) = state.core_table.get_mut(core_id) else {
                    continue;
                };
                let ring = if fd == 1 { &mut entry.stdout } else { &mut entry.stderr };
                ring.read(&mut buf)
            };
            if n == 0 {
                continue;
            }
            let Some(&vmid) = core_to_vm.get(&core_id) else {
                continue;
            };
            let thread = state
                .vms
                .get(&vmid)
                .and_then(|vm| vm.cores.iter().position(|&c| c == core_id))
                .unwrap_or(0) as u32;
            if let Some(handler) = state.stdio_handler.as_mut() {
                handler(vmid, thread, fd, &buf[..n]);
            }
        }
    }
}

fn is_legal_transition(current: VmStatus, target: VmStatus) -> bool {
    matches!(
        (current, target),
        (VmStatus::Stop, VmStatus::Start)
            | (VmStatus::Start, VmStatus::Pause)
            | (VmStatus::Pause, VmStatus::Start)
            | (VmStatus::Pause, VmStatus::Stop)
            | (VmStatus::Start, VmStatus::Stop)
    )
}

fn core_status_for(status: VmStatus) -> CoreStatus {
    match status {
        VmStatus::Stop => CoreStatus::Stop,
        VmStatus::Pause => CoreStatus::Pause,
        VmStatus::Start => CoreStatus::Start,
    }
}

/// The request a `-1000` reply of type `ty` should be reposted as, matching `icc_resumed`'s
/// `ICC_TYPE_RESUME` repost and `icc_stopped`'s `ICC_TYPE_STOP` repost in the original `vm.c`.
/// `STARTED`/`PAUSED` never carry `-1000` in the original and have no repost here.
fn retry_payload_for(ty: pn_icc::IccMessageType) -> Option<IccPayload> {
    match ty {
        pn_icc::IccMessageType::Resumed => Some(IccPayload::Resume),
        pn_icc::IccMessageType::Stopped => Some(IccPayload::Stop),
        _ => None,
    }
}

fn outgoing_message(target: VmStatus) -> IccPayload {
    match target {
        VmStatus::Start => IccPayload::Start { vm_addr: 0 },
        VmStatus::Pause => IccPayload::Pause,
        VmStatus::Stop => IccPayload::Stop,
    }
}

fn alloc_blocks(blocks: &Arc<BlockAllocator>, count: u64) -> Result<Vec<Block>, VmCreateError> {
    let mut acquired = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match blocks.alloc() {
            Ok(b) => acquired.push(b),
            Err(_) => {
                free_blocks(blocks, &acquired);
                return Err(VmCreateError::OutOfMemory);
            }
        }
    }
    Ok(acquired)
}

fn free_blocks(blocks: &Arc<BlockAllocator>, list: &[Block]) {
    for block in list {
        let _ = blocks.free(*block);
    }
}

fn alloc_vmid(state: &mut State) -> u64 {
    loop {
        state.next_vmid = state.next_vmid.wrapping_add(1);
        if state.next_vmid != 0 && !state.vms.contains_key(&state.next_vmid) {
            return state.next_vmid;
        }
    }
}

fn resolve_mac(
    mac_by_device: &mut HashMap<String, HashSet<u64>>,
    dev: &str,
    requested: u64,
    seed: u64,
) -> Result<u64, VmCreateError> {
    let set = mac_by_device.entry(dev.to_string()).or_default();

    if requested != 0 {
        let mac = (requested | LOCAL_ADMIN_BIT) & MAC_MASK;
        if set.contains(&mac) {
            return Err(VmCreateError::DuplicateMac { mac });
        }
        set.insert(mac);
        return Ok(mac);
    }

    let mut candidate = (seed | LOCAL_ADMIN_BIT) & MAC_MASK;
    while set.contains(&candidate) {
        candidate = (candidate.wrapping_add(1) | LOCAL_ADMIN_BIT) & MAC_MASK;
    }
    set.insert(candidate);
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pn_icc::IccRouter;

    fn registry(core_count: u32) -> VmRegistry {
        let blocks = Arc::new(BlockAllocator::new((0..64u64).map(|i| i * Block::SIZE).collect()));
        let heap = Arc::new(GlobalHeap::new(
            vec![pn_memory::Region::new(0x1000_0000, 0x1001_0000)],
            Arc::clone(&blocks),
        ));
        let icc = Arc::new(IccRouter::new(8));
        for core in 0..core_count {
            icc.register_core(core);
        }
        let table = CoreTable::boot(0..core_count, core_count);
        VmRegistry::new(table, blocks, heap, icc, ["eth0".to_string()])
    }

    fn basic_spec(core_size: u32) -> VmSpec {
        VmSpec {
            argv: vec!["/init".to_string()],
            core_size,
            memory_blocks: 2,
            storage_blocks: 2,
            nics: vec![],
        }
    }

    #[test]
    fn create_then_destroy_roundtrips_block_accounting() {
        let mut reg = registry(4);
        let used_before = {
            let state = reg.state.borrow();
            state.blocks.used_bytes()
        };

        let id = reg.vm_create(basic_spec(2));
        assert_ne!(id, 0);
        assert_eq!(reg.vm_list(), vec![id]);

        assert!(reg.vm_destroy(id));
        assert_eq!(reg.vm_list(), Vec::<u64>::new());

        let used_after = {
            let state = reg.state.borrow();
            state.blocks.used_bytes()
        };
        assert_eq!(used_before, used_after);
    }

    #[test]
    fn create_fails_when_not_enough_cores() {
        let mut reg = registry(2);
        let id = reg.vm_create(basic_spec(5));
        assert_eq!(id, 0);
    }

    #[test]
    fn new_vm_starts_stopped_and_rejects_illegal_transition() {
        let mut reg = registry(4);
        let id = reg.vm_create(basic_spec(1));
        assert_eq!(reg.vm_status_get(id), Some(VmStatus::Stop));

        let resolved = Rc::new(RefCell::new(None));
        let out = Rc::clone(&resolved);
        reg.vm_status_set(id, VmStatus::Pause, move |ok| {
            *out.borrow_mut() = Some(ok);
        });

        assert_eq!(*resolved.borrow(), Some(false));
        assert_eq!(reg.vm_status_get(id), Some(VmStatus::Stop));
    }

    #[test]
    fn start_transition_resolves_once_every_core_reports_started() {
        let mut reg = registry(4);
        let id = reg.vm_create(basic_spec(2));
        let cores = {
            let state = reg.state.borrow();
            state.vms.get(&id).unwrap().cores.clone()
        };

        let resolved = Rc::new(RefCell::new(None));
        let out = Rc::clone(&resolved);
        reg.vm_status_set(id, VmStatus::Start, move |ok| {
            *out.borrow_mut() = Some(ok);
        });

        reg.handle_core_reply(cores[0], IccMessage::new(cores[0], IccPayload::Started(pn_icc::StartedPayload {
            stdin: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
            stdout: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
            stderr: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
        })));
        reg.poll();
        assert_eq!(*resolved.borrow(), None);

        reg.handle_core_reply(cores[1], IccMessage::new(cores[1], IccPayload::Started(pn_icc::StartedPayload {
            stdin: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
            stdout: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
            stderr: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
        })));
        reg.poll();
        assert_eq!(*resolved.borrow(), Some(true));
        assert_eq!(reg.vm_status_get(id), Some(VmStatus::Start));
    }

    /// Starts `id`'s single core (by replying `Started` to the outgoing `START`) so a later
    /// `STOP` transition has something to reply `Stopped`/`-1000` to.
    fn started(reg: &mut VmRegistry, id: u64, core: u32) {
        reg.vm_status_set(id, VmStatus::Start, |_| {});
        reg.handle_core_reply(
            core,
            IccMessage::new(
                core,
                IccPayload::Started(pn_icc::StartedPayload {
                    stdin: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
                    stdout: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
                    stderr: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
                }),
            ),
        );
        reg.poll();
        assert_eq!(reg.vm_status_get(id), Some(VmStatus::Start));
    }

    #[test]
    fn retry_later_stopped_reposts_stop_instead_of_resolving() {
        let mut reg = registry(4);
        let id = reg.vm_create(basic_spec(1));
        let core = {
            let state = reg.state.borrow();
            state.vms.get(&id).unwrap().cores[0]
        };
        started(&mut reg, id, core);

        let resolved = Rc::new(RefCell::new(None));
        let out = Rc::clone(&resolved);
        reg.vm_status_set(id, VmStatus::Stop, move |ok| {
            *out.borrow_mut() = Some(ok);
        });

        let icc = Arc::clone(&reg.state.borrow().icc);
        icc.try_recv(core).unwrap(); // drain the outgoing STOP

        reg.handle_core_reply(
            core,
            IccMessage::with_result(
                core,
                IccPayload::Stopped(pn_icc::StoppedPayload { return_code: 0 }),
                pn_icc::ICC_RETRY_LATER,
            ),
        );
        reg.poll();

        // Not resolved: -1000 is a repost request, not a terminal sub-event (spec.md §4.5/§7).
        assert_eq!(*resolved.borrow(), None);
        assert_eq!(reg.vm_status_get(id), Some(VmStatus::Start));

        let reposted = icc.try_recv(core).unwrap().unwrap();
        assert_eq!(reposted.ty(), pn_icc::IccMessageType::Stop);
        assert_eq!(reposted.retries, 1);
    }

    #[test]
    fn retry_later_exhausted_resolves_as_terminal_failure() {
        let mut reg = registry(4);
        let id = reg.vm_create(basic_spec(1));
        let core = {
            let state = reg.state.borrow();
            state.vms.get(&id).unwrap().cores[0]
        };
        started(&mut reg, id, core);

        let resolved = Rc::new(RefCell::new(None));
        let out = Rc::clone(&resolved);
        reg.vm_status_set(id, VmStatus::Stop, move |ok| {
            *out.borrow_mut() = Some(ok);
        });

        let icc = Arc::clone(&reg.state.borrow().icc);
        icc.try_recv(core).unwrap(); // drain the outgoing STOP

        let mut msg = IccMessage::with_result(
            core,
            IccPayload::Stopped(pn_icc::StoppedPayload { return_code: 0 }),
            pn_icc::ICC_RETRY_LATER,
        );
        msg.retries = pn_icc::MAX_RETRIES;
        reg.handle_core_reply(core, msg);
        reg.poll();

        assert_eq!(*resolved.borrow(), Some(false));
        assert!(icc.try_recv(core).unwrap().is_none());
    }

    #[test]
    fn nic_with_unknown_device_is_rejected_and_rolls_back() {
        let mut reg = registry(4);
        let mut spec = basic_spec(1);
        spec.nics.push(NicSpec {
            dev: "doesnotexist".into(),
            mac: 0,
            pool_blocks: 1,
            input_bandwidth: 0,
            output_bandwidth: 0,
            padding_head: 32,
            padding_tail: 32,
            input_queue_size: 0,
            output_queue_size: 0,
        });

        let used_before = reg.state.borrow().blocks.used_bytes();
        let id = reg.vm_create(spec);
        assert_eq!(id, 0);
        let used_after = reg.state.borrow().blocks.used_bytes();
        assert_eq!(used_before, used_after);
    }

    #[test]
    fn storage_write_then_read_round_trips() {
        let mut reg = registry(4);
        let id = reg.vm_create(basic_spec(1));

        reg.vm_storage_write(id, 0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        reg.vm_storage_read(id, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn vm_stdio_rejects_out_of_range_thread() {
        let mut reg = registry(4);
        let id = reg.vm_create(basic_spec(1));
        assert!(reg.vm_stdio(id, 5, 1, b"x").is_err());
    }

    #[test]
    fn vm_stdio_write_is_observed_by_the_idle_pump() {
        let mut reg = registry(4);
        let id = reg.vm_create(basic_spec(1));
        let core = {
            let state = reg.state.borrow();
            state.vms.get(&id).unwrap().cores[0]
        };

        reg.vm_status_set(id, VmStatus::Start, |_| {});
        reg.handle_core_reply(
            core,
            IccMessage::new(
                core,
                IccPayload::Started(pn_icc::StartedPayload {
                    stdin: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
                    stdout: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
                    stderr: pn_icc::StdioRingHandle { ptr: 0, head: 0, tail: 0, size: 0 },
                }),
            ),
        );
        reg.poll();
        assert_eq!(reg.vm_status_get(id), Some(VmStatus::Start));

        let observed = Rc::new(RefCell::new(None));
        let out = Rc::clone(&observed);
        reg.set_stdio_handler(Box::new(move |vmid, thread, fd, buf| {
            *out.borrow_mut() = Some((vmid, thread, fd, buf.to_vec()));
        }));

        assert_eq!(reg.vm_stdio(id, 0, 1, b"HELLO").unwrap(), 5);
        reg.poll();

        assert_eq!(*observed.borrow(), Some((id, 0, 1, b"HELLO".to_vec())));
    }
}
