//! Physical memory map constants. Mirrors `docs/mmap.md` in the original kernel: everything
//! below [`KERNEL_TEXT_AREA_END`] is reserved BIOS/descriptor-table/kernel-text space, followed
//! by one [`KERNEL_DATA_AREA_SIZE`]-sized private data stripe per core (up to
//! [`MAX_CORE_COUNT`] of them), with the ramdisk placed right after the last stripe.

/// Real-mode interrupt vector table.
pub const IVT_AREA_START: u64 = 0x0;
pub const IVT_AREA_END: u64 = 0x0400;

/// BIOS data area.
pub const BDA_AREA_START: u64 = 0x0400;
pub const BDA_AREA_END: u64 = 0x0500;

pub const BIOS_AREA_START: u64 = IVT_AREA_START;
pub const BIOS_AREA_END: u64 = BDA_AREA_END;

/// Descriptor table area (GDT/IDT), 1 MiB to 2 MiB.
pub const DESC_TABLE_AREA_START: u64 = 0x100000;
pub const DESC_TABLE_AREA_END: u64 = 0x200000;

/// Kernel text area, 2 MiB to 4 MiB.
pub const KERNEL_TEXT_AREA_START: u64 = 0x200000;
pub const KERNEL_TEXT_AREA_SIZE: u64 = 0x200000;
pub const KERNEL_TEXT_AREA_END: u64 = KERNEL_TEXT_AREA_START + KERNEL_TEXT_AREA_SIZE;

/// Per-core private kernel data stripe, 2 MiB wide.
pub const KERNEL_DATA_AREA_START: u64 = 0x400000;
pub const KERNEL_DATA_AREA_SIZE: u64 = 0x200000;

/// PacketNgin supports at most this many cores; one data stripe is reserved per core.
pub const MAX_CORE_COUNT: usize = 16;

pub fn kernel_data_area(core_index: usize) -> (u64, u64) {
    let start = KERNEL_DATA_AREA_START + KERNEL_DATA_AREA_SIZE * core_index as u64;
    (start, start + KERNEL_DATA_AREA_SIZE)
}

/// Ramdisk placement: immediately after the last core's data stripe.
pub const RAMDISK_START: u64 = KERNEL_TEXT_AREA_START + KERNEL_TEXT_AREA_SIZE * MAX_CORE_COUNT as u64;

/// Block size used by the 2 MiB-granular block allocator.
pub const BLOCK_SIZE: u64 = 0x200000;
