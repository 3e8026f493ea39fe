// =============================================================================
// Opal — Memory Subsystem
// =============================================================================
//
// Everything between raw boot-reported RAM and kmalloc, in dependency
// order:
//
//   address.rs — PhysAddr/VirtAddr newtypes + the HHDM offset
//   memmap.rs  — crate-native boot memory map model
//   pmm.rs     — buddy frame allocator (bitmap + per-order free lists)
//   vmm.rs     — 4-level page tables and address spaces
//   slab.rs    — fixed-size object caches
//   heap.rs    — kmalloc/kfree/krealloc over slab classes + PMM blocks
// =============================================================================

pub mod address;
pub mod heap;
pub mod memmap;
pub mod pmm;
pub mod slab;
pub mod vmm;

#[cfg(test)]
pub(crate) mod testutil;

use self::memmap::BootMemoryInfo;

/// Brings up the whole memory subsystem in dependency order: HHDM offset,
/// frame allocator, kernel page tables (and the switch onto them), slab
/// facility, heap.
///
/// # Panics
/// On double init or when boot-critical allocations fail.
pub fn init(boot: &BootMemoryInfo) {
    address::init_hhdm(boot.hhdm_offset);
    memmap::log_memory_map(boot.regions);

    pmm::init(boot.regions);
    pmm::log_stats();

    vmm::init(boot);

    slab::init();
    heap::init();

    log::info!("memory subsystem up");
}
