// =============================================================================
// Opal — Kernel Entry Point
// =============================================================================
//
// Limine drops us here in long mode with the HHDM already active. Boot
// order: serial console, logger, memory map conversion, then the memory
// subsystem (PMM → VMM → slab → heap). After that the kernel idles.
//
// The hosted build of this binary is a stub; all testable logic lives in
// the library (`cargo test` runs against opal_kernel).
// =============================================================================

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_entry {
    use opal_kernel::arch::{boot, cpu, serial};
    use opal_kernel::kprintln;
    use opal_kernel::memory::{self, heap, memmap::BootMemoryInfo, memmap::MemoryRegion, pmm};
    use opal_kernel::util::logger;

    /// Entry point called by the Limine bootloader.
    #[no_mangle]
    unsafe extern "C" fn _start() -> ! {
        serial::init();
        logger::init();

        kprintln!();
        kprintln!("Opal kernel booting...");

        assert!(
            boot::BASE_REVISION.is_supported(),
            "bootloader does not support our Limine revision"
        );

        // Convert the Limine memory map into the crate-native model. The
        // buffer lives on the boot stack; the memory subsystem consumes
        // it during init and keeps nothing pointing at it.
        let mut regions = [MemoryRegion::EMPTY; 128];
        let count = boot::copy_memory_map(&mut regions);

        let boot_info = BootMemoryInfo {
            regions: &regions[..count],
            hhdm_offset: boot::hhdm_offset(),
            kernel: boot::kernel_address(),
        };

        memory::init(&boot_info);

        pmm::log_stats();
        heap::log_stats();
        kprintln!("Opal kernel up; idling.");

        loop {
            cpu::halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary has no hosted mode; build for the bare-metal
    // target (see linker.ld) to produce a bootable image.
    eprintln!("opal-kernel is a bare-metal binary; nothing to run on the host");
}
