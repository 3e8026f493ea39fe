// =============================================================================
// Opal — Boot Memory Map Model
// =============================================================================
//
// The crate-native view of the boot-provided inputs: a parsed memory map,
// the HHDM offset, and the kernel's load addresses. The conversion from
// Limine entry types happens here so the allocators never see protocol
// types — and so tests can fabricate maps freely.
// =============================================================================

use core::fmt;

/// Classification of a physical memory region, mirroring the boot
/// protocol's entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Free RAM the kernel may allocate.
    Usable,
    /// Firmware/hardware reserved; never touch.
    Reserved,
    /// ACPI tables; reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI Non-Volatile Storage; never touch.
    AcpiNvs,
    /// Defective RAM.
    Bad,
    /// The bootloader's own structures; reclaimable once boot info is
    /// consumed.
    BootloaderReclaimable,
    /// The kernel image and boot modules.
    KernelAndModules,
    /// The framebuffer aperture.
    Framebuffer,
}

impl MemoryKind {
    /// Human-readable name for the boot-time memory map dump.
    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Usable => "Usable",
            MemoryKind::Reserved => "Reserved",
            MemoryKind::AcpiReclaimable => "ACPI Reclaimable",
            MemoryKind::AcpiNvs => "ACPI NVS",
            MemoryKind::Bad => "Bad Memory",
            MemoryKind::BootloaderReclaimable => "Bootloader Reclaimable",
            MemoryKind::KernelAndModules => "Kernel/Modules",
            MemoryKind::Framebuffer => "Framebuffer",
        }
    }
}

/// One contiguous physical region from the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Region classification.
    pub kind: MemoryKind,
}

impl MemoryRegion {
    /// Placeholder for fixed-size conversion buffers.
    pub const EMPTY: Self = Self {
        base: 0,
        length: 0,
        kind: MemoryKind::Reserved,
    };

    /// One past the last byte of the region.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    #[inline]
    pub fn is_usable(&self) -> bool {
        self.kind == MemoryKind::Usable
    }

    /// Converts a Limine memory-map entry into the crate-native form.
    pub fn from_limine(entry: &limine::memory_map::Entry) -> Self {
        use limine::memory_map::EntryType;

        let ty = entry.entry_type;
        let kind = if ty == EntryType::USABLE {
            MemoryKind::Usable
        } else if ty == EntryType::ACPI_RECLAIMABLE {
            MemoryKind::AcpiReclaimable
        } else if ty == EntryType::ACPI_NVS {
            MemoryKind::AcpiNvs
        } else if ty == EntryType::BAD_MEMORY {
            MemoryKind::Bad
        } else if ty == EntryType::BOOTLOADER_RECLAIMABLE {
            MemoryKind::BootloaderReclaimable
        } else if ty == EntryType::EXECUTABLE_AND_MODULES {
            MemoryKind::KernelAndModules
        } else if ty == EntryType::FRAMEBUFFER {
            MemoryKind::Framebuffer
        } else {
            MemoryKind::Reserved
        };

        Self {
            base: entry.base,
            length: entry.length,
            kind,
        }
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#012X}..{:#012X} {}",
            self.base,
            self.end(),
            self.kind.name()
        )
    }
}

/// The kernel's load addresses as reported by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct KernelAddress {
    /// Where the kernel image sits in physical RAM.
    pub physical_base: u64,
    /// The higher-half virtual base the image was linked against.
    pub virtual_base: u64,
}

impl KernelAddress {
    /// The kernel slide: add this to a physical address inside the image
    /// to get its virtual address.
    #[inline]
    pub fn slide(&self) -> u64 {
        self.virtual_base.wrapping_sub(self.physical_base)
    }
}

/// Everything the memory manager consumes at init, bundled.
#[derive(Debug, Clone, Copy)]
pub struct BootMemoryInfo<'a> {
    pub regions: &'a [MemoryRegion],
    pub hhdm_offset: u64,
    pub kernel: KernelAddress,
}

/// Logs every memory-map entry plus the usable total, the way the boot
/// console has always shown it.
pub fn log_memory_map(regions: &[MemoryRegion]) {
    log::info!("memory map ({} entries):", regions.len());

    let mut usable: u64 = 0;
    for region in regions {
        log::info!("  {}", region);
        if region.is_usable() {
            usable += region.length;
        }
    }

    log::info!("total usable RAM: {} MiB", usable / 1024 / 1024);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_end_and_kind() {
        let r = MemoryRegion {
            base: 0x10_0000,
            length: 0x20_0000,
            kind: MemoryKind::Usable,
        };
        assert_eq!(r.end(), 0x30_0000);
        assert!(r.is_usable());
        assert_eq!(r.kind.name(), "Usable");
    }

    #[test]
    fn kernel_slide_wraps_into_higher_half() {
        let k = KernelAddress {
            physical_base: 0x20_0000,
            virtual_base: 0xFFFF_FFFF_8020_0000,
        };
        assert_eq!(k.slide(), 0xFFFF_FFFF_8000_0000);
        assert_eq!(k.physical_base.wrapping_add(k.slide()), k.virtual_base);
    }
}
