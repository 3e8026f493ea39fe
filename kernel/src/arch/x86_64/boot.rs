// =============================================================================
// Opal — Limine Boot Protocol Interface
// =============================================================================
//
// The kernel binary carries static "request" structures; Limine scans the
// binary for their magic patterns during boot and writes pointers to the
// matching "response" structures before jumping to `_start`.
//
// Responses consumed here:
//   - HHDM offset     → phys P readable at virt P + offset
//   - Memory map      → which physical regions are usable/reserved/...
//   - Kernel address  → (physical_base, virtual_base) of the loaded image
//   - Framebuffer     → boot console surface (unused by the memory core)
//
// The accessors convert Limine types into the crate's own memory-map model
// (memory::memmap) so nothing past this module depends on the protocol.
// =============================================================================

use limine::request::{
    ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemoryMapRequest,
};
use limine::BaseRevision;

use crate::memory::memmap::{KernelAddress, MemoryRegion};

/// Limine base revision tag — tells Limine which protocol revision we speak.
#[used]
#[link_section = ".limine_requests"]
pub static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".limine_requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

/// The physical memory map: sorted by base address, non-overlapping.
#[used]
#[link_section = ".limine_requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

/// Where Limine loaded the kernel, physically and virtually. The difference
/// of the two is the kernel slide the VMM re-applies when it rebuilds the
/// kernel mappings.
#[used]
#[link_section = ".limine_requests"]
static KERNEL_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

#[used]
#[link_section = ".limine_requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

/// Retrieves the HHDM (Higher Half Direct Map) offset.
///
/// # Panics
/// If the response is missing — that is a boot protocol failure.
pub fn hhdm_offset() -> u64 {
    HHDM_REQUEST
        .get_response()
        .expect("Limine HHDM response not available")
        .offset()
}

/// Copies the Limine memory map into `buf` as crate-native regions.
///
/// Returns the number of entries written. Entries beyond `buf.len()` are
/// dropped with a warning; 128 slots cover every firmware seen in practice.
///
/// # Panics
/// If the memory map response is missing.
pub fn copy_memory_map(buf: &mut [MemoryRegion]) -> usize {
    let entries = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Limine memory map response not available")
        .entries();

    let count = entries.len().min(buf.len());
    if entries.len() > buf.len() {
        log::warn!(
            "memory map has {} entries, keeping first {}",
            entries.len(),
            buf.len()
        );
    }
    for (slot, entry) in buf.iter_mut().zip(entries.iter()) {
        *slot = MemoryRegion::from_limine(*entry);
    }
    count
}

/// Retrieves the kernel's load addresses.
///
/// # Panics
/// If the response is missing.
pub fn kernel_address() -> KernelAddress {
    let response = KERNEL_ADDRESS_REQUEST
        .get_response()
        .expect("Limine kernel address response not available");
    KernelAddress {
        physical_base: response.physical_base(),
        virtual_base: response.virtual_base(),
    }
}

/// Returns `(address, width, height, pitch)` of the first framebuffer, if
/// Limine set one up.
pub fn framebuffer() -> Option<(*mut u8, u64, u64, u64)> {
    let response = FRAMEBUFFER_REQUEST.get_response()?;
    let fb = response.framebuffers().next()?;
    Some((fb.addr(), fb.width(), fb.height(), fb.pitch()))
}
