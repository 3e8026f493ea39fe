// =============================================================================
// Opal — Virtual Memory Manager (4-Level Page Tables)
// =============================================================================
//
// Builds and edits x86-64 paging structures. All table frames come from
// the PMM and are touched exclusively through the HHDM, so the walker
// works identically whether the tables are live (loaded in CR3) or being
// prepared for another address space.
//
// TRANSLATION:
//   PML4 (level 3) → PDPT (level 2) → PD (level 1) → PT (level 0) → page.
//   Each level is a 4 KiB table of 512 8-byte entries; the index for
//   level L is (virt >> (12 + 9·L)) & 0x1FF. A PD entry with the PS bit
//   maps a 2 MiB huge page and ends the walk one level early.
//
// ADDRESS SPACES:
//   An address space is identified by the physical address of its PML4.
//   The high half (entries 256..512) of every address space is shared
//   with the kernel's master PML4 by direct entry copy at creation; the
//   low half is private. The shared entries must never be edited through
//   a child.
//
// LOCKING:
//   None. Each address space's tables are edited by at most one hardware
//   thread at a time; callers serialize. (Documented restriction.)
// =============================================================================

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::arch::cpu;
use crate::memory::address::{PhysAddr, VirtAddr, HUGE_PAGE_SIZE, PAGE_SIZE};
use crate::memory::memmap::{BootMemoryInfo, MemoryKind};
use crate::memory::pmm;

/// Mask extracting the physical address (bits 12..52) from an entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Unmapping more pages than this in one call reloads CR3 instead of
/// issuing per-page invalidations.
const TLB_FLUSH_THRESHOLD: u64 = 32;

// =============================================================================
// Entry flags
// =============================================================================

bitflags! {
    /// x86-64 page-table entry flags.
    ///
    /// The effective permissions of a mapping are the intersection of the
    /// flags at every level, so intermediate entries are kept permissive
    /// and access is gated at the leaf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is valid; all other bits are ignored when clear.
        const PRESENT       = 1 << 0;
        /// Writes allowed.
        const WRITABLE      = 1 << 1;
        /// Ring-3 access allowed.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled (device memory).
        const NO_CACHE      = 1 << 4;
        /// Set by the CPU on any access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on a write (leaf entries).
        const DIRTY         = 1 << 6;
        /// In a PD entry: 2 MiB huge page, walk ends here.
        const HUGE          = 1 << 7;
        /// TLB entry survives CR3 switches.
        const GLOBAL        = 1 << 8;
        /// Instruction fetches fault (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageTableFlags {
    /// Kernel read-write mapping.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);

    /// Intermediate-table entry: permissive on purpose, the leaf gates
    /// access.
    pub const INTERMEDIATE: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}

// =============================================================================
// Entries and tables
// =============================================================================

/// One 8-byte entry of a page table.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Raw bits.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// The physical address stored in the entry. Only meaningful when
    /// present.
    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn is_huge(self) -> bool {
        self.0 & PageTableFlags::HUGE.bits() != 0
    }

    /// Points the entry at `addr` with `flags`. `addr` must be 4 KiB
    /// aligned.
    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        debug_assert!(addr.is_page_aligned());
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    /// Clears the entry (non-present).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE({} {:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

/// A 4 KiB page table: 512 entries, page-aligned so it drops straight
/// into a physical frame.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// The table living in `phys`, viewed through the HHDM.
///
/// # Safety
/// `phys` must be the page-aligned physical address of a live page table,
/// and the caller must be the only editor of the address space.
unsafe fn table_mut<'a>(phys: PhysAddr) -> &'a mut PageTable {
    unsafe { &mut *phys.to_virt().as_mut_ptr::<PageTable>() }
}

// =============================================================================
// Errors
// =============================================================================

/// Why a mapping operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The PMM could not supply an intermediate table.
    OutOfMemory,
    /// A huge-page operation was given a non-2 MiB-aligned address.
    Misaligned,
    /// A huge mapping at the PD level blocks the 4 KiB walk.
    HugePageConflict,
}

/// Why an unmap failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// Nothing is mapped at the address.
    NotMapped,
    /// A huge mapping covers the address; it cannot be unmapped 4 KiB at
    /// a time.
    HugePageConflict,
}

/// Why an address-space operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// Refusing to destroy the kernel address space.
    ProtectedRoot,
}

// =============================================================================
// Kernel root
// =============================================================================

/// Physical address of the kernel's master PML4; zero until `init`.
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);

/// The kernel's master page-table root.
pub fn kernel_root() -> PhysAddr {
    PhysAddr::new(KERNEL_PML4.load(Ordering::Relaxed))
}

/// Allocates a fresh zeroed page table and returns its physical address.
pub fn new_table() -> Option<PhysAddr> {
    pmm::alloc_page_zeroed()
}

// =============================================================================
// Map / unmap / translate
// =============================================================================

/// Walks levels 3..1 below `root` for `virt`, allocating missing
/// intermediate tables, and returns the PT's physical address.
fn ensure_walk(root: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, MapError> {
    let mut table_phys = root;
    for level in (1..=3).rev() {
        // SAFETY: table_phys is the root (caller contract) or an
        // intermediate installed by this walk.
        let table = unsafe { table_mut(table_phys) };
        let entry = &mut table[virt.table_index(level)];
        if entry.is_present() {
            // A huge leaf at the PDPT (1 GiB) or PD (2 MiB) level blocks
            // the walk to a 4 KiB entry.
            if level < 3 && entry.is_huge() {
                return Err(MapError::HugePageConflict);
            }
            table_phys = entry.addr();
        } else {
            let frame = pmm::alloc_page_zeroed().ok_or(MapError::OutOfMemory)?;
            entry.set(frame, PageTableFlags::INTERMEDIATE);
            table_phys = frame;
        }
    }
    Ok(table_phys)
}

/// Walks levels 3..1 without allocating; `Ok` is the PT's physical
/// address.
fn walk_to_pt(root: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
    let mut table_phys = root;
    for level in (1..=3).rev() {
        // SAFETY: as in ensure_walk.
        let table = unsafe { table_mut(table_phys) };
        let entry = table[virt.table_index(level)];
        if !entry.is_present() {
            return Err(UnmapError::NotMapped);
        }
        if level < 3 && entry.is_huge() {
            return Err(UnmapError::HugePageConflict);
        }
        table_phys = entry.addr();
    }
    Ok(table_phys)
}

/// Maps the 4 KiB page at `virt` to the frame at `phys`.
///
/// Misaligned addresses are aligned down with a warning. Intermediate
/// tables are created on demand (permissive; the leaf gates access). A
/// present leaf is overwritten with a remap warning. The TLB entry for
/// `virt` is always invalidated.
pub fn map(
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    let (virt, phys) = align_pair(virt, phys);

    let pt_phys = ensure_walk(root, virt)?;
    // SAFETY: ensure_walk returned a live PT.
    let pt = unsafe { table_mut(pt_phys) };
    let leaf = &mut pt[virt.table_index(0)];
    if leaf.is_present() {
        log::warn!("remapping {} (was {})", virt, leaf.addr());
    }
    leaf.set(phys, flags);

    cpu::invlpg(virt.as_u64());
    Ok(())
}

fn align_pair(virt: VirtAddr, phys: PhysAddr) -> (VirtAddr, PhysAddr) {
    if !virt.is_page_aligned() || !phys.is_page_aligned() {
        log::warn!("map: aligning {} / {} down to page boundaries", virt, phys);
        (virt.page_align_down(), phys.page_align_down())
    } else {
        (virt, phys)
    }
}

/// Maps a 2 MiB huge page at the PD level. Both addresses must be 2 MiB
/// aligned.
pub fn map_huge(
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    if !virt.is_huge_aligned() || phys.as_u64() % HUGE_PAGE_SIZE != 0 {
        log::warn!("map_huge: {} / {} not 2 MiB aligned", virt, phys);
        return Err(MapError::Misaligned);
    }

    // Walk levels 3..2 only; the PD entry becomes the leaf.
    let mut table_phys = root;
    for level in (2..=3).rev() {
        // SAFETY: as in ensure_walk.
        let table = unsafe { table_mut(table_phys) };
        let entry = &mut table[virt.table_index(level)];
        if entry.is_present() {
            if level == 2 && entry.is_huge() {
                return Err(MapError::HugePageConflict);
            }
            table_phys = entry.addr();
        } else {
            let frame = pmm::alloc_page_zeroed().ok_or(MapError::OutOfMemory)?;
            entry.set(frame, PageTableFlags::INTERMEDIATE);
            table_phys = frame;
        }
    }

    // SAFETY: table_phys is the PD for virt.
    let pd = unsafe { table_mut(table_phys) };
    let entry = &mut pd[virt.table_index(1)];
    if entry.is_present() {
        log::warn!("remapping huge {} (was {})", virt, entry.addr());
    }
    entry.set(phys, flags | PageTableFlags::HUGE);

    cpu::invlpg(virt.as_u64());
    Ok(())
}

/// Clears the leaf entry for `virt` without touching the TLB; returns the
/// frame that was mapped.
fn unmap_no_flush(root: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
    let virt = virt.page_align_down();
    let pt_phys = walk_to_pt(root, virt)?;
    // SAFETY: walk_to_pt returned a live PT.
    let pt = unsafe { table_mut(pt_phys) };
    let leaf = &mut pt[virt.table_index(0)];
    if !leaf.is_present() {
        return Err(UnmapError::NotMapped);
    }
    let phys = leaf.addr();
    leaf.clear();
    Ok(phys)
}

/// Unmaps the 4 KiB page at `virt` and invalidates its TLB entry.
/// Returns the frame that was mapped; the frame itself is not freed.
pub fn unmap(root: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
    match unmap_no_flush(root, virt) {
        Ok(phys) => {
            cpu::invlpg(virt.as_u64());
            Ok(phys)
        }
        Err(e) => {
            log::warn!("unmap {}: {:?}", virt, e);
            Err(e)
        }
    }
}

/// Maps `size` bytes as consecutive 4 KiB pages starting at
/// (`virt`, `phys`).
pub fn map_range(
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    size: u64,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    for i in 0..pages {
        map(root, virt + i * PAGE_SIZE, phys + i * PAGE_SIZE, flags)?;
    }
    Ok(())
}

/// Unmaps `size` bytes of 4 KiB pages starting at `virt`. Ranges above
/// 32 pages flush the whole TLB once instead of invalidating per page.
pub fn unmap_range(root: PhysAddr, virt: VirtAddr, size: u64) {
    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    if pages > TLB_FLUSH_THRESHOLD {
        for i in 0..pages {
            if let Err(e) = unmap_no_flush(root, virt + i * PAGE_SIZE) {
                log::warn!("unmap_range {}: {:?}", virt + i * PAGE_SIZE, e);
            }
        }
        cpu::flush_tlb();
    } else {
        for i in 0..pages {
            // unmap() logs its own refusals.
            let _ = unmap(root, virt + i * PAGE_SIZE);
        }
    }
}

/// Translates `virt` by walking the tables under `root`.
///
/// Composes huge leaves at the PDPT (1 GiB) and PD (2 MiB) levels.
/// Returns `None` when any level is absent.
pub fn translate(root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    // SAFETY: root is a live table per the caller contract; children come
    // from present entries.
    let pml4 = unsafe { table_mut(root) };
    let pml4e = pml4[virt.table_index(3)];
    if !pml4e.is_present() {
        return None;
    }

    let pdpt = unsafe { table_mut(pml4e.addr()) };
    let pdpte = pdpt[virt.table_index(2)];
    if !pdpte.is_present() {
        return None;
    }
    if pdpte.is_huge() {
        let offset = virt.as_u64() & 0x3FFF_FFFF;
        return Some(PhysAddr::new((pdpte.raw() & 0x000F_FFFF_C000_0000) | offset));
    }

    let pd = unsafe { table_mut(pdpte.addr()) };
    let pde = pd[virt.table_index(1)];
    if !pde.is_present() {
        return None;
    }
    if pde.is_huge() {
        let offset = virt.as_u64() & (HUGE_PAGE_SIZE - 1);
        return Some(PhysAddr::new((pde.raw() & 0x000F_FFFF_FFE0_0000) | offset));
    }

    let pt = unsafe { table_mut(pde.addr()) };
    let pte = pt[virt.table_index(0)];
    if !pte.is_present() {
        return None;
    }

    Some(PhysAddr::new(pte.addr().as_u64() | virt.page_offset()))
}

// =============================================================================
// Address spaces
// =============================================================================

/// Creates a new address space sharing the kernel's high half.
///
/// The low half (PML4 entries 0..256) starts empty; entries 256..512 are
/// copied verbatim from the kernel PML4 so kernel code, the HHDM, and the
/// heap stay reachable. Returns the physical address of the new PML4.
pub fn create_address_space() -> Option<PhysAddr> {
    let kernel = kernel_root();
    if kernel.is_zero() {
        log::error!("create_address_space before VMM init");
        return None;
    }

    let new_root = pmm::alloc_page_zeroed()?;

    let src = kernel.to_virt().as_ptr::<u64>();
    let dst = new_root.to_virt().as_mut_ptr::<u64>();
    // SAFETY: both tables are live, page-sized, and reached through the
    // HHDM; volatile matches how the CPU sees the kernel's entries.
    unsafe {
        for i in 256..512 {
            let entry = ptr::read_volatile(src.add(i));
            ptr::write_volatile(dst.add(i), entry);
        }
    }

    Some(new_root)
}

/// Tears down the private half of an address space and frees its tables.
///
/// Walks PML4 entries 0..256 and frees each PT (unless the PD entry is a
/// huge leaf), each PD, each PDPT, and finally the PML4 itself. Frames
/// backing leaf mappings are the caller's responsibility. The kernel
/// address space is refused.
pub fn destroy_address_space(root: PhysAddr) -> Result<(), VmmError> {
    if root == kernel_root() {
        log::error!("refusing to destroy the kernel address space");
        return Err(VmmError::ProtectedRoot);
    }

    // SAFETY: root identifies a live, exclusively-owned address space.
    let pml4 = unsafe { table_mut(root) };
    for i in 0..256 {
        let pml4e = pml4[i];
        if !pml4e.is_present() {
            continue;
        }
        let pdpt = unsafe { table_mut(pml4e.addr()) };
        for j in 0..512 {
            let pdpte = pdpt[j];
            if !pdpte.is_present() {
                continue;
            }
            let pd = unsafe { table_mut(pdpte.addr()) };
            for k in 0..512 {
                let pde = pd[k];
                if !pde.is_present() || pde.is_huge() {
                    continue;
                }
                pmm::free_page(pde.addr());
            }
            pmm::free_page(pdpte.addr());
        }
        pmm::free_page(pml4e.addr());
    }
    pmm::free_page(root);
    Ok(())
}

/// Materializes intermediate tables down to the PD level for
/// `[virt, virt + size)`, so later mappings in the range cannot fail on
/// table allocation.
pub fn preallocate_range(root: PhysAddr, virt: VirtAddr, size: u64) -> Result<(), MapError> {
    let mut addr = virt.page_align_down();
    let end = virt + size;
    while addr.as_u64() < end.as_u64() {
        let mut table_phys = root;
        for level in (2..=3).rev() {
            // SAFETY: as in ensure_walk.
            let table = unsafe { table_mut(table_phys) };
            let entry = &mut table[addr.table_index(level)];
            if entry.is_present() {
                if level == 2 && entry.is_huge() {
                    return Err(MapError::HugePageConflict);
                }
                table_phys = entry.addr();
            } else {
                let frame = pmm::alloc_page_zeroed().ok_or(MapError::OutOfMemory)?;
                entry.set(frame, PageTableFlags::INTERMEDIATE);
                table_phys = frame;
            }
        }
        addr = addr + HUGE_PAGE_SIZE;
    }
    Ok(())
}

/// Loads `root` into CR3, switching the active address space.
///
/// # Safety
/// `root` must be a valid PML4 that maps the currently executing code.
pub unsafe fn switch(root: PhysAddr) {
    unsafe { cpu::write_cr3(root.as_u64()) }
}

// =============================================================================
// Kernel address-space construction
// =============================================================================

/// Builds the kernel's own page tables from the boot memory map and
/// switches to them:
///
///   - kernel/module regions mapped at the kernel slide, R/W
///   - framebuffer regions identity-mapped, R/W
///   - every region (reserved included) mapped at +HHDM so the direct
///     map survives the switch away from the bootloader's tables
///
/// # Panics
/// On double init or if the PMM cannot supply the tables — both are boot
/// failures.
pub fn init(boot: &BootMemoryInfo) {
    assert!(kernel_root().is_zero(), "VMM already initialized");

    let root = pmm::alloc_page_zeroed().expect("no frame for kernel PML4");
    let slide = boot.kernel.slide();

    for region in boot.regions {
        match region.kind {
            MemoryKind::KernelAndModules => {
                let virt_start = region.base.wrapping_add(slide);
                map_range(
                    root,
                    VirtAddr::new(virt_start),
                    PhysAddr::new(region.base),
                    region.length,
                    PageTableFlags::KERNEL_RW,
                )
                .expect("failed to map kernel image");
                log::info!("kernel mapped at {:#018X}", virt_start);
            }
            MemoryKind::Framebuffer => {
                map_range(
                    root,
                    VirtAddr::new(region.base),
                    PhysAddr::new(region.base),
                    region.length,
                    PageTableFlags::KERNEL_RW,
                )
                .expect("failed to map framebuffer");
            }
            _ => {}
        }

        // Direct-map view: phys + hhdm → phys, for every region.
        map_range(
            root,
            VirtAddr::new(region.base + boot.hhdm_offset),
            PhysAddr::new(region.base),
            region.length,
            PageTableFlags::KERNEL_RW,
        )
        .expect("failed to map HHDM view");
    }

    KERNEL_PML4.store(root.as_u64(), Ordering::Relaxed);

    // SAFETY: the tables just built map the kernel image and the HHDM.
    unsafe {
        switch(root);
    }
    log::info!("kernel PML4 at {}", root);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address;
    use crate::memory::memmap::{KernelAddress, MemoryRegion};
    use crate::memory::testutil;

    const RW: PageTableFlags = PageTableFlags::KERNEL_RW;

    fn setup() -> std::sync::MutexGuard<'static, ()> {
        let guard = testutil::global_lock();
        testutil::init_global_pmm();
        guard
    }

    /// Builds the kernel address space once, over a tiny synthetic boot
    /// map, so create/destroy tests have a master PML4 to share.
    fn ensure_kernel_space() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let kbase = testutil::take_window(16 * PAGE_SIZE as usize);
            let regions = [MemoryRegion {
                base: kbase,
                length: 16 * PAGE_SIZE,
                kind: MemoryKind::KernelAndModules,
            }];
            let boot = BootMemoryInfo {
                regions: &regions,
                hhdm_offset: address::hhdm_offset(),
                kernel: KernelAddress {
                    physical_base: kbase,
                    virtual_base: 0xFFFF_FFFF_8000_0000,
                },
            };
            init(&boot);
        });
    }

    #[test]
    fn scenario_map_write_translate_unmap() {
        let _g = setup();

        let root = new_table().unwrap();
        let v = VirtAddr::new(0xDEAD_0000_0000);
        let p = pmm::alloc_page().unwrap();

        map(root, v, p, RW).unwrap();
        assert_eq!(translate(root, v), Some(p));

        // The mapping is not live on the test CPU, but the HHDM view of
        // the same frame is: write through it and read back.
        let hhdm_ptr = p.to_virt().as_mut_ptr::<u64>();
        unsafe {
            ptr::write_volatile(hhdm_ptr, 0x0123_4567_89AB_CDEF);
            assert_eq!(ptr::read_volatile(hhdm_ptr), 0x0123_4567_89AB_CDEF);
        }

        assert_eq!(unmap(root, v), Ok(p));
        assert_eq!(translate(root, v), None);

        pmm::free_page(p);
    }

    #[test]
    fn translate_composes_page_offset() {
        let _g = setup();

        let root = new_table().unwrap();
        let p = pmm::alloc_page().unwrap();
        let v = VirtAddr::new(0x0000_7000_0000_0000);

        map(root, v, p, RW).unwrap();
        assert_eq!(translate(root, v + 0xABC), Some(p + 0xABC));

        unmap(root, v).unwrap();
        pmm::free_page(p);
    }

    #[test]
    fn misaligned_map_aligns_down_with_warning() {
        let _g = setup();

        let root = new_table().unwrap();
        let p = pmm::alloc_page().unwrap();

        map(root, VirtAddr::new(0x5000_0123), p + 0, RW).unwrap();
        assert_eq!(translate(root, VirtAddr::new(0x5000_0000)), Some(p));

        unmap(root, VirtAddr::new(0x5000_0000)).unwrap();
        pmm::free_page(p);
    }

    #[test]
    fn remap_overwrites_after_warning() {
        let _g = setup();

        let root = new_table().unwrap();
        let p1 = pmm::alloc_page().unwrap();
        let p2 = pmm::alloc_page().unwrap();
        let v = VirtAddr::new(0x6000_0000);

        map(root, v, p1, RW).unwrap();
        map(root, v, p2, RW).unwrap();
        assert_eq!(translate(root, v), Some(p2));

        unmap(root, v).unwrap();
        pmm::free_page(p1);
        pmm::free_page(p2);
    }

    #[test]
    fn scenario_map_range_four_pages() {
        let _g = setup();

        let root = new_table().unwrap();
        let q = pmm::alloc_pages(4).unwrap();
        let v = VirtAddr::new(0xBEEF_0000_0000);

        map_range(root, v, q, 16384, RW).unwrap();
        for i in 0..4u64 {
            assert_eq!(translate(root, v + i * PAGE_SIZE), Some(q + i * PAGE_SIZE));
        }

        unmap_range(root, v, 16384);
        for i in 0..4u64 {
            assert_eq!(translate(root, v + i * PAGE_SIZE), None);
        }
        pmm::free_pages(q, 4);
    }

    #[test]
    fn unmap_range_above_threshold_uses_full_flush() {
        let _g = setup();

        let root = new_table().unwrap();
        let q = pmm::alloc_pages(64).unwrap();
        let v = VirtAddr::new(0x7000_0000);

        map_range(root, v, q, 64 * PAGE_SIZE, RW).unwrap();
        unmap_range(root, v, 64 * PAGE_SIZE);
        for i in 0..64u64 {
            assert_eq!(translate(root, v + i * PAGE_SIZE), None);
        }
        pmm::free_pages(q, 64);
    }

    #[test]
    fn huge_mapping_translates_across_whole_page() {
        let _g = setup();

        let root = new_table().unwrap();
        // An order-9 block is 2 MiB and 2 MiB aligned.
        let p = pmm::alloc_pages(512).unwrap();
        assert_eq!(p.as_u64() % HUGE_PAGE_SIZE, 0);
        let v = VirtAddr::new(0x4000_0000);

        map_huge(root, v, p, RW).unwrap();
        for d in [0u64, 0x123, PAGE_SIZE, 1024 * 1024, HUGE_PAGE_SIZE - 1] {
            assert_eq!(translate(root, v + d), Some(p + d));
        }

        pmm::free_pages(p, 512);
    }

    #[test]
    fn huge_mapping_rejects_misalignment() {
        let _g = setup();

        let root = new_table().unwrap();
        let p = pmm::alloc_pages(512).unwrap();

        assert_eq!(
            map_huge(root, VirtAddr::new(0x4010_0000), p, RW),
            Err(MapError::Misaligned)
        );
        assert_eq!(
            map_huge(root, VirtAddr::new(0x4000_0000), p + PAGE_SIZE, RW),
            Err(MapError::Misaligned)
        );
        pmm::free_pages(p, 512);
    }

    #[test]
    fn unmap_of_unmapped_address_warns_and_errs() {
        let _g = setup();

        let root = new_table().unwrap();
        assert_eq!(
            unmap(root, VirtAddr::new(0x1234_5000)),
            Err(UnmapError::NotMapped)
        );
    }

    #[test]
    fn preallocate_makes_later_maps_allocation_free() {
        let _g = setup();

        let root = new_table().unwrap();
        let v = VirtAddr::new(0x5000_0000);
        preallocate_range(root, v, 4 * HUGE_PAGE_SIZE).unwrap();

        let p = pmm::alloc_page().unwrap();
        let before = pmm::stats().used_bytes;
        // The PD chain exists; mapping only fills the leaf. The PT level
        // is still created on demand, so preallocate one page's PT first.
        map(root, v, p, RW).unwrap();
        let after_first = pmm::stats().used_bytes;
        map(root, v + PAGE_SIZE, p, RW).unwrap();
        // Second map in the same PT allocates nothing.
        assert_eq!(pmm::stats().used_bytes, after_first);
        assert!(after_first <= before + PAGE_SIZE);

        unmap(root, v).unwrap();
        unmap(root, v + PAGE_SIZE).unwrap();
        pmm::free_page(p);
    }

    #[test]
    fn scenario_address_space_isolation() {
        let _g = setup();
        ensure_kernel_space();

        // Give the kernel half something to share.
        let kp = pmm::alloc_page().unwrap();
        map(
            kernel_root(),
            VirtAddr::new(0xFFFF_9000_0000_0000),
            kp,
            RW,
        )
        .unwrap();

        let child = create_address_space().unwrap();

        let kernel_tbl = unsafe { table_mut(kernel_root()) };
        let child_tbl = unsafe { table_mut(child) };
        for i in 0..256 {
            assert!(!child_tbl[i].is_present(), "low-half entry {} present", i);
        }
        for i in 256..512 {
            assert_eq!(
                child_tbl[i].raw(),
                kernel_tbl[i].raw(),
                "high-half entry {} differs",
                i
            );
        }

        destroy_address_space(child).unwrap();
        unmap(kernel_root(), VirtAddr::new(0xFFFF_9000_0000_0000)).unwrap();
        pmm::free_page(kp);
    }

    #[test]
    fn destroying_kernel_space_is_refused() {
        let _g = setup();
        ensure_kernel_space();

        assert_eq!(
            destroy_address_space(kernel_root()),
            Err(VmmError::ProtectedRoot)
        );
    }

    #[test]
    fn scenario_no_leak_through_destroy() {
        let _g = setup();
        ensure_kernel_space();

        let free_before = pmm::stats().free_bytes;

        let space = create_address_space().unwrap();
        let leaves = [
            (VirtAddr::new(0x1000), pmm::alloc_page().unwrap()),
            (VirtAddr::new(0x40_0000), pmm::alloc_page().unwrap()),
            (VirtAddr::new(0x2_0000_0000), pmm::alloc_page().unwrap()),
        ];
        for (v, p) in leaves {
            map(space, v, p, RW).unwrap();
        }

        destroy_address_space(space).unwrap();
        for (_, p) in leaves {
            pmm::free_page(p);
        }

        assert_eq!(pmm::stats().free_bytes, free_before);
    }
}
