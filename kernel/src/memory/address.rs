// =============================================================================
// Opal — Physical and Virtual Address Types
// =============================================================================
//
// Confusing a physical address with a virtual address is one of the most
// catastrophic bugs in kernel code, so the two live in separate newtypes
// and converting between them requires an explicit call.
//
// HHDM (Higher Half Direct Map):
//   Limine maps ALL physical memory at a fixed virtual offset. If the
//   offset is 0xFFFF_8000_0000_0000, then physical 0x1000 is readable at
//   virtual 0xFFFF_8000_0000_1000. `PhysAddr::to_virt` is the single
//   doorway through which the kernel touches physical memory; the memory
//   manager never does the offset arithmetic anywhere else.
//
// `VirtAddr` deliberately accepts any 64-bit value: the page-table walker
// is driven purely by bits 12..48, and diagnostic mappings at non-canonical
// addresses are part of the kernel's own self-tests.
// =============================================================================

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Size of a standard page (4 KiB).
pub const PAGE_SIZE: u64 = 4096;

/// Size of a large/huge page (2 MiB).
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Bit shift for standard pages (4K = 2^12).
pub const PAGE_SHIFT: u64 = 12;

/// The virtual offset where all physical memory is mapped. Set once during
/// early boot from the Limine HHDM response; zero until then.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// One-time initialization of the HHDM offset.
///
/// Must be called before any `PhysAddr::to_virt` call.
pub fn init_hhdm(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Relaxed);
}

/// Returns the configured HHDM offset.
#[inline]
pub fn hhdm_offset() -> u64 {
    let offset = HHDM_OFFSET.load(Ordering::Relaxed);
    debug_assert!(offset != 0, "HHDM offset not initialized");
    offset
}

// =============================================================================
// PhysAddr
// =============================================================================

/// A physical memory address.
///
/// What the CPU sends on the memory bus after page-table translation.
/// On x86_64 a physical address fits in 52 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Creates a new physical address.
    ///
    /// Debug-asserts that the address fits in the architectural 52 bits.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        debug_assert!(
            addr & 0xFFF0_0000_0000_0000 == 0,
            "physical address exceeds 52-bit limit"
        );
        Self(addr)
    }

    /// The zero address; used as a reserved sentinel (frame 0 is never
    /// handed out by the frame allocator).
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the index of the 4 KiB frame containing this address.
    #[inline]
    pub const fn frame_index(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    /// The physical address of the frame with the given index.
    #[inline]
    pub const fn from_frame_index(index: usize) -> Self {
        Self::new((index as u64) << PAGE_SHIFT)
    }

    /// Converts this physical address to its HHDM virtual mapping.
    #[inline]
    pub fn to_virt(self) -> VirtAddr {
        VirtAddr::new(self.0 + hhdm_offset())
    }

    /// Returns true if this address is 4 KiB aligned.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Aligns this address down to the nearest page boundary.
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Aligns this address up to the nearest page boundary.
    #[inline]
    pub const fn page_align_up(self) -> Self {
        Self((self.0 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
    }

    /// Returns true if this is the zero address.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#012X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#012X}", self.0)
    }
}

impl core::ops::Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

impl core::ops::Sub<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn sub(self, offset: u64) -> Self {
        Self::new(self.0 - offset)
    }
}

impl core::ops::Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: PhysAddr) -> u64 {
        self.0 - other.0
    }
}

// =============================================================================
// VirtAddr
// =============================================================================

/// A virtual memory address.
///
/// What the CPU uses for all memory accesses; translated to a physical
/// address by the 4-level page-table walk. Bits 12..48 carry the four
/// 9-bit table indices plus the page offset:
///
/// ```text
/// 63       48 47    39 38    30 29    21 20    12 11       0
/// ┌──────────┬────────┬────────┬────────┬────────┬─────────┐
/// │ sign ext │ PML4   │  PDPT  │   PD   │   PT   │ Offset  │
/// └──────────┴────────┴────────┴────────┴────────┴─────────┘
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Creates a new virtual address. No canonicality requirement; the
    /// walker only consumes bits 12..48.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts this virtual address to a raw pointer. The bridge between
    /// the typed address world and actual memory access.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts this virtual address to a mutable raw pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns true if bits 48..64 correctly sign-extend bit 47.
    #[inline]
    pub const fn is_canonical(self) -> bool {
        let canonical = ((self.0 << 16) as i64 >> 16) as u64;
        self.0 == canonical
    }

    /// Returns true if this address is 4 KiB aligned.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Aligns this address down to the nearest page boundary.
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Aligns this address up to the nearest page boundary.
    #[inline]
    pub const fn page_align_up(self) -> Self {
        Self((self.0 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
    }

    /// Returns true if this address is 2 MiB aligned.
    #[inline]
    pub const fn is_huge_aligned(self) -> bool {
        self.0 & (HUGE_PAGE_SIZE - 1) == 0
    }

    /// The page-table index for `level`, where level 0 selects the PT
    /// entry and level 3 the PML4 entry: `(addr >> (12 + 9*level)) & 0x1FF`.
    #[inline]
    pub const fn table_index(self, level: usize) -> usize {
        ((self.0 >> (12 + 9 * level as u64)) & 0x1FF) as usize
    }

    /// The 12-bit offset within the 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl core::ops::Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

impl core::ops::Sub<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, offset: u64) -> Self {
        Self::new(self.0 - offset)
    }
}

impl core::ops::Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: VirtAddr) -> u64 {
        self.0 - other.0
    }
}

// =============================================================================
// Tests
// =============================================================================
