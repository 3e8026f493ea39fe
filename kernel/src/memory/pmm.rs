// =============================================================================
// Opal — Physical Memory Manager (Buddy Frame Allocator)
// =============================================================================
//
// The PMM owns every 4 KiB physical frame and hands out contiguous
// power-of-two blocks of them. Two structures cooperate:
//
// BITMAP:
//   One bit per frame from 0 to highest_usable_address/4096.
//   bit = 1 → frame is used/reserved/absent, bit = 0 → frame is free.
//   The bitmap is the ground truth for liveness and double-free detection.
//
// FREE LISTS:
//   For each order k in [0, 11], a doubly-linked list of free blocks of
//   2^k frames. The list nodes live *inside* the first frame of each free
//   block, reached through the HHDM — free memory stores its own
//   bookkeeping. A block in list k always starts at a frame index
//   divisible by 2^k, and a block and its buddy (index XOR 2^k) are never
//   both in list k: they would have coalesced into k+1.
//
// INITIALIZATION (3 passes over the boot memory map):
//   Pass 1: highest usable address → bitmap size.
//   Pass 2: place the bitmap in the first usable region that fits.
//   Pass 3: fill the bitmap with 1s, clear usable regions, then re-mark
//           the bitmap's own frames and everything below 1 MiB; finally
//           enroll each free sub-range into the largest aligned order.
//
// THREAD SAFETY:
//   The global allocator is protected by a single spinlock; allocation
//   and free are fully serialized.
// =============================================================================

use core::fmt;
use core::ptr;

use crate::memory::address::{self, PhysAddr, PAGE_SIZE};
use crate::memory::memmap::MemoryRegion;
use crate::sync::SpinLock;

/// Largest block order: 2^11 frames = 8 MiB.
pub const MAX_ORDER: usize = 11;

/// Number of free lists (orders 0 through 11).
pub const ORDER_COUNT: usize = MAX_ORDER + 1;

/// Cap on a single contiguous allocation, in pages.
pub const MAX_CONTIGUOUS_PAGES: usize = 1 << MAX_ORDER;

/// Frames below 1 MiB stay reserved forever (legacy/firmware structures,
/// and frame 0 doubles as the null sentinel).
const PROTECTED_LOW_FRAMES: usize = 1024 * 1024 / PAGE_SIZE as usize;

// =============================================================================
// Public types
// =============================================================================

/// Why a PMM operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No free block of the required order at any splittable level.
    OutOfMemory,
    /// Address below the protected low region, past the end of tracked
    /// memory, or misaligned for its order.
    InvalidAddress,
    /// Zero pages, or more than `MAX_CONTIGUOUS_PAGES`.
    InvalidCount,
    /// The block (or part of it) is already free in the bitmap.
    DoubleFree,
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PmmError::OutOfMemory => "out of physical memory",
            PmmError::InvalidAddress => "invalid physical address",
            PmmError::InvalidCount => "invalid page count",
            PmmError::DoubleFree => "double free",
        };
        f.write_str(s)
    }
}

/// Snapshot of physical memory usage.
#[derive(Debug, Clone, Copy)]
pub struct PmmStats {
    /// Bytes tracked: the highest usable physical address.
    pub total_bytes: u64,
    /// Bytes currently marked used (including reserved holes).
    pub used_bytes: u64,
    /// Bytes currently free.
    pub free_bytes: u64,
    /// Free block count per order.
    pub free_blocks: [usize; ORDER_COUNT],
}

// =============================================================================
// Free-list nodes (embedded in free memory)
// =============================================================================

/// Link node written into the first frame of every free block. The `order`
/// field lets `free` verify that a bitmap-free buddy really is enrolled at
/// the order being coalesced before unlinking it.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
    prev: *mut FreeNode,
    order: usize,
}

/// One order's free list: head pointer plus length.
struct FreeList {
    head: *mut FreeNode,
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    /// Pushes `node` at the head. `node` must point into an unused frame.
    unsafe fn push(&mut self, node: *mut FreeNode, order: usize) {
        unsafe {
            (*node).next = self.head;
            (*node).prev = ptr::null_mut();
            (*node).order = order;
            if !self.head.is_null() {
                (*self.head).prev = node;
            }
        }
        self.head = node;
        self.len += 1;
    }

    /// Detaches and returns the head node, if any.
    unsafe fn pop(&mut self) -> Option<*mut FreeNode> {
        if self.head.is_null() {
            return None;
        }
        let node = self.head;
        unsafe {
            self.head = (*node).next;
            if !self.head.is_null() {
                (*self.head).prev = ptr::null_mut();
            }
        }
        self.len -= 1;
        Some(node)
    }

    /// Unlinks `node`, which must currently be a member of this list.
    unsafe fn remove(&mut self, node: *mut FreeNode) {
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
        self.len -= 1;
    }
}

// =============================================================================
// The allocator
// =============================================================================

/// The buddy allocator. Not exposed directly — all kernel access goes
/// through the module-level functions, which hold the PMM spinlock.
struct BuddyAllocator {
    /// HHDM pointer to the bitmap.
    bitmap: *mut u8,
    /// Bitmap size in bytes.
    bitmap_bytes: usize,
    /// Where the bitmap itself sits in physical memory.
    bitmap_phys: PhysAddr,
    /// Frames occupied by the bitmap.
    bitmap_frames: usize,
    /// Frames tracked: highest usable address / 4096.
    total_frames: usize,
    /// Highest usable physical address (exclusive).
    highest_addr: u64,
    /// Frames currently marked used.
    used_frames: usize,
    /// Per-order free lists.
    free_lists: [FreeList; ORDER_COUNT],
}

// SAFETY: The raw pointers are only dereferenced while the owner holds the
// PMM spinlock (or, in tests, has exclusive ownership of the instance).
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// # Panics
    /// If no usable region can hold the bitmap.
    fn new(regions: &[MemoryRegion]) -> Self {
        // Pass 1: highest usable address determines the bitmap size.
        // Reserved holes below it are covered too (and stay marked used).
        let mut highest_addr: u64 = 0;
        for region in regions.iter().filter(|r| r.is_usable()) {
            if region.end() > highest_addr {
                highest_addr = region.end();
            }
        }
        assert!(highest_addr > 0, "no usable memory in the boot map");

        let total_frames = (highest_addr / PAGE_SIZE) as usize;
        let bitmap_bytes = (total_frames + 7) / 8;
        let bitmap_frames = (bitmap_bytes + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;

        // Pass 2: place the bitmap in the first usable region that fits.
        // Skip base 0 so frame 0 keeps its null-sentinel role.
        let bitmap_phys = regions
            .iter()
            .find(|r| {
                r.is_usable() && r.base > 0 && r.length >= (bitmap_frames as u64) * PAGE_SIZE
            })
            .map(|r| PhysAddr::new(r.base))
            .expect("no usable region large enough for the PMM bitmap");

        let bitmap = bitmap_phys.to_virt().as_mut_ptr::<u8>();

        let mut pmm = Self {
            bitmap,
            bitmap_bytes,
            bitmap_phys,
            bitmap_frames,
            total_frames,
            highest_addr,
            used_frames: total_frames,
            free_lists: [const { FreeList::new() }; ORDER_COUNT],
        };

        // Pass 3a: start pessimistic — every frame used.
        // SAFETY: the bitmap region was just carved out of a usable region
        // and is reachable through the HHDM.
        unsafe {
            ptr::write_bytes(bitmap, 0xFF, bitmap_bytes);
        }

        // Pass 3b: clear usable regions.
        for region in regions.iter().filter(|r| r.is_usable()) {
            let start = (region.base / PAGE_SIZE) as usize;
            let end = ((region.end()) / PAGE_SIZE) as usize;
            for frame in start..end.min(total_frames) {
                if !pmm.frame_is_free(frame) {
                    pmm.clear_frame(frame);
                    pmm.used_frames -= 1;
                }
            }
        }

        // Pass 3c: re-reserve the bitmap's own frames…
        let bitmap_start = bitmap_phys.frame_index();
        for frame in bitmap_start..bitmap_start + bitmap_frames {
            if pmm.frame_is_free(frame) {
                pmm.set_frame(frame);
                pmm.used_frames += 1;
            }
        }

        // …and everything below 1 MiB.
        for frame in 0..PROTECTED_LOW_FRAMES.min(total_frames) {
            if pmm.frame_is_free(frame) {
                pmm.set_frame(frame);
                pmm.used_frames += 1;
            }
        }

        // Enroll every free sub-range into the largest aligned order.
        for region in regions.iter().filter(|r| r.is_usable()) {
            let start = (region.base / PAGE_SIZE) as usize;
            let end = (region.end() / PAGE_SIZE) as usize;
            pmm.enroll_range(start, end.min(total_frames));
        }

        log::info!(
            "tracking {} frames, bitmap {} KiB ({} pages) at {}",
            pmm.total_frames,
            pmm.bitmap_bytes / 1024,
            pmm.bitmap_frames,
            pmm.bitmap_phys
        );
        log::info!(
            "{} MiB free, {} MiB reserved",
            (total_frames - pmm.used_frames) as u64 * PAGE_SIZE / 1024 / 1024,
            pmm.used_frames as u64 * PAGE_SIZE / 1024 / 1024
        );

        pmm
    }

    /// Walks `[start, end)` and pushes each maximal free run onto the free
    /// lists, greedily: at each candidate frame, the first order (largest
    /// first) whose block fits the remaining range, is aligned to itself,
    /// and is entirely free wins.
    fn enroll_range(&mut self, start: usize, end: usize) {
        let mut frame = start;
        while frame < end {
            if !self.frame_is_free(frame) {
                frame += 1;
                continue;
            }
            let mut enrolled = false;
            for order in (0..=MAX_ORDER).rev() {
                let size = 1usize << order;
                if frame % size == 0 && frame + size <= end && self.range_is_free(frame, size) {
                    // SAFETY: the block's frames are free, so writing the
                    // list node into the first frame clobbers nothing.
                    unsafe {
                        let node = self.frame_to_node(frame);
                        self.free_lists[order].push(node, order);
                    }
                    frame += size;
                    enrolled = true;
                    break;
                }
            }
            // Order 0 always fits a free frame, but keep the loop honest.
            if !enrolled {
                frame += 1;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Bitmap primitives
    // -------------------------------------------------------------------------

    #[inline]
    fn frame_is_free(&self, frame: usize) -> bool {
        // SAFETY: callers stay within total_frames, which the bitmap covers.
        unsafe { *self.bitmap.add(frame / 8) & (1 << (frame % 8)) == 0 }
    }

    #[inline]
    fn set_frame(&mut self, frame: usize) {
        unsafe { *self.bitmap.add(frame / 8) |= 1 << (frame % 8) }
    }

    #[inline]
    fn clear_frame(&mut self, frame: usize) {
        unsafe { *self.bitmap.add(frame / 8) &= !(1 << (frame % 8)) }
    }

    fn range_is_free(&self, frame: usize, count: usize) -> bool {
        (frame..frame + count).all(|f| self.frame_is_free(f))
    }

    // -------------------------------------------------------------------------
    // HHDM node access
    // -------------------------------------------------------------------------

    #[inline]
    fn frame_to_node(&self, frame: usize) -> *mut FreeNode {
        PhysAddr::from_frame_index(frame).to_virt().as_mut_ptr()
    }

    #[inline]
    fn node_to_frame(&self, node: *mut FreeNode) -> usize {
        ((node as u64 - address::hhdm_offset()) >> 12) as usize
    }

    // -------------------------------------------------------------------------
    // Core operations
    // -------------------------------------------------------------------------

    /// Allocates a block of 2^order frames.
    ///
    /// If list[order] is empty, a larger block is split: the upper half of
    /// each split goes back on its list, the lower half continues down.
    fn alloc_order(&mut self, order: usize) -> Result<PhysAddr, PmmError> {
        if order > MAX_ORDER {
            return Err(PmmError::InvalidCount);
        }

        // Find the smallest order with a free block.
        let mut found = None;
        for k in order..=MAX_ORDER {
            if self.free_lists[k].len > 0 {
                found = Some(k);
                break;
            }
        }
        let mut k = found.ok_or(PmmError::OutOfMemory)?;

        // SAFETY: nodes on the free lists always point into free frames.
        let node = unsafe { self.free_lists[k].pop() }.expect("non-empty list had no head");
        let frame = self.node_to_frame(node);

        // Split down to the requested order; upper halves stay free.
        while k > order {
            k -= 1;
            let upper = frame + (1 << k);
            unsafe {
                let upper_node = self.frame_to_node(upper);
                self.free_lists[k].push(upper_node, k);
            }
        }

        let count = 1 << order;
        for f in frame..frame + count {
            debug_assert!(self.frame_is_free(f));
            self.set_frame(f);
        }
        self.used_frames += count;

        Ok(PhysAddr::from_frame_index(frame))
    }

    /// Frees a block of 2^order frames, coalescing with its buddy as long
    /// as the buddy is fully free and enrolled at the same order.
    fn free_order(&mut self, addr: PhysAddr, order: usize) -> Result<(), PmmError> {
        if order > MAX_ORDER {
            return Err(PmmError::InvalidCount);
        }

        let frame = addr.frame_index();
        let count = 1usize << order;

        if frame < PROTECTED_LOW_FRAMES
            || frame + count > self.total_frames
            || frame % count != 0
        {
            return Err(PmmError::InvalidAddress);
        }

        // A block being freed must be fully allocated in the bitmap.
        if (frame..frame + count).any(|f| self.frame_is_free(f)) {
            return Err(PmmError::DoubleFree);
        }

        for f in frame..frame + count {
            self.clear_frame(f);
        }
        self.used_frames -= count;

        // Coalesce upward: buddy index = frame XOR 2^k. The buddy must be
        // fully free in the bitmap *and* enrolled at order k (checked via
        // the order stamp in its embedded node) before it is detached.
        let mut k = order;
        let mut start = frame;
        while k < MAX_ORDER {
            let buddy = start ^ (1 << k);
            let size = 1usize << k;
            if buddy + size > self.total_frames || !self.range_is_free(buddy, size) {
                break;
            }
            let buddy_node = self.frame_to_node(buddy);
            // SAFETY: the buddy's frames are free, so its first frame
            // holds a live FreeNode written when it was enrolled.
            unsafe {
                if (*buddy_node).order != k {
                    break;
                }
                self.free_lists[k].remove(buddy_node);
            }
            start = start.min(buddy);
            k += 1;
        }

        unsafe {
            let node = self.frame_to_node(start);
            self.free_lists[k].push(node, k);
        }
        Ok(())
    }

    /// Allocates `count` contiguous pages, rounded up to a power of two.
    fn alloc_pages(&mut self, count: usize) -> Result<PhysAddr, PmmError> {
        self.alloc_order(order_for_pages(count)?)
    }

    fn free_pages(&mut self, addr: PhysAddr, count: usize) -> Result<(), PmmError> {
        self.free_order(addr, order_for_pages(count)?)
    }

    /// Allocates a block satisfying both `size` bytes and a starting
    /// alignment of `align` bytes (power of two, at least one page).
    fn alloc_aligned(&mut self, size: usize, align: usize) -> Result<PhysAddr, PmmError> {
        self.alloc_order(order_for_aligned(size, align)?)
    }

    fn free_aligned(&mut self, addr: PhysAddr, size: usize, align: usize) -> Result<(), PmmError> {
        self.free_order(addr, order_for_aligned(size, align)?)
    }

    fn stats(&self) -> PmmStats {
        let mut free_blocks = [0usize; ORDER_COUNT];
        for (k, list) in self.free_lists.iter().enumerate() {
            free_blocks[k] = list.len;
        }
        let used_bytes = self.used_frames as u64 * PAGE_SIZE;
        PmmStats {
            total_bytes: self.highest_addr,
            used_bytes,
            free_bytes: self.highest_addr - used_bytes,
            free_blocks,
        }
    }
}

/// Order whose block covers `count` pages: the next power of two.
fn order_for_pages(count: usize) -> Result<usize, PmmError> {
    if count == 0 || count > MAX_CONTIGUOUS_PAGES {
        return Err(PmmError::InvalidCount);
    }
    Ok(count.next_power_of_two().trailing_zeros() as usize)
}

/// Order satisfying both a byte size and a byte alignment.
fn order_for_aligned(size: usize, align: usize) -> Result<usize, PmmError> {
    if size == 0 || align == 0 || !align.is_power_of_two() {
        return Err(PmmError::InvalidCount);
    }
    let pages = (size + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;
    let size_order = order_for_pages(pages)?;
    let align_pages = (align / PAGE_SIZE as usize).max(1);
    let align_order = align_pages.trailing_zeros() as usize;
    if align_order > MAX_ORDER {
        return Err(PmmError::InvalidCount);
    }
    Ok(size_order.max(align_order))
}

// =============================================================================
// Public API — module-level functions holding the PMM spinlock
// =============================================================================

static PMM: SpinLock<Option<BuddyAllocator>> = SpinLock::new(None);

/// Initializes the physical memory manager from the boot memory map.
///
/// Must be called exactly once during early boot, after the HHDM offset is
/// installed.
///
/// # Panics
/// If called twice, or if no usable region can hold the bitmap.
pub fn init(regions: &[MemoryRegion]) {
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(BuddyAllocator::new(regions));
}

fn with_pmm<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

/// Allocates a single 4 KiB frame. Contents are uninitialized.
pub fn alloc_page() -> Option<PhysAddr> {
    match with_pmm(|pmm| pmm.alloc_order(0)) {
        Ok(addr) => Some(addr),
        Err(e) => {
            log::warn!("alloc_page failed: {}", e);
            None
        }
    }
}

/// Allocates a single 4 KiB frame filled with zeros. Page tables must
/// start zeroed (all entries non-present), so the VMM uses this.
pub fn alloc_page_zeroed() -> Option<PhysAddr> {
    let addr = alloc_page()?;
    // SAFETY: a freshly allocated frame is exclusively ours and reachable
    // through the HHDM.
    unsafe {
        ptr::write_bytes(addr.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
    Some(addr)
}

/// Allocates `count` physically contiguous frames (rounded up to the next
/// power of two, at most 2^11).
pub fn alloc_pages(count: usize) -> Option<PhysAddr> {
    match with_pmm(|pmm| pmm.alloc_pages(count)) {
        Ok(addr) => Some(addr),
        Err(e) => {
            log::warn!("alloc_pages({}) failed: {}", count, e);
            None
        }
    }
}

/// Allocates a physically contiguous block of at least `size` bytes whose
/// start is aligned to `align` bytes.
pub fn alloc_aligned(size: usize, align: usize) -> Option<PhysAddr> {
    match with_pmm(|pmm| pmm.alloc_aligned(size, align)) {
        Ok(addr) => Some(addr),
        Err(e) => {
            log::warn!("alloc_aligned({}, {}) failed: {}", size, align, e);
            None
        }
    }
}

/// Frees a single frame previously returned by `alloc_page`.
/// Failures are reported on the console and otherwise ignored.
pub fn free_page(addr: PhysAddr) {
    if let Err(e) = with_pmm(|pmm| pmm.free_order(addr, 0)) {
        log::warn!("free_page({}) refused: {}", addr, e);
    }
}

/// Frees `count` contiguous frames previously returned by `alloc_pages`
/// with the same count.
pub fn free_pages(addr: PhysAddr, count: usize) {
    if let Err(e) = with_pmm(|pmm| pmm.free_pages(addr, count)) {
        log::warn!("free_pages({}, {}) refused: {}", addr, count, e);
    }
}

/// Frees a block previously returned by `alloc_aligned` with the same
/// size and alignment.
pub fn free_aligned(addr: PhysAddr, size: usize, align: usize) {
    if let Err(e) = with_pmm(|pmm| pmm.free_aligned(addr, size, align)) {
        log::warn!("free_aligned({}, {}, {}) refused: {}", addr, size, align, e);
    }
}

/// Returns a snapshot of physical memory usage.
pub fn stats() -> PmmStats {
    with_pmm(|pmm| pmm.stats())
}

/// Logs the usage summary the way the boot console shows it.
pub fn log_stats() {
    let s = stats();
    log::info!(
        "total {} MiB, used {} MiB, free {} MiB",
        s.total_bytes / 1024 / 1024,
        s.used_bytes / 1024 / 1024,
        s.free_bytes / 1024 / 1024
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::memmap::MemoryKind;
    use crate::memory::testutil;

    fn usable(base: u64, length: u64) -> MemoryRegion {
        MemoryRegion {
            base,
            length,
            kind: MemoryKind::Usable,
        }
    }

    fn reserved(base: u64, length: u64) -> MemoryRegion {
        MemoryRegion {
            base,
            length,
            kind: MemoryKind::Reserved,
        }
    }

    /// Allocator over a private window of the simulated arena.
    fn window_allocator(bytes: u64) -> BuddyAllocator {
        let base = testutil::take_window(bytes as usize);
        BuddyAllocator::new(&[usable(base, bytes)])
    }

    /// Checks the structural invariants: every listed block is aligned
    /// to its order, fully free in the bitmap, and no block's buddy sits
    /// in the same list.
    fn check_invariants(pmm: &BuddyAllocator) {
        for k in 0..ORDER_COUNT {
            let size = 1usize << k;
            let mut starts = Vec::new();
            let mut node = pmm.free_lists[k].head;
            let mut walked = 0;
            while !node.is_null() {
                let frame = pmm.node_to_frame(node);
                assert_eq!(frame % size, 0, "order {} block at {} misaligned", k, frame);
                assert!(
                    pmm.range_is_free(frame, size),
                    "order {} block at {} has used frames",
                    k,
                    frame
                );
                assert_eq!(unsafe { (*node).order }, k);
                starts.push(frame);
                node = unsafe { (*node).next };
                walked += 1;
            }
            assert_eq!(walked, pmm.free_lists[k].len);
            for &a in &starts {
                assert!(
                    !starts.contains(&(a ^ size)),
                    "buddies {} and {} both in list {}",
                    a,
                    a ^ size,
                    k
                );
            }
        }
    }

    #[test]
    fn scenario_boot_with_one_gib_map() {
        // Boot map: [0, 1 MiB) reserved, [1 MiB, 1 GiB) usable.
        let base = testutil::take_low_gig();
        assert_eq!(base, 0);
        let pmm = BuddyAllocator::new(&[
            reserved(0, 0x10_0000),
            usable(0x10_0000, 0x3FF0_0000),
        ]);

        let total_frames = 0x4000_0000u64 / PAGE_SIZE;
        assert_eq!(pmm.total_frames as u64, total_frames);

        let s = pmm.stats();
        assert_eq!(s.total_bytes, 0x4000_0000);
        // Used = 256 protected low frames + the bitmap's own frames.
        let expected_used = (256 + pmm.bitmap_frames as u64) * PAGE_SIZE;
        assert_eq!(s.used_bytes, expected_used);
        assert_eq!(s.free_bytes, 0x4000_0000 - expected_used);

        check_invariants(&pmm);
    }

    #[test]
    fn alloc_page_is_aligned_and_marked() {
        let mut pmm = window_allocator(16 * 1024 * 1024);
        let before = pmm.stats();

        let page = pmm.alloc_order(0).unwrap();
        assert!(page.is_page_aligned());
        assert!(!pmm.frame_is_free(page.frame_index()));
        assert_eq!(pmm.stats().used_bytes, before.used_bytes + PAGE_SIZE);

        check_invariants(&pmm);
    }

    #[test]
    fn split_and_free_restore_block_population() {
        // A 16 MiB window aligned to 8 MiB enrolls as two order-11 blocks;
        // the bitmap consumes the first frames, so enrollment around it
        // produces a mixed shape. Compare populations, not exact shapes.
        let mut pmm = window_allocator(16 * 1024 * 1024);
        let free_before: usize = pmm.free_lists.iter().map(|l| l.len).sum();

        let page = pmm.alloc_order(0).unwrap();
        // Splitting one block yields one new block at every lower order.
        let s = pmm.stats();
        let free_after: usize = s.free_blocks.iter().sum();
        assert!(free_after > free_before);

        pmm.free_order(page, 0).unwrap();
        let restored = pmm.stats();
        let free_restored: usize = restored.free_blocks.iter().sum();
        assert_eq!(free_restored, free_before);
        check_invariants(&pmm);
    }

    #[test]
    fn scenario_alloc_free_1000_rounds_stabilizes() {
        let mut pmm = window_allocator(16 * 1024 * 1024);

        let first = pmm.alloc_pages(8).unwrap();
        pmm.free_pages(first, 8).unwrap();
        let baseline = pmm.stats();

        for _ in 0..1000 {
            let p = pmm.alloc_pages(8).unwrap();
            assert_eq!(p, first, "address did not stabilize");
            pmm.free_pages(p, 8).unwrap();
        }

        let after = pmm.stats();
        assert_eq!(after.used_bytes, baseline.used_bytes);
        assert_eq!(after.free_blocks, baseline.free_blocks);
        check_invariants(&pmm);
    }

    #[test]
    fn coalescing_restores_top_order() {
        let mut pmm = window_allocator(8 * 1024 * 1024);
        let baseline = pmm.stats().free_blocks;

        // Carve the window into single pages, then free them all.
        let mut pages = Vec::new();
        loop {
            match pmm.alloc_order(0) {
                Ok(p) => pages.push(p),
                Err(PmmError::OutOfMemory) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(!pages.is_empty());
        assert_eq!(pmm.stats().free_bytes, 0);

        for p in pages {
            pmm.free_order(p, 0).unwrap();
        }
        assert_eq!(pmm.stats().free_blocks, baseline);
        check_invariants(&pmm);
    }

    #[test]
    fn alloc_pages_rounds_up_to_power_of_two() {
        let mut pmm = window_allocator(16 * 1024 * 1024);
        let before = pmm.stats().used_bytes;

        let p = pmm.alloc_pages(5).unwrap();
        assert_eq!(pmm.stats().used_bytes, before + 8 * PAGE_SIZE);
        pmm.free_pages(p, 5).unwrap();
        assert_eq!(pmm.stats().used_bytes, before);
    }

    #[test]
    fn aligned_allocation_satisfies_both_constraints() {
        let mut pmm = window_allocator(16 * 1024 * 1024);

        let p = pmm.alloc_aligned(3 * PAGE_SIZE as usize, 64 * 1024).unwrap();
        assert_eq!(p.as_u64() % (64 * 1024), 0);
        pmm.free_aligned(p, 3 * PAGE_SIZE as usize, 64 * 1024).unwrap();
        check_invariants(&pmm);
    }

    #[test]
    fn invalid_counts_are_rejected() {
        let mut pmm = window_allocator(8 * 1024 * 1024);
        assert_eq!(pmm.alloc_pages(0), Err(PmmError::InvalidCount));
        assert_eq!(
            pmm.alloc_pages(MAX_CONTIGUOUS_PAGES + 1),
            Err(PmmError::InvalidCount)
        );
        assert_eq!(pmm.alloc_aligned(0, 4096), Err(PmmError::InvalidCount));
        assert_eq!(pmm.alloc_aligned(4096, 3), Err(PmmError::InvalidCount));
    }

    #[test]
    fn double_free_is_detected_and_refused() {
        let mut pmm = window_allocator(8 * 1024 * 1024);
        let p = pmm.alloc_order(0).unwrap();
        pmm.free_order(p, 0).unwrap();
        assert_eq!(pmm.free_order(p, 0), Err(PmmError::DoubleFree));
        check_invariants(&pmm);
    }

    #[test]
    fn protected_and_out_of_range_frees_refused() {
        let mut pmm = window_allocator(8 * 1024 * 1024);
        // Below 1 MiB.
        assert_eq!(
            pmm.free_order(PhysAddr::new(0x1000), 0),
            Err(PmmError::InvalidAddress)
        );
        // Beyond the tracked range.
        assert_eq!(
            pmm.free_order(PhysAddr::new(pmm.highest_addr), 0),
            Err(PmmError::InvalidAddress)
        );
        // Misaligned for its order.
        let p = pmm.alloc_order(1).unwrap();
        assert_eq!(
            pmm.free_order(p + PAGE_SIZE, 1),
            Err(PmmError::InvalidAddress)
        );
        pmm.free_order(p, 1).unwrap();
    }

    #[test]
    fn oom_surfaces_when_no_order_fits() {
        // An 8 MiB window can hold at most one order-11 block, and the
        // bitmap placement breaks that one up.
        let mut pmm = window_allocator(8 * 1024 * 1024);
        assert_eq!(pmm.alloc_order(MAX_ORDER), Err(PmmError::OutOfMemory));
        // Lower orders still succeed.
        let p = pmm.alloc_order(MAX_ORDER - 1).unwrap();
        pmm.free_order(p, MAX_ORDER - 1).unwrap();
    }

    #[test]
    fn mixed_traffic_keeps_invariants() {
        let mut pmm = window_allocator(16 * 1024 * 1024);
        let baseline = pmm.stats();

        let mut live: Vec<(PhysAddr, usize)> = Vec::new();
        // Deterministic mixed alloc/free traffic across orders.
        for i in 0..200 {
            let order = (i * 7 + 3) % 6;
            if let Ok(p) = pmm.alloc_order(order) {
                live.push((p, order));
            }
            if i % 3 == 0 {
                if let Some((p, o)) = live.pop() {
                    pmm.free_order(p, o).unwrap();
                }
            }
            check_invariants(&pmm);
        }
        for (p, o) in live {
            pmm.free_order(p, o).unwrap();
        }

        let end = pmm.stats();
        assert_eq!(end.used_bytes, baseline.used_bytes);
        assert_eq!(end.free_blocks, baseline.free_blocks);
    }
}
