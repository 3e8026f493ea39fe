// =============================================================================
// Opal — Kernel Heap (kmalloc / kfree / krealloc)
// =============================================================================
//
// Arbitrary-size allocation for kernel-internal use, routed two ways:
//
//   ≤ 2048 bytes: per-size-class slab pages. Eight classes (16..2048,
//   powers of two); each class keeps a singly-linked list of page-sized
//   slabs with an intrusive freelist — the same layout as the slab
//   allocator's default, but heap-local and without the cache facility.
//   Small objects are zeroed on allocation.
//
//   > 2048 bytes: a contiguous multi-frame block from the PMM. The page
//   count is stored in the one machine word immediately before the
//   returned pointer, so free needs no size argument.
//
// Free decides ownership by scanning the size classes for the slab page
// containing the pointer; anything unclaimed is treated as a large block
// and its header validated — a stored count outside [1, 2048] is fatal
// corruption.
//
// One spinlock serializes all heap operations. Each class keeps its head
// slab warm even when empty; non-head slabs go back to the PMM as soon
// as they drain.
// =============================================================================

use core::mem;
use core::ptr::{self, NonNull};

use crate::memory::address::{self, PhysAddr, PAGE_SIZE};
use crate::memory::pmm;
use crate::sync::SpinLock;

/// Slab-backed allocation sizes. Anything above the last class takes the
/// large-block path.
const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// The large-block header: one machine word holding the page count.
const LARGE_HEADER: usize = mem::size_of::<u64>();

/// Upper bound on a large allocation, in pages (the PMM's contiguous cap).
const MAX_LARGE_PAGES: usize = 2048;

/// First object byte within a heap slab page.
const OBJECT_OFFSET: usize = 32;

/// Header at the start of each heap slab page.
#[repr(C)]
struct HeapSlab {
    next: *mut HeapSlab,
    object_count: usize,
    used_objects: usize,
    free_head: *mut u8,
}

/// One size class: a stack of slab pages.
struct SizeClass {
    slabs: *mut HeapSlab,
}

struct Heap {
    classes: [SizeClass; 8],
    large_allocs: usize,
    large_pages: usize,
}

// SAFETY: the slab pointers are only dereferenced under the heap lock.
unsafe impl Send for Heap {}

static HEAP: SpinLock<Heap> = SpinLock::new(Heap {
    classes: [const { SizeClass { slabs: ptr::null_mut() } }; 8],
    large_allocs: 0,
    large_pages: 0,
});

/// Per-class and large-block usage snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub class_sizes: [usize; 8],
    pub class_slabs: [usize; 8],
    pub class_total: [usize; 8],
    pub class_used: [usize; 8],
    pub large_allocs: usize,
    pub large_pages: usize,
}

/// Announces the heap on the boot console; the structures themselves are
/// statically initialized and slabs grow on demand.
pub fn init() {
    log::info!(
        "heap ready: classes {:?}, large blocks up to {} pages",
        SIZE_CLASSES,
        MAX_LARGE_PAGES
    );
}

/// Smallest class index covering `size`, or `None` for the large path.
fn class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| c >= size)
}

fn class_capacity(class_size: usize) -> usize {
    (PAGE_SIZE as usize - OBJECT_OFFSET) / (class_size + mem::size_of::<usize>())
}

impl Heap {
    /// Builds a fresh slab page for `class` and pushes it on the class
    /// list. Returns null if the PMM is exhausted.
    fn grow_class(&mut self, class: usize) -> *mut HeapSlab {
        let class_size = SIZE_CLASSES[class];
        let Some(page) = pmm::alloc_page() else {
            return ptr::null_mut();
        };
        let base = page.to_virt().as_mut_ptr::<u8>();
        let slab = base as *mut HeapSlab;

        // SAFETY: the frame is exclusively ours; OBJECT_OFFSET leaves room
        // for the header.
        unsafe {
            ptr::write(
                slab,
                HeapSlab {
                    next: self.classes[class].slabs,
                    object_count: class_capacity(class_size),
                    used_objects: 0,
                    free_head: ptr::null_mut(),
                },
            );
            let buf = base.add(OBJECT_OFFSET);
            for i in (0..(*slab).object_count).rev() {
                let obj = buf.add(i * class_size);
                *(obj as *mut *mut u8) = (*slab).free_head;
                (*slab).free_head = obj;
            }
        }

        self.classes[class].slabs = slab;
        slab
    }

    fn alloc_small(&mut self, class: usize) -> Option<NonNull<u8>> {
        let class_size = SIZE_CLASSES[class];

        // First slab with a free object wins; grow the class if none.
        let mut slab = self.classes[class].slabs;
        // SAFETY: list members are live heap slab headers.
        unsafe {
            while !slab.is_null() && (*slab).free_head.is_null() {
                slab = (*slab).next;
            }
            if slab.is_null() {
                slab = self.grow_class(class);
                if slab.is_null() {
                    return None;
                }
            }

            let obj = (*slab).free_head;
            (*slab).free_head = *(obj as *mut *mut u8);
            (*slab).used_objects += 1;

            // Callers get clean memory on the small path.
            ptr::write_bytes(obj, 0, class_size);
            NonNull::new(obj)
        }
    }

    fn alloc_large(&mut self, size: usize) -> Option<NonNull<u8>> {
        let pages = (size + LARGE_HEADER + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;
        if pages > MAX_LARGE_PAGES {
            log::warn!("kmalloc({}) exceeds the contiguous cap", size);
            return None;
        }

        let phys = pmm::alloc_pages(pages)?;
        let base = phys.to_virt().as_mut_ptr::<u8>();
        // SAFETY: the block is exclusively ours and at least one page.
        unsafe {
            *(base as *mut u64) = pages as u64;
            self.large_allocs += 1;
            self.large_pages += pages;
            NonNull::new(base.add(LARGE_HEADER))
        }
    }

    /// Frees `ptr` if some class's slab page contains it. Returns false
    /// when no slab claims the pointer.
    fn free_small(&mut self, ptr_addr: usize) -> bool {
        let page_base = ptr_addr & !(PAGE_SIZE as usize - 1);

        for class in 0..SIZE_CLASSES.len() {
            let class_size = SIZE_CLASSES[class];
            let mut prev: *mut HeapSlab = ptr::null_mut();
            let mut slab = self.classes[class].slabs;
            // SAFETY: list members are live heap slab headers.
            unsafe {
                while !slab.is_null() {
                    if slab as usize == page_base {
                        let buf = page_base + OBJECT_OFFSET;
                        let offset = ptr_addr.wrapping_sub(buf);
                        if ptr_addr < buf
                            || offset % class_size != 0
                            || offset / class_size >= (*slab).object_count
                        {
                            log::error!(
                                "kfree({:#x}): not an object boundary in its {}-byte slab",
                                ptr_addr,
                                class_size
                            );
                            return true;
                        }
                        if (*slab).used_objects == 0 {
                            log::error!("kfree({:#x}): double free into empty slab", ptr_addr);
                            return true;
                        }

                        let obj = ptr_addr as *mut u8;
                        *(obj as *mut *mut u8) = (*slab).free_head;
                        (*slab).free_head = obj;
                        (*slab).used_objects -= 1;

                        // Drained non-head slabs go back to the PMM; the
                        // head slab stays warm.
                        if (*slab).used_objects == 0 && !prev.is_null() {
                            (*prev).next = (*slab).next;
                            pmm::free_page(virt_to_phys(page_base));
                        }
                        return true;
                    }
                    prev = slab;
                    slab = (*slab).next;
                }
            }
        }
        false
    }

    fn free_large(&mut self, ptr_addr: usize) {
        let header = (ptr_addr - LARGE_HEADER) as *const u64;
        // SAFETY: a large allocation's header word sits directly before
        // the pointer we handed out.
        let pages = unsafe { *header } as usize;
        if pages == 0 || pages > MAX_LARGE_PAGES {
            panic!(
                "heap corruption: large block at {:#x} claims {} pages",
                ptr_addr, pages
            );
        }

        let phys = virt_to_phys(ptr_addr - LARGE_HEADER);
        pmm::free_pages(phys, pages);
        self.large_allocs -= 1;
        self.large_pages -= pages;
    }

    /// Size usable by the caller: the class size for slab objects, the
    /// block size minus the header for large blocks. `None` when the
    /// pointer belongs to no slab and its header is implausible — which
    /// `free_large` would treat as corruption.
    fn usable_size(&self, ptr_addr: usize) -> Option<usize> {
        let page_base = ptr_addr & !(PAGE_SIZE as usize - 1);
        for class in 0..SIZE_CLASSES.len() {
            let mut slab = self.classes[class].slabs;
            // SAFETY: list members are live heap slab headers.
            unsafe {
                while !slab.is_null() {
                    if slab as usize == page_base {
                        return Some(SIZE_CLASSES[class]);
                    }
                    slab = (*slab).next;
                }
            }
        }
        let pages = unsafe { *((ptr_addr - LARGE_HEADER) as *const u64) } as usize;
        if pages == 0 || pages > MAX_LARGE_PAGES {
            return None;
        }
        Some(pages * PAGE_SIZE as usize - LARGE_HEADER)
    }

    fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            class_sizes: SIZE_CLASSES,
            large_allocs: self.large_allocs,
            large_pages: self.large_pages,
            ..Default::default()
        };
        for class in 0..SIZE_CLASSES.len() {
            let mut slab = self.classes[class].slabs;
            // SAFETY: list members are live heap slab headers.
            unsafe {
                while !slab.is_null() {
                    stats.class_slabs[class] += 1;
                    stats.class_total[class] += (*slab).object_count;
                    stats.class_used[class] += (*slab).used_objects;
                    slab = (*slab).next;
                }
            }
        }
        stats
    }
}

fn virt_to_phys(addr: usize) -> PhysAddr {
    PhysAddr::new(addr as u64 - address::hhdm_offset())
}

// =============================================================================
// Public API
// =============================================================================

/// Allocates `size` bytes from the kernel heap.
///
/// Small requests (≤ 2048) come zeroed from a size-class slab; larger
/// ones from a contiguous PMM block. Returns `None` (with a diagnostic)
/// for zero size, sizes beyond the contiguous cap, or exhaustion.
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        log::warn!("kmalloc(0)");
        return None;
    }

    let mut heap = HEAP.lock();
    match class_index(size) {
        Some(class) => heap.alloc_small(class),
        None => heap.alloc_large(size),
    }
}

/// Returns an allocation to the heap.
///
/// Accepts any pointer previously produced by `kmalloc`/`krealloc`.
/// Misaligned slab pointers are refused with a diagnostic; a large block
/// with an implausible header is fatal.
pub fn kfree(ptr: NonNull<u8>) {
    let mut heap = HEAP.lock();
    let addr = ptr.as_ptr() as usize;
    if !heap.free_small(addr) {
        heap.free_large(addr);
    }
}

/// Resizes an allocation.
///
/// `None` in allocates fresh; zero size frees and returns `None`;
/// otherwise the contents are copied up to the smaller of the old and new
/// usable sizes and the old allocation is released.
pub fn krealloc(ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
    let Some(old) = ptr else {
        return kmalloc(new_size);
    };
    if new_size == 0 {
        kfree(old);
        return None;
    }

    let old_size = {
        let heap = HEAP.lock();
        heap.usable_size(old.as_ptr() as usize)
    };
    let Some(old_size) = old_size else {
        panic!(
            "heap corruption: krealloc of unknown pointer {:p}",
            old.as_ptr()
        );
    };

    let new = kmalloc(new_size)?;
    // SAFETY: both allocations are live and at least min(old, new) bytes.
    unsafe {
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
    }
    kfree(old);
    Some(new)
}

/// Usage snapshot across all classes and large blocks.
pub fn stats() -> HeapStats {
    HEAP.lock().stats()
}

/// Logs the per-class usage summary.
pub fn log_stats() {
    let s = stats();
    for i in 0..SIZE_CLASSES.len() {
        if s.class_slabs[i] > 0 {
            log::info!(
                "class {:>4}: {} slabs, {}/{} objects used",
                s.class_sizes[i],
                s.class_slabs[i],
                s.class_used[i],
                s.class_total[i]
            );
        }
    }
    log::info!(
        "large: {} allocations over {} pages",
        s.large_allocs,
        s.large_pages
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testutil;

    fn setup() -> std::sync::MutexGuard<'static, ()> {
        let guard = testutil::global_lock();
        testutil::init_global_pmm();
        guard
    }

    /// Touch every class once so head slabs exist and frame counts reach
    /// steady state before measuring.
    fn warm_heap() {
        for &size in &SIZE_CLASSES {
            let p = kmalloc(size).unwrap();
            kfree(p);
        }
    }

    #[test]
    fn scenario_mixed_sizes_restore_frame_count() {
        let _g = setup();
        warm_heap();

        let used_before = pmm::stats().used_bytes;
        let stats_before = stats();

        let a = kmalloc(16).unwrap();
        let b = kmalloc(2048).unwrap();
        let c = kmalloc(8192).unwrap();
        kfree(a);
        kfree(b);
        kfree(c);

        assert_eq!(pmm::stats().used_bytes, used_before);
        let s = stats();
        for class in 0..SIZE_CLASSES.len() {
            assert_eq!(s.class_used[class], 0, "class {} not drained", class);
        }
        assert_eq!(s.large_allocs, stats_before.large_allocs);
    }

    #[test]
    fn sizes_route_to_smallest_fitting_class() {
        let _g = setup();
        warm_heap();

        let p = kmalloc(17).unwrap();
        let s = stats();
        assert_eq!(s.class_used[1], 1); // class 32
        assert_eq!(s.class_used[0], 0);
        kfree(p);
    }

    #[test]
    fn small_allocations_come_zeroed() {
        let _g = setup();

        let p = kmalloc(64).unwrap();
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0xFF, 64);
        }
        kfree(p);

        // LIFO freelist hands the same object back, now zeroed again.
        let q = kmalloc(64).unwrap();
        assert_eq!(q, p);
        unsafe {
            for i in 0..64 {
                assert_eq!(*q.as_ptr().add(i), 0, "byte {} not zeroed", i);
            }
        }
        kfree(q);
    }

    #[test]
    fn zero_size_is_refused() {
        let _g = setup();
        assert!(kmalloc(0).is_none());
    }

    #[test]
    fn large_path_uses_headered_pmm_block() {
        let _g = setup();
        let used_before = pmm::stats().used_bytes;
        let stats_before = stats();

        // 8192 + header needs 3 pages; the PMM rounds to an order-2 block.
        let p = kmalloc(8192).unwrap();
        assert_eq!(pmm::stats().used_bytes, used_before + 4 * PAGE_SIZE);
        unsafe {
            assert_eq!(*(p.as_ptr().sub(LARGE_HEADER) as *const u64), 3);
        }
        assert_eq!(stats().large_allocs, stats_before.large_allocs + 1);
        assert_eq!(stats().large_pages, stats_before.large_pages + 3);

        kfree(p);
        assert_eq!(pmm::stats().used_bytes, used_before);
        assert_eq!(stats().large_allocs, stats_before.large_allocs);
    }

    #[test]
    fn oversized_allocation_is_refused() {
        let _g = setup();
        assert!(kmalloc(MAX_LARGE_PAGES * PAGE_SIZE as usize + 1).is_none());
    }

    #[test]
    fn interior_pointer_free_is_refused() {
        let _g = setup();

        let p = kmalloc(64).unwrap();
        let before = stats();

        // Not an object boundary; refused with a diagnostic.
        let interior = unsafe { NonNull::new_unchecked(p.as_ptr().add(4)) };
        kfree(interior);
        let after = stats();
        assert_eq!(before.class_used, after.class_used);

        kfree(p);
    }

    #[test]
    fn non_head_slabs_are_released_when_drained() {
        let _g = setup();
        warm_heap();

        let class = 7; // 2048-byte objects: one slab holds only one.
        let capacity = class_capacity(2048);
        assert_eq!(capacity, 1);

        let used_before = pmm::stats().used_bytes;
        let a = kmalloc(2048).unwrap(); // head slab (warm, empty)
        let b = kmalloc(2048).unwrap(); // forces a second slab
        assert_eq!(stats().class_slabs[class], 2);

        // b sits in the newer slab, which is the list head; freeing a
        // drains the older, non-head slab and returns its page.
        kfree(a);
        kfree(b);
        assert_eq!(stats().class_used[class], 0);
        assert_eq!(pmm::stats().used_bytes, used_before);
    }

    #[test]
    fn realloc_preserves_contents_across_paths() {
        let _g = setup();

        // none → alloc
        let p = krealloc(None, 32).unwrap();
        unsafe {
            for i in 0..32 {
                *p.as_ptr().add(i) = i as u8;
            }
        }

        // small → small (larger class)
        let p = krealloc(Some(p), 200).unwrap();
        unsafe {
            for i in 0..32 {
                assert_eq!(*p.as_ptr().add(i), i as u8);
            }
        }

        // small → large
        let p = krealloc(Some(p), 10_000).unwrap();
        unsafe {
            for i in 0..32 {
                assert_eq!(*p.as_ptr().add(i), i as u8);
            }
        }

        // large → small, truncating
        let p = krealloc(Some(p), 16).unwrap();
        unsafe {
            for i in 0..16 {
                assert_eq!(*p.as_ptr().add(i), i as u8);
            }
        }

        // zero size frees
        assert!(krealloc(Some(p), 0).is_none());
    }

    #[test]
    #[should_panic(expected = "heap corruption")]
    fn clobbered_large_header_is_fatal() {
        let _g = setup();

        let p = kmalloc(8192).unwrap();
        unsafe {
            *(p.as_ptr().sub(LARGE_HEADER) as *mut u64) = 0;
        }
        kfree(p);
    }
}
