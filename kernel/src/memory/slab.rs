// =============================================================================
// Opal — Slab Allocator
// =============================================================================
//
// O(1) allocation of fixed-size objects. A cache owns page-sized slabs;
// each slab starts with a header and carves the rest of its page into
// objects of the cache's size. Slabs move between three lists as their
// occupancy changes: full, partial, empty.
//
// Two freelist layouts, selected per cache:
//
//   INTRUSIVE (default): each free object stores a pointer to the next
//   free object in its own first word. Cheapest; free memory carries its
//   own bookkeeping.
//
//   BUFCTL: free objects carry no metadata; an array of control records
//   {buffer, parent, next} sits at the tail of the slab page. For callers
//   that must not observe overwritten bytes between frees.
//
// The object's slab is recovered on free by clearing the low 12 bits of
// its address — slabs are exactly one page and page-aligned.
//
// LOCKING: one spinlock per cache, plus a global lock around the registry
// of all caches. Per-cache operations never take the global lock.
// =============================================================================

use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};

use bitflags::bitflags;

use crate::memory::address::{self, PhysAddr, PAGE_SIZE};
use crate::memory::pmm;
use crate::sync::SpinLock;

bitflags! {
    /// Per-cache behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Keep free-object bookkeeping out of the objects themselves,
        /// in external bufctl records.
        const BUFCTL = 1 << 0;
    }
}

// =============================================================================
// On-page structures
// =============================================================================

/// Header at the start of every slab page.
#[repr(C)]
struct Slab {
    next: *mut Slab,
    prev: *mut Slab,
    /// The owning cache; checked on every free to catch corruption.
    cache: *mut Cache,
    object_count: usize,
    used_objects: usize,
    /// Intrusive layout: head of the chain threaded through free objects.
    free_head: *mut u8,
    /// Bufctl layout: head of the free control-record list.
    bufctl_head: *mut Bufctl,
}

/// External control record for the bufctl layout. The records for a slab
/// form an array at the tail of its page.
#[repr(C)]
struct Bufctl {
    buffer: *mut u8,
    parent: *mut Slab,
    next: *mut Bufctl,
}

/// A doubly-linked list of slabs, threaded through their headers.
struct SlabList {
    head: *mut Slab,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    unsafe fn push(&mut self, slab: *mut Slab) {
        unsafe {
            (*slab).next = self.head;
            (*slab).prev = ptr::null_mut();
            if !self.head.is_null() {
                (*self.head).prev = slab;
            }
        }
        self.head = slab;
        self.len += 1;
    }

    unsafe fn remove(&mut self, slab: *mut Slab) {
        unsafe {
            let prev = (*slab).prev;
            let next = (*slab).next;
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

    unsafe fn pop(&mut self) -> Option<*mut Slab> {
        if self.head.is_null() {
            return None;
        }
        let slab = self.head;
        unsafe { self.remove(slab) };
        Some(slab)
    }
}

// =============================================================================
// Caches
// =============================================================================

/// The slab lists of a cache, guarded by the cache's spinlock.
struct CacheLists {
    full: SlabList,
    partial: SlabList,
    empty: SlabList,
}

// SAFETY: the raw slab pointers are only dereferenced under the cache
// lock.
unsafe impl Send for CacheLists {}

/// A named (size-keyed) object cache. Lives in its own page, allocated
/// from the PMM; handled by pointer, never by value.
pub struct Cache {
    /// Effective object size: requested size rounded up for alignment.
    object_size: usize,
    align: usize,
    flags: CacheFlags,
    /// Objects per slab.
    objects_per_slab: usize,
    /// Byte offset of the first object within a slab page.
    object_offset: usize,
    /// Registry link, guarded by the global cache lock.
    global_next: *mut Cache,
    inner: SpinLock<CacheLists>,
}

/// Occupancy snapshot of a cache, for diagnostics and the conservation
/// invariant (free + used == total at any quiescent point).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub slabs: usize,
    pub empty_slabs: usize,
    pub total_objects: usize,
    pub used_objects: usize,
    pub free_objects: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} slabs ({} empty), {}/{} objects used",
            self.slabs, self.empty_slabs, self.used_objects, self.total_objects
        )
    }
}

/// Registry of all live caches, for enumeration.
struct CacheRegistry {
    head: *mut Cache,
    count: usize,
}

// SAFETY: only dereferenced under the registry lock.
unsafe impl Send for CacheRegistry {}

static CACHES: SpinLock<CacheRegistry> = SpinLock::new(CacheRegistry {
    head: ptr::null_mut(),
    count: 0,
});

/// Announces the facility on the boot console. The registry itself is
/// statically initialized.
pub fn init() {
    log::info!("slab allocator ready");
}

/// Number of live caches in the registry.
pub fn cache_count() -> usize {
    CACHES.lock().count
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Creates a cache for objects of `size` bytes aligned to `align`
/// (0 means natural word alignment).
///
/// Returns `None` and logs if the size is zero, a single object cannot
/// fit in a slab page, or the PMM is exhausted.
pub fn cache_create(size: usize, align: usize, flags: CacheFlags) -> Option<NonNull<Cache>> {
    if size == 0 {
        log::warn!("cache_create: zero object size");
        return None;
    }

    // Objects hold a freelist pointer while free, so they are at least
    // word-sized and word-aligned.
    let align = align.max(mem::align_of::<usize>());
    if !align.is_power_of_two() {
        log::warn!("cache_create: alignment {} not a power of two", align);
        return None;
    }
    let object_size = align_up(size.max(mem::size_of::<usize>()), align);
    let object_offset = align_up(mem::size_of::<Slab>(), align);

    let per_object = if flags.contains(CacheFlags::BUFCTL) {
        object_size + mem::size_of::<Bufctl>()
    } else {
        object_size + mem::size_of::<usize>()
    };
    let space = (PAGE_SIZE as usize).saturating_sub(object_offset);
    let mut objects_per_slab = space / per_object;
    if objects_per_slab == 0 {
        // A single object per slab is forced — if it fits at all.
        if object_offset + per_object > PAGE_SIZE as usize {
            log::warn!("cache_create: object size {} cannot fit a slab", size);
            return None;
        }
        objects_per_slab = 1;
    }

    let page = pmm::alloc_page()?;
    let cache = page.to_virt().as_mut_ptr::<Cache>();

    // SAFETY: the frame is exclusively ours and large enough for Cache.
    unsafe {
        ptr::write(
            cache,
            Cache {
                object_size,
                align,
                flags,
                objects_per_slab,
                object_offset,
                global_next: ptr::null_mut(),
                inner: SpinLock::new(CacheLists {
                    full: SlabList::new(),
                    partial: SlabList::new(),
                    empty: SlabList::new(),
                }),
            },
        );
    }

    {
        let mut registry = CACHES.lock();
        // SAFETY: cache was fully initialized above.
        unsafe {
            (*cache).global_next = registry.head;
        }
        registry.head = cache;
        registry.count += 1;
    }

    log::info!(
        "cache created: size {} (effective {}), {} objects/slab{}",
        size,
        object_size,
        objects_per_slab,
        if flags.contains(CacheFlags::BUFCTL) {
            ", bufctl"
        } else {
            ""
        }
    );

    NonNull::new(cache)
}

/// Allocates one object from the cache.
///
/// # Safety
/// `cache` must come from `cache_create` and not have been destroyed.
pub unsafe fn cache_alloc(cache: NonNull<Cache>) -> Option<NonNull<u8>> {
    unsafe { cache.as_ref().alloc() }
}

/// Returns an object to the cache it was allocated from.
///
/// # Safety
/// `cache` must be live and `obj` must have come from `cache_alloc` on
/// it. Freeing into the wrong cache is detected and is fatal.
pub unsafe fn cache_free(cache: NonNull<Cache>, obj: NonNull<u8>) {
    unsafe { cache.as_ref().free(obj) }
}

/// Occupancy snapshot.
///
/// # Safety
/// `cache` must be live.
pub unsafe fn cache_stats(cache: NonNull<Cache>) -> CacheStats {
    unsafe { cache.as_ref().stats() }
}

/// Unregisters the cache, releases every slab page, then the cache page
/// itself.
///
/// # Safety
/// `cache` must be live, and no object from it may be used afterwards.
pub unsafe fn cache_destroy(cache: NonNull<Cache>) {
    let cache_ptr = cache.as_ptr();

    // Unlink from the registry first so enumeration never sees a cache
    // whose slabs are being torn down.
    {
        let mut registry = CACHES.lock();
        let mut cursor: *mut *mut Cache = &mut registry.head;
        // SAFETY: registry pointers are live caches under the lock.
        unsafe {
            while !(*cursor).is_null() {
                if *cursor == cache_ptr {
                    *cursor = (**cursor).global_next;
                    registry.count -= 1;
                    break;
                }
                cursor = &mut (**cursor).global_next;
            }
        }
    }

    // Unlink each slab from its list before handing the page back.
    unsafe {
        let mut lists = (*cache_ptr).inner.lock();
        let lists = &mut *lists;
        for list in [&mut lists.full, &mut lists.partial, &mut lists.empty] {
            while let Some(slab) = list.pop() {
                pmm::free_page(virt_ptr_to_phys(slab as *mut u8));
            }
        }
    }

    pmm::free_page(virt_ptr_to_phys(cache_ptr as *mut u8));
}

/// Physical address of an HHDM pointer.
fn virt_ptr_to_phys(ptr: *mut u8) -> PhysAddr {
    PhysAddr::new(ptr as u64 - address::hhdm_offset())
}

impl Cache {
    /// Takes a slab with at least one free object, preferring partial,
    /// then empty, then a fresh page.
    fn take_slab(&self, lists: &mut CacheLists) -> Option<*mut Slab> {
        if !lists.partial.head.is_null() {
            return Some(lists.partial.head);
        }
        if let Some(slab) = unsafe { lists.empty.pop() } {
            unsafe { lists.partial.push(slab) };
            return Some(slab);
        }
        let slab = self.grow()?;
        unsafe { lists.partial.push(slab) };
        Some(slab)
    }

    /// Builds a fresh slab page: header, then the freelist (or bufctl
    /// array) over the object area.
    fn grow(&self) -> Option<*mut Slab> {
        let page = pmm::alloc_page()?;
        let base = page.to_virt().as_mut_ptr::<u8>();
        let slab = base as *mut Slab;

        // SAFETY: the frame is exclusively ours; layout was validated in
        // cache_create.
        unsafe {
            ptr::write(
                slab,
                Slab {
                    next: ptr::null_mut(),
                    prev: ptr::null_mut(),
                    cache: self as *const Cache as *mut Cache,
                    object_count: self.objects_per_slab,
                    used_objects: 0,
                    free_head: ptr::null_mut(),
                    bufctl_head: ptr::null_mut(),
                },
            );

            let buf_start = base.add(self.object_offset);
            if self.flags.contains(CacheFlags::BUFCTL) {
                let ctl_array =
                    buf_start.add(self.object_size * self.objects_per_slab) as *mut Bufctl;
                for i in 0..self.objects_per_slab {
                    let ctl = ctl_array.add(i);
                    (*ctl).buffer = buf_start.add(i * self.object_size);
                    (*ctl).parent = slab;
                    (*ctl).next = (*slab).bufctl_head;
                    (*slab).bufctl_head = ctl;
                }
            } else {
                for i in (0..self.objects_per_slab).rev() {
                    let obj = buf_start.add(i * self.object_size);
                    *(obj as *mut *mut u8) = (*slab).free_head;
                    (*slab).free_head = obj;
                }
            }
        }

        Some(slab)
    }

    fn alloc(&self) -> Option<NonNull<u8>> {
        let mut lists = self.inner.lock();
        let slab = self.take_slab(&mut lists)?;

        // SAFETY: slab came from our lists and we hold the cache lock.
        let obj = unsafe {
            let obj = if self.flags.contains(CacheFlags::BUFCTL) {
                let ctl = (*slab).bufctl_head;
                debug_assert!(!ctl.is_null());
                (*slab).bufctl_head = (*ctl).next;
                (*ctl).buffer
            } else {
                let obj = (*slab).free_head;
                debug_assert!(!obj.is_null());
                (*slab).free_head = *(obj as *mut *mut u8);
                obj
            };

            (*slab).used_objects += 1;
            if (*slab).used_objects == (*slab).object_count {
                lists.partial.remove(slab);
                lists.full.push(slab);
            }
            obj
        };

        NonNull::new(obj)
    }

    fn free(&self, obj: NonNull<u8>) {
        let obj = obj.as_ptr();
        let slab = (obj as usize & !(PAGE_SIZE as usize - 1)) as *mut Slab;

        let mut lists = self.inner.lock();

        // SAFETY: a pointer allocated from this cache sits inside a slab
        // page whose header is at the page start.
        unsafe {
            if (*slab).cache != self as *const Cache as *mut Cache {
                panic!(
                    "slab corruption: object {:p} does not belong to this cache",
                    obj
                );
            }
            if (*slab).used_objects == 0 {
                log::error!("double free of {:p} into an empty slab", obj);
                return;
            }

            if self.flags.contains(CacheFlags::BUFCTL) {
                let buf_start = (slab as *mut u8).add(self.object_offset);
                let index = (obj as usize - buf_start as usize) / self.object_size;
                let ctl_array =
                    buf_start.add(self.object_size * (*slab).object_count) as *mut Bufctl;
                let ctl = ctl_array.add(index);
                (*ctl).next = (*slab).bufctl_head;
                (*slab).bufctl_head = ctl;
            } else {
                *(obj as *mut *mut u8) = (*slab).free_head;
                (*slab).free_head = obj;
            }

            let was_full = (*slab).used_objects == (*slab).object_count;
            (*slab).used_objects -= 1;

            if (*slab).used_objects == 0 {
                if was_full {
                    lists.full.remove(slab);
                } else {
                    lists.partial.remove(slab);
                }
                lists.empty.push(slab);
                // Retain one warm empty slab; release the surplus.
                if lists.empty.len > 1 {
                    let surplus = lists.empty.pop().expect("empty list has surplus");
                    pmm::free_page(virt_ptr_to_phys(surplus as *mut u8));
                }
            } else if was_full {
                lists.full.remove(slab);
                lists.partial.push(slab);
            }
        }
    }

    fn stats(&self) -> CacheStats {
        let lists = self.inner.lock();
        let mut stats = CacheStats {
            slabs: 0,
            empty_slabs: lists.empty.len,
            total_objects: 0,
            used_objects: 0,
            free_objects: 0,
        };
        for list in [&lists.full, &lists.partial, &lists.empty] {
            let mut slab = list.head;
            while !slab.is_null() {
                // SAFETY: list members are live slab headers.
                unsafe {
                    stats.slabs += 1;
                    stats.total_objects += (*slab).object_count;
                    stats.used_objects += (*slab).used_objects;
                    slab = (*slab).next;
                }
            }
        }
        stats.free_objects = stats.total_objects - stats.used_objects;
        stats
    }

    /// Effective (aligned) object size.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Requested alignment.
    pub fn align(&self) -> usize {
        self.align
    }
}

// =============================================================================
// Tests
// =============================================================================
