// =============================================================================
// Opal — Hosted Test Arena
// =============================================================================
//
// The memory manager only ever touches physical memory through the HHDM:
// virt = phys + offset. That makes it testable on the host with no VM at
// all — allocate one big zeroed buffer, install its base address as the
// HHDM offset, and treat buffer offsets as "physical" addresses. Every
// HHDM dereference then lands inside the buffer.
//
// Layout of the simulated physical space:
//
//   [0, 1 GiB)        one exclusive claimant (the literal boot-map test)
//   [1 GiB, 2 GiB)    bump-allocated private windows, 8 MiB aligned so
//                     buddy blocks of every order can form cleanly
//
// The buffer is allocated zeroed and demand-paged, so the 2 GiB of
// address space costs only the pages the tests actually touch.
//
// Tests that operate on the process-global allocators (pmm::init and
// everything layered on it) serialize through `global_lock()` and share
// one global window, installed once by `init_global_pmm`.
// =============================================================================

#![cfg(test)]

use std::alloc::{alloc_zeroed, Layout};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, Once, OnceLock};

use crate::memory::address;
use crate::memory::memmap::{MemoryKind, MemoryRegion};
use crate::memory::pmm;

/// Total simulated physical address space.
const ARENA_BYTES: usize = 2 << 30;

/// Windows are aligned to the largest buddy block (order 11 = 8 MiB).
const WINDOW_ALIGN: usize = 8 * 1024 * 1024;

/// Bump cursor for private windows; starts past the exclusive low GiB.
static NEXT_WINDOW: AtomicUsize = AtomicUsize::new(1 << 30);

static LOW_GIG_TAKEN: AtomicBool = AtomicBool::new(false);

fn arena_base() -> usize {
    static BASE: OnceLock<usize> = OnceLock::new();
    *BASE.get_or_init(|| {
        let layout = Layout::from_size_align(ARENA_BYTES, 4096).unwrap();
        // SAFETY: layout is non-zero; the arena lives for the whole test
        // process and is never deallocated.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "failed to allocate test arena");
        address::init_hhdm(ptr as u64);
        ptr as usize
    })
}

/// Claims a private window of simulated physical memory and returns its
/// "physical" base address (an arena offset).
pub fn take_window(bytes: usize) -> u64 {
    arena_base();
    let rounded = (bytes + WINDOW_ALIGN - 1) & !(WINDOW_ALIGN - 1);
    let base = NEXT_WINDOW.fetch_add(rounded, Ordering::SeqCst);
    assert!(
        base + rounded <= ARENA_BYTES,
        "test arena exhausted: grow ARENA_BYTES"
    );
    base as u64
}

/// Claims the exclusive [0, 1 GiB) range for the one test that replays the
/// literal boot memory map. Panics if claimed twice.
pub fn take_low_gig() -> u64 {
    arena_base();
    assert!(
        !LOW_GIG_TAKEN.swap(true, Ordering::SeqCst),
        "low gig already claimed by another test"
    );
    0
}

/// Serializes tests that touch process-global state (the global PMM and
/// everything built on it).
pub fn global_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Initializes the process-global PMM over a dedicated 64 MiB window.
/// Idempotent; every test that calls into the global allocators goes
/// through here first.
pub fn init_global_pmm() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let base = take_window(64 * 1024 * 1024);
        let regions = [MemoryRegion {
            base,
            length: 64 * 1024 * 1024,
            kind: MemoryKind::Usable,
        }];
        pmm::init(&regions);
    });
}
