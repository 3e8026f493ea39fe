// =============================================================================
// Opal — Kernel Synchronization Primitives
// =============================================================================
//
// In a kernel, we can't use std::sync (there is no std). We need our own
// primitives that work in a bare-metal, multi-core, interrupt-driven
// environment.
//
// Lock ordering rule: the PMM lock is the innermost lock in the kernel.
// Slab cache locks and the heap lock may be held while calling into the
// PMM; never the other way around.
// =============================================================================

pub mod spinlock;

pub use spinlock::SpinLock;
