// =============================================================================
// Opal — Test-and-Set Spinlock
// =============================================================================
//
// The kernel has no scheduler yet, so every lock is a spinlock. This one is
// the classic test-and-set variant: a single atomic flag, acquired with a
// compare-exchange and released with a store. The inner wait loop reads the
// flag with relaxed ordering and executes PAUSE so a contended core does not
// hammer the cache line.
//
// IRQ SAFETY:
//   Acquiring the lock disables interrupts on the current core and the
//   previous interrupt state is restored on unlock. Without this, an
//   interrupt handler that tries to take a lock held by the code it
//   interrupted would spin forever. On hosted builds (cargo test) there are
//   no interrupts to mask and the IRQ handling compiles to nothing.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set spinlock that disables interrupts while held.
///
/// # Examples
/// ```ignore
/// static COUNTER: SpinLock<u64> = SpinLock::new(0);
///
/// {
///     let mut guard = COUNTER.lock();
///     *guard += 1;
/// } // released when the guard drops
/// ```
pub struct SpinLock<T> {
    /// `true` while some core holds the lock.
    locked: AtomicBool,

    /// The protected data. UnsafeCell is required because we mutate through
    /// a shared reference; the lock provides exclusivity at runtime.
    data: UnsafeCell<T>,
}

// SAFETY: The lock ensures at most one core accesses the data at a time,
// so sharing the lock between cores is sound whenever T itself may move
// between cores.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new, unlocked spinlock. `const` so it can back statics.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is available.
    ///
    /// Interrupts are disabled before the first acquisition attempt and the
    /// previous interrupt state is restored when the guard drops.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq_was_enabled = interrupts_enabled();
        disable_interrupts();

        loop {
            // Acquire ordering so we observe all writes made by the
            // previous holder before touching the data.
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            // Wait until the flag looks free before retrying the
            // read-modify-write; plain loads don't bounce the cache line.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `None` if the lock is currently held. Useful in contexts
    /// where spinning could deadlock (interrupt handlers).
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq_was_enabled = interrupts_enabled();
        disable_interrupts();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                irq_was_enabled,
            })
        } else {
            if irq_was_enabled {
                enable_interrupts();
            }
            None
        }
    }

    /// Returns a mutable reference to the underlying data without locking.
    ///
    /// Safe because `&mut self` guarantees exclusive access at compile
    /// time. Useful during single-core initialization.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock. Dropping it releases the lock and
/// restores the interrupt state saved at acquisition.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so access is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so access is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering publishes our writes to the next holder.
        self.lock.locked.store(false, Ordering::Release);

        if self.irq_was_enabled {
            enable_interrupts();
        }
    }
}

// =============================================================================
// Interrupt state management
// =============================================================================
//
// Direct RFLAGS manipulation, bare-metal target only. Hosted builds have no
// maskable interrupt state to manage, so these are no-ops there.
// =============================================================================

/// Checks whether maskable interrupts are enabled on this core (RFLAGS.IF).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline(always)]
fn interrupts_enabled() -> bool {
    let rflags: u64;
    // SAFETY: Reading RFLAGS has no side effects.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            out(reg) rflags,
            options(nomem, preserves_flags)
        );
    }
    rflags & (1 << 9) != 0
}

/// Disables maskable interrupts on the current core (CLI).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline(always)]
fn disable_interrupts() {
    // SAFETY: Interrupts are re-enabled when the guard drops, if they were
    // enabled before.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Enables maskable interrupts on the current core (STI).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline(always)]
fn enable_interrupts() {
    // SAFETY: Only called to restore a previously-observed enabled state.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline(always)]
fn interrupts_enabled() -> bool {
    false
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline(always)]
fn disable_interrupts() {}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline(always)]
fn enable_interrupts() {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::SpinLock;

    #[test]
    fn basic_lock_and_raii() {
        let l = SpinLock::new(0_u32);

        // take the lock, mutate, and drop
        {
            let mut g = l.lock();
            *g = 41;
        }

        // lock again; the previous drop must have unlocked
        {
            let mut g = l.lock();
            *g += 1;
            assert_eq!(*g, 42);
        }
    }

    #[test]
    fn try_lock_semantics() {
        let l = SpinLock::new(1_u8);

        let g1 = l.try_lock();
        assert!(g1.is_some());

        // while held, try_lock must fail
        assert!(l.try_lock().is_none());

        drop(g1);
        assert!(l.try_lock().is_some());
    }

    #[test]
    fn get_mut_allows_direct_mutation() {
        let mut l = SpinLock::new(7_u64);
        *l.get_mut() += 1;
        assert_eq!(*l.lock(), 8);
    }

    #[test]
    fn contended_increments_are_exact() {
        use std::sync::Arc;
        use std::thread;

        let threads = 8;
        let iters = 5_000;

        let lock = Arc::new(SpinLock::new(0_usize));
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..iters {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), threads * iters);
    }
}
