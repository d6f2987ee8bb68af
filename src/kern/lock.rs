//! Spin Locks
//!
//! Based on Mach4 kern/lock.h/c by Avadis Tevanian, Jr. and Michael Wayne Young
//!
//! Provides:
//! - [`SpinMutex`]: a bare test-and-set lock with explicit lock/unlock
//! - [`SpinLock`]: the same lock owning the data it protects, named for
//!   diagnostics and counting how often a locker found it taken
//!
//! Both busy-wait and must only guard short critical sections that never
//! block. Blocking mutual exclusion for threads is in [`super::mutex`].

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

// ============================================================================
// Spin Mutex
// ============================================================================

/// Atomic test-and-set spin mutex
#[repr(C)]
pub struct SpinMutex {
    held: AtomicBool,
}

impl core::fmt::Debug for SpinMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinMutex")
            .field("held", &self.is_locked())
            .finish()
    }
}

impl SpinMutex {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Reset to unlocked
    pub fn init(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Spin until the lock is ours
    pub fn lock(&self) {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of a free spin mutex");
        self.held.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl Default for SpinMutex {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Spin Lock with data
// ============================================================================

/// Spin mutex that owns the protected value
pub struct SpinLock<T> {
    name: &'static str,
    lock: SpinMutex,
    contended: AtomicU32,
    data: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            lock: SpinMutex::new(),
            contended: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        if !self.lock.try_lock() {
            self.contended.fetch_add(1, Ordering::Relaxed);
            log::trace!(target: "lock", "spinning on {}", self.name);
            self.lock.lock();
        }
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of `lock` calls that had to spin
    pub fn contentions(&self) -> u32 {
        self.contended.load(Ordering::Relaxed)
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("held", &self.is_locked())
            .field("contentions", &self.contentions())
            .finish()
    }
}

// SAFETY: access to `data` is serialized by `lock`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

/// RAII guard for [`SpinLock`]
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.unlock();
    }
}
