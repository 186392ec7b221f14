//! Uniprocessor spinlock.
//!
//! The spinlock is the innermost mutual-exclusion primitive of the kernel:
//! it masks interrupts for as long as it is held and never sleeps, so it is
//! safe to take from any context. On a single processor the lock is almost
//! never observed contended; the atomic flag exists so that a violated
//! nesting discipline shows up as a hang or panic rather than as silent
//! corruption.
//!
//! The guard does **not** release the lock when dropped: the holder must
//! call [`SpinLockGuard::unlock`] explicitly. Dropping a live guard outside
//! of a panic is a bug and panics.

use crate::interrupt::InterruptGuard;
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// Each spinlock has a type parameter which represents the data that it is
/// protecting. The data can only be accessed through the guards returned
/// from [`lock`] and [`try_lock`], which guarantees that the data is only
/// ever accessed when the spinlock is locked.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the spinlock, spinning until it is available.
    ///
    /// Returns a guard that allows scoped access to the protected data. The
    /// guard must be released with [`SpinLockGuard::unlock`].
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let guard = loop {
            let guard = InterruptGuard::new();
            if !self.locked.fetch_or(true, Ordering::SeqCst) {
                break guard;
            }
            drop(guard);
            core::hint::spin_loop();
        };
        SpinLockGuard {
            lock: self,
            _guard: guard,
            armed: true,
        }
    }

    /// Attempts to acquire this lock without spinning.
    ///
    /// # Errors
    ///
    /// Returns [`WouldBlock`] when the lock is already held.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = InterruptGuard::new();
        if !self.locked.fetch_or(true, Ordering::SeqCst) {
            Ok(SpinLockGuard {
                lock: self,
                _guard: guard,
                armed: true,
            })
        } else {
            Err(WouldBlock)
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a spinlock.
///
/// The lock must be explicitly released by the [`unlock`] method; dropping
/// the guard without unlocking panics (unless the thread is already
/// panicking, in which case the lock is quietly released so that the panic
/// can propagate).
///
/// The data protected by the spinlock can be accessed through this guard.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    _guard: InterruptGuard,
    armed: bool,
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    pub fn unlock(mut self) {
        self.armed = false;
        self.lock.locked.store(false, Ordering::SeqCst);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.lock.locked.store(false, Ordering::SeqCst);
            if !std::thread::panicking() {
                panic!("SpinLockGuard dropped without unlock");
            }
        }
    }
}
