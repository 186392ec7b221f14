//! Reader/writer lock.
//!
//! This type of lock allows a number of readers or at most one writer at
//! any point in time. It is built from an inner [`Mutex`] guarding the
//! reader/writer counts and two condition variables, one for waiting
//! readers and one for waiting writers.
//!
//! Policy: when the lock becomes free a pending writer is always preferred
//! to pending readers, preventing writer starvation; readers only beat each
//! other when no writer waits.

use crate::sync::{Condvar, Mutex};
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

struct RwState {
    writer_active: bool,
    reader_count: usize,
}

/// A reader-writer lock protecting a value of type `T`.
///
/// Guards must be released with their explicit `unlock` methods, matching
/// the other lock guards in this kernel.
pub struct RwLock<T: ?Sized> {
    state: Mutex<RwState>,
    waiting_readers: Condvar,
    waiting_writers: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new instance of an `RwLock<T>` which is unlocked.
    pub fn new(data: T) -> Self {
        RwLock {
            state: Mutex::new(RwState {
                writer_active: false,
                reader_count: 0,
            }),
            waiting_readers: Condvar::new(),
            waiting_writers: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes this lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Locks this rwlock with shared read access, sleeping until no writer
    /// holds it.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut state = self
            .waiting_readers
            .wait_while(&self.state, |s| s.writer_active);
        state.reader_count += 1;
        state.unlock();
        RwLockReadGuard { lock: self }
    }

    /// Locks this rwlock with exclusive write access, sleeping until no
    /// reader or writer holds it.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut state = self
            .waiting_writers
            .wait_while(&self.state, |s| s.writer_active || s.reader_count > 0);
        state.writer_active = true;
        state.unlock();
        RwLockWriteGuard { lock: self }
    }

    /// Current number of active readers. Test instrumentation.
    pub fn reader_count(&self) -> usize {
        let state = self.state.lock();
        let count = state.reader_count;
        state.unlock();
        count
    }

    /// Whether a writer currently holds the lock. Test instrumentation.
    pub fn writer_active(&self) -> bool {
        let state = self.state.lock();
        let active = state.writer_active;
        state.unlock();
        active
    }
}

/// RAII structure used to release the shared read access of a lock.
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> RwLockReadGuard<'_, T> {
    /// Releases the shared access.
    ///
    /// When the last reader leaves, a waiting writer is let in if one
    /// exists; otherwise any waiting readers are released together.
    pub fn unlock(self) {
        let this = core::mem::ManuallyDrop::new(self);
        let mut state = this.lock.state.lock();
        assert!(
            !state.writer_active,
            "read guard released while a writer is active"
        );
        assert!(state.reader_count > 0, "read guard released twice");
        state.reader_count -= 1;
        if state.reader_count == 0 && !this.lock.waiting_writers.signal(&state) {
            this.lock.waiting_readers.broadcast(&state);
        }
        state.unlock();
    }
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        // `unlock` wraps the guard in ManuallyDrop, so reaching this drop
        // means the guard leaked without an unlock.
        let mut state = self.lock.state.lock();
        state.reader_count -= 1;
        state.unlock();
        if !std::thread::panicking() {
            panic!("RwLockReadGuard dropped without unlock");
        }
    }
}

/// RAII structure used to release the exclusive write access of a lock.
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> RwLockWriteGuard<'_, T> {
    /// Releases the exclusive access.
    ///
    /// Waiting readers are released en masse if any exist; otherwise a
    /// single waiting writer is let in.
    pub fn unlock(self) {
        let this = core::mem::ManuallyDrop::new(self);
        let mut state = this.lock.state.lock();
        assert!(state.writer_active, "write guard released twice");
        state.writer_active = false;
        if !this.lock.waiting_readers.broadcast(&state) {
            this.lock.waiting_writers.signal(&state);
        }
        state.unlock();
    }
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.writer_active = false;
        state.unlock();
        if !std::thread::panicking() {
            panic!("RwLockWriteGuard dropped without unlock");
        }
    }
}
