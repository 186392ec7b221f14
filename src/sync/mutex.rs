//! Sleeping lock with priority donation.
//!
//! A [`Lock`] can be held by at most a single thread at any given time. It
//! is not recursive: it is an error for the holding thread to try to
//! acquire it again.
//!
//! A lock is a specialization of a semaphore with an initial value of 1,
//! plus an owner. The owner is what enables **priority donation**: while a
//! thread waits for a lock, its effective priority is donated to the
//! holder, so that a low-priority holder cannot be starved of the processor
//! by medium-priority threads while a high-priority thread needs the lock.
//! Donation is transitive (if the holder is itself blocked on another
//! lock, the donation propagates along the `blocked_on -> holder` chain)
//! and is recomputed lazily, on lock-wait entry and on release.
//!
//! [`Mutex`] pairs a [`Lock`] with the data it protects, in the style of
//! the spinlock: access goes through a guard, and the guard must be
//! released with an explicit [`MutexGuard::unlock`].

use crate::{
    sync::{Semaphore, SpinLock, WouldBlock},
    thread::{self, Thread},
};
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};
use std::sync::Arc;

/// Shared core of a [`Lock`].
///
/// Threads keep an `Arc` to this while blocked on the lock so that
/// donation can be chased through holder chains.
pub(crate) struct LockState {
    holder: SpinLock<Option<Arc<Thread>>>,
    sema: Semaphore,
}

impl LockState {
    /// The thread currently holding the lock, if any.
    pub(crate) fn holder_thread(&self) -> Option<Arc<Thread>> {
        let holder = self.holder.lock();
        let th = holder.clone();
        holder.unlock();
        th
    }
}

/// A sleeping mutual-exclusion lock with priority donation.
pub struct Lock {
    state: Arc<LockState>,
}

impl Lock {
    /// Creates a new unheld lock.
    pub fn new() -> Self {
        Lock {
            state: Arc::new(LockState {
                holder: SpinLock::new(None),
                sema: Semaphore::new(1),
            }),
        }
    }

    /// Acquires the lock, sleeping until it becomes available.
    ///
    /// While sleeping, the caller donates its effective priority to the
    /// holder (transitively through any chain of lock waits the holder is
    /// part of).
    ///
    /// # Panics
    ///
    /// Panics when called from interrupt context or when the caller
    /// already holds the lock.
    pub fn acquire(&self) {
        assert!(
            !crate::interrupt::in_handler(),
            "Lock::acquire from interrupt context"
        );
        let cur = thread::current();
        let mut holder = self.state.holder.lock();
        match &*holder {
            Some(h) => {
                assert!(
                    !Arc::ptr_eq(h, &cur),
                    "thread \"{}\" reacquired a lock it already holds",
                    cur.name
                );
                let h = h.clone();
                // Enter the lock-wait: record what we block on, join the
                // holder's donors, and force the holder chain to recompute.
                let mut sched = cur.sched.lock();
                sched.blocked_on = Some(self.state.clone());
                sched.unlock();
                let mut holder_sched = h.sched.lock();
                holder_sched.donors.push(cur.clone());
                holder_sched.unlock();
                holder.unlock();
                thread::refresh_priority_chain(h);
                self.state.sema.down();
                let mut sched = cur.sched.lock();
                sched.blocked_on = None;
                sched.unlock();
                let mut holder = self.state.holder.lock();
                debug_assert!(holder.is_none());
                *holder = Some(cur);
                holder.unlock();
            }
            None => {
                *holder = Some(cur);
                holder.unlock();
                let taken = self.state.sema.try_down();
                debug_assert!(taken, "free lock had an exhausted semaphore");
            }
        }
    }

    /// Tries to acquire the lock without sleeping or donating.
    ///
    /// Returns whether the lock was acquired.
    pub fn try_acquire(&self) -> bool {
        let cur = thread::current();
        let mut holder = self.state.holder.lock();
        match &*holder {
            Some(h) => {
                assert!(
                    !Arc::ptr_eq(h, &cur),
                    "thread \"{}\" reacquired a lock it already holds",
                    cur.name
                );
                holder.unlock();
                false
            }
            None => {
                *holder = Some(cur);
                holder.unlock();
                let taken = self.state.sema.try_down();
                debug_assert!(taken, "free lock had an exhausted semaphore");
                true
            }
        }
    }

    /// Releases the lock.
    ///
    /// Donations received through this lock are dropped and the releaser's
    /// effective priority is recomputed; if that leaves a higher-priority
    /// thread runnable, the releaser yields.
    ///
    /// # Panics
    ///
    /// Panics when the caller does not hold the lock.
    pub fn release(&self) {
        let cur = thread::current();
        let mut holder = self.state.holder.lock();
        match holder.take() {
            Some(h) if Arc::ptr_eq(&h, &cur) => {}
            Some(h) => panic!(
                "thread \"{}\" released a lock held by \"{}\"",
                cur.name, h.name
            ),
            None => panic!("thread \"{}\" released an unheld lock", cur.name),
        }
        holder.unlock();
        // Threads blocked on *this* lock stop donating to us.
        let mut sched = cur.sched.lock();
        sched.donors.retain(|donor| {
            let donor_sched = donor.sched.lock();
            let keep = match &donor_sched.blocked_on {
                Some(lock) => !Arc::ptr_eq(lock, &self.state),
                None => true,
            };
            donor_sched.unlock();
            keep
        });
        let mut priority = sched.base_priority;
        for donor in &sched.donors {
            let donor_sched = donor.sched.lock();
            priority = priority.max(donor_sched.priority);
            donor_sched.unlock();
        }
        sched.priority = priority;
        sched.unlock();
        self.state.sema.up();
        // Losing donors may have dropped us below another runnable thread.
        thread::yield_if_higher();
    }

    /// Whether the current thread holds this lock.
    pub fn held_by_current(&self) -> bool {
        let cur = thread::current();
        let holder = self.state.holder.lock();
        let held = holder
            .as_ref()
            .map_or(false, |h| Arc::ptr_eq(h, &cur));
        holder.unlock();
        held
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// A sleeping mutex protecting a value of type `T`.
///
/// This is the [`Lock`] plus the data it protects; the data can only be
/// reached through the guard returned by [`lock`], and the guard must be
/// released with an explicit [`MutexGuard::unlock`].
///
/// [`lock`]: Self::lock
pub struct Mutex<T: ?Sized> {
    raw: Lock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            raw: Lock::new(),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, sleeping until it is available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.acquire();
        MutexGuard {
            mutex: self,
            armed: true,
        }
    }

    /// Attempts to acquire this mutex without sleeping.
    ///
    /// # Errors
    ///
    /// Returns [`WouldBlock`] when the mutex is already held.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        if self.raw.try_acquire() {
            Ok(MutexGuard {
                mutex: self,
                armed: true,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// The underlying [`Lock`].
    pub fn raw(&self) -> &Lock {
        &self.raw
    }
}

/// An RAII guard for a [`Mutex`]. The mutex must be released with the
/// explicit [`unlock`] method; dropping a live guard outside of a panic is
/// a bug and panics.
///
/// [`unlock`]: Self::unlock
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a Mutex<T>,
    armed: bool,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// Releases the underlying [`Mutex`].
    pub fn unlock(mut self) {
        self.armed = false;
        self.mutex.raw.release();
    }

    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.mutex.raw.release();
            if !std::thread::panicking() {
                panic!("MutexGuard dropped without unlock");
            }
        }
    }
}
