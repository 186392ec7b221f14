//! Condition variable.
//!
//! A condition variable allows one piece of code to signal a condition and
//! cooperating code to receive the signal and act upon it. It is always
//! used together with a [`Mutex`] that protects the shared state the
//! condition is about.
//!
//! The monitor implemented here is **Mesa** style, not Hoare style:
//! sending and receiving a signal are not an atomic operation, so waiters
//! must re-check their predicate after waking. [`wait_while`] packages the
//! re-check loop.
//!
//! Each waiter parks on a private unary semaphore enqueued on the condition
//! variable; [`signal`] wakes the waiter whose blocked thread has the
//! highest effective priority.
//!
//! [`wait_while`]: Condvar::wait_while
//! [`signal`]: Condvar::signal

use crate::sync::{Mutex, MutexGuard, Semaphore, SpinLock};
use std::sync::Arc;

/// A Mesa-style condition variable.
///
/// A given condition variable should be associated with a single mutex, but
/// one mutex may be associated with any number of condition variables.
#[derive(Default)]
pub struct Condvar {
    waiters: SpinLock<Vec<Arc<Semaphore>>>,
}

impl Condvar {
    /// Creates a new condition variable ready to be waited on and signaled.
    pub fn new() -> Self {
        Condvar {
            waiters: SpinLock::new(Vec::new()),
        }
    }

    /// Atomically releases the guarded mutex and waits to be signaled;
    /// reacquires the mutex before returning.
    ///
    /// Because signaling is advisory, the caller must re-check its
    /// predicate on return (or use [`wait_while`]).
    ///
    /// [`wait_while`]: Self::wait_while
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        assert!(
            !crate::interrupt::in_handler(),
            "Condvar::wait from interrupt context"
        );
        let mutex = guard.mutex();
        let waiter = Arc::new(Semaphore::new(0));
        let mut waiters = self.waiters.lock();
        waiters.push(waiter.clone());
        waiters.unlock();
        guard.unlock();
        waiter.down();
        mutex.lock()
    }

    /// Locks `mutex` and blocks the current thread while `predicate`
    /// returns `true`.
    ///
    /// The predicate is evaluated under the mutex and re-evaluated after
    /// every wake; the returned guard is held when the predicate is first
    /// observed `false`.
    pub fn wait_while<'a, T: ?Sized>(
        &self,
        mutex: &'a Mutex<T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        let mut guard = mutex.lock();
        while predicate(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wakes one thread waiting on this condition variable, if any.
    ///
    /// The waiter whose blocked thread has the highest effective priority
    /// is chosen. The caller must hold the associated mutex, which the
    /// guard argument attests. Returns whether a waiter was woken.
    pub fn signal<T: ?Sized>(&self, _guard: &MutexGuard<'_, T>) -> bool {
        assert!(
            !crate::interrupt::in_handler(),
            "Condvar::signal from interrupt context"
        );
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            waiters.unlock();
            return false;
        }
        // A waiter that has enqueued itself but not yet parked reports no
        // priority; waking it is still sound because its later `down`
        // consumes the `up` immediately.
        let mut best = 0;
        let mut best_priority = waiters[0].peek_highest_priority();
        for (idx, waiter) in waiters.iter().enumerate().skip(1) {
            let p = waiter.peek_highest_priority();
            if p > best_priority {
                best = idx;
                best_priority = p;
            }
        }
        let waiter = waiters.remove(best);
        waiters.unlock();
        waiter.up();
        true
    }

    /// Wakes all threads waiting on this condition variable.
    ///
    /// Returns whether at least one waiter was woken.
    pub fn broadcast<T: ?Sized>(&self, guard: &MutexGuard<'_, T>) -> bool {
        let mut any = false;
        while self.signal(guard) {
            any = true;
        }
        any
    }
}
