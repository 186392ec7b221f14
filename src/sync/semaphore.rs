//! Counting semaphore.
//!
//! A semaphore is a nonnegative integer with two atomic operations:
//!
//! - [`down`] (or "P"): wait for the value to become positive, then
//!   decrement it.
//! - [`up`] (or "V"): increment the value and wake one waiting thread, if
//!   any.
//!
//! Waking is by priority: `up` always releases the highest-priority waiter.
//! If the woken thread outranks the caller, `up` also yields the processor,
//! unless it is running in interrupt context; `up` and [`try_down`] are
//! the only blocking-family operations an interrupt handler may invoke.
//!
//! The wait list is a multiset: a thread that is woken re-checks the value
//! before claiming it, because a single `up` may have been intercepted by a
//! higher-priority thread that arrived in between.
//!
//! [`down`]: Semaphore::down
//! [`up`]: Semaphore::up
//! [`try_down`]: Semaphore::try_down

use crate::{
    sync::SpinLock,
    thread::{self, Thread, ThreadState},
};
use std::sync::Arc;

/// A counting semaphore.
pub struct Semaphore {
    inner: SpinLock<SemaInner>,
}

struct SemaInner {
    value: usize,
    waiters: Vec<Arc<Thread>>,
}

impl Semaphore {
    /// Creates a new semaphore with the given initial value.
    pub const fn new(value: usize) -> Self {
        Semaphore {
            inner: SpinLock::new(SemaInner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Down or "P" operation.
    ///
    /// Waits for the value to become positive and then atomically
    /// decrements it. This function may sleep, so it must not be called
    /// within an interrupt handler.
    pub fn down(&self) {
        assert!(
            !crate::interrupt::in_handler(),
            "Semaphore::down from interrupt context"
        );
        let cur = thread::current();
        let mut inner = self.inner.lock();
        while inner.value == 0 {
            inner.waiters.push(cur.clone());
            let mut sched = cur.sched.lock();
            sched.state = ThreadState::Blocked;
            sched.unlock();
            inner.unlock();
            thread::block_current();
            // Re-enter the critical section and re-check: the `up` that
            // woke us may have been consumed by another arrival.
            inner = self.inner.lock();
        }
        inner.value -= 1;
        inner.unlock();
    }

    /// Down operation, but only if the value is already positive.
    ///
    /// Returns whether the semaphore was decremented. Never sleeps, so it
    /// may be called from an interrupt handler.
    pub fn try_down(&self) -> bool {
        let mut inner = self.inner.lock();
        let ok = inner.value > 0;
        if ok {
            inner.value -= 1;
        }
        inner.unlock();
        ok
    }

    /// Up or "V" operation.
    ///
    /// Increments the value and wakes the highest-priority waiter, if any.
    /// Yields to the woken thread if it outranks the caller and the caller
    /// is not in interrupt context.
    pub fn up(&self) {
        let mut inner = self.inner.lock();
        let woken = Self::pop_highest(&mut inner.waiters);
        inner.value += 1;
        inner.unlock();
        if let Some(th) = woken {
            thread::unblock(th);
            if !crate::interrupt::in_handler() {
                thread::yield_if_higher();
            }
        }
    }

    /// Effective priority of the highest-priority waiter, if any.
    ///
    /// Used by the condition variable to order its private waiter
    /// semaphores.
    pub(crate) fn peek_highest_priority(&self) -> Option<u32> {
        let inner = self.inner.lock();
        let mut max = None;
        for th in inner.waiters.iter() {
            let p = th.priority();
            if max.map_or(true, |m| p > m) {
                max = Some(p);
            }
        }
        inner.unlock();
        max
    }

    // Remove and return the highest-priority waiter; first wins on a tie.
    fn pop_highest(waiters: &mut Vec<Arc<Thread>>) -> Option<Arc<Thread>> {
        let mut best: Option<(usize, u32)> = None;
        for (idx, th) in waiters.iter().enumerate() {
            let p = th.priority();
            if best.map_or(true, |(_, bp)| p > bp) {
                best = Some((idx, p));
            }
        }
        best.map(|(idx, _)| waiters.remove(idx))
    }
}
