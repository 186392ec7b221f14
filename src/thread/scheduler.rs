//! Thread scheduler.

use super::Thread;
use crate::sync::SpinLock;
use std::{collections::VecDeque, sync::Arc};

/// A trait for a thread scheduler.
///
/// The [`Scheduler`] trait defines the common functionality expected from a
/// thread scheduler: managing the queue of runnable threads and determining
/// which thread to run next. The kernel consults it at every suspension
/// point (block, yield, wake) and never runs more than one thread at a
/// time.
pub trait Scheduler: Send + Sync {
    /// Pick the next thread to run.
    ///
    /// Removes and returns the chosen thread, or `None` if no thread is
    /// runnable.
    fn next_to_run(&self) -> Option<Arc<Thread>>;

    /// Push a thread `th` into the scheduling queue.
    fn push_to_queue(&self, th: Arc<Thread>);

    /// The highest effective priority among queued threads, if any.
    ///
    /// Used to decide whether the running thread should yield after waking
    /// or demoting someone.
    fn max_priority(&self) -> Option<u32>;
}

/// A priority scheduler.
///
/// Always runs the runnable thread with the highest *effective* priority;
/// threads of equal priority run in FIFO order. Effective priorities are
/// read at selection time, so priority donation takes effect without any
/// explicit requeue.
pub struct PriorityScheduler {
    runqueue: SpinLock<VecDeque<Arc<Thread>>>,
}

impl PriorityScheduler {
    /// Creates an empty scheduler.
    pub const fn new() -> Self {
        Self {
            runqueue: SpinLock::new(VecDeque::new()),
        }
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PriorityScheduler {
    fn next_to_run(&self) -> Option<Arc<Thread>> {
        let mut guard = self.runqueue.lock();
        let mut best: Option<(usize, u32)> = None;
        for (idx, th) in guard.iter().enumerate() {
            let sched = th.sched.lock();
            let priority = sched.priority;
            sched.unlock();
            // Strictly greater keeps equal-priority threads in FIFO order.
            if best.map_or(true, |(_, p)| priority > p) {
                best = Some((idx, priority));
            }
        }
        let picked = best.and_then(|(idx, _)| guard.remove(idx));
        guard.unlock();
        picked
    }

    fn push_to_queue(&self, th: Arc<Thread>) {
        let mut guard = self.runqueue.lock();
        guard.push_back(th);
        guard.unlock();
    }

    fn max_priority(&self) -> Option<u32> {
        let guard = self.runqueue.lock();
        let mut max = None;
        for th in guard.iter() {
            let sched = th.sched.lock();
            let priority = sched.priority;
            sched.unlock();
            if max.map_or(true, |p| priority > p) {
                max = Some(priority);
            }
        }
        guard.unlock();
        max
    }
}
