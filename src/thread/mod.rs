//! Thread abstraction.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with its
//! own stack and local state. Threads can be named, carry a scheduling
//! priority, and provide built-in support for low-level synchronization.
//!
//! The kernel models a **single processor**: exactly one thread executes at
//! a time, and control transfers only at well-defined suspension points:
//! blocking on a primitive, yielding, or waking a higher-priority thread.
//! Each kernel thread is hosted on an OS thread, but the hand-off protocol
//! (park the outgoing thread, unpark the incoming one) guarantees the
//! uniprocessor discipline, which is what makes scheduling-sensitive tests
//! deterministic.
//!
//! A thread's *base* priority is fixed at spawn; its *effective* priority
//! additionally reflects donations from threads blocked on locks it holds
//! (see [`sync::mutex`](crate::sync::mutex)). The scheduler always selects
//! the runnable thread with the highest effective priority, FIFO within a
//! priority class.
pub mod scheduler;

use crate::{interrupt::InterruptGuard, sync::SpinLock, Kernel};
use std::{
    cell::RefCell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex as HostMutex,
    },
};

/// Lowest priority.
pub const PRI_MIN: u32 = 0;
/// Default priority.
pub const PRI_DEFAULT: u32 = 31;
/// Highest priority.
pub const PRI_MAX: u32 = 63;

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is runnable and waiting in the ready queue.
    Runnable,
    /// Thread is running.
    Running,
    /// Thread is blocked on a synchronization primitive.
    Blocked,
    /// Thread has exited with an exit code.
    Exited(i32),
}

/// Scheduling state of a thread.
///
/// Protected by the thread's `sched` spinlock. The donors list and
/// `blocked_on` field implement priority donation: while a thread waits for
/// a lock it appears in the holder's `donors`, and its own `blocked_on`
/// names the lock so donation can be chased through chains of holders.
pub(crate) struct SchedState {
    pub state: ThreadState,
    pub base_priority: u32,
    /// Effective priority: `max(base_priority, max donor effective)`.
    pub priority: u32,
    pub donors: Vec<Arc<Thread>>,
    pub blocked_on: Option<Arc<crate::sync::mutex::LockState>>,
}

/// A thread of kernel execution.
pub struct Thread {
    /// Thread id.
    pub tid: u64,
    /// Thread name.
    pub name: String,
    pub(crate) sched: SpinLock<SchedState>,
    pub(crate) exit_code: SpinLock<Option<i32>>,
    pub(crate) exit_sema: crate::sync::Semaphore,
    parker: Parker,
}

impl Thread {
    fn new(name: String, priority: u32) -> Arc<Self> {
        static TID: AtomicU64 = AtomicU64::new(0);
        Arc::new(Thread {
            tid: TID.fetch_add(1, Ordering::SeqCst),
            name,
            sched: SpinLock::new(SchedState {
                state: ThreadState::Runnable,
                base_priority: priority,
                priority,
                donors: Vec::new(),
                blocked_on: None,
            }),
            exit_code: SpinLock::new(None),
            exit_sema: crate::sync::Semaphore::new(0),
            parker: Parker::new(),
        })
    }

    /// The thread's current effective priority.
    pub fn priority(&self) -> u32 {
        let sched = self.sched.lock();
        let priority = sched.priority;
        sched.unlock();
        priority
    }

    /// The thread's base (undonated) priority.
    pub fn base_priority(&self) -> u32 {
        let sched = self.sched.lock();
        let priority = sched.base_priority;
        sched.unlock();
        priority
    }

    /// The thread's current state.
    pub fn state(&self) -> ThreadState {
        let sched = self.sched.lock();
        let state = sched.state;
        sched.unlock();
        state
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .finish()
    }
}

// Park-site for one hosted thread. Handles the unpark-before-park race.
struct Parker {
    flag: HostMutex<bool>,
    cv: Condvar,
}

impl Parker {
    fn new() -> Self {
        Parker {
            flag: HostMutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn park(&self) {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            flag = self.cv.wait(flag).unwrap();
        }
        *flag = false;
    }

    fn unpark(&self) {
        *self.flag.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

/// Per-processor execution state: the scheduler and the bookkeeping that
/// lets the host observe a completed run.
pub(crate) struct Cpu {
    pub(crate) scheduler: Box<dyn scheduler::Scheduler>,
    live: HostMutex<LiveState>,
    done: Condvar,
    os_handles: HostMutex<Vec<std::thread::JoinHandle<()>>>,
    panicked: HostMutex<Option<Box<dyn std::any::Any + Send>>>,
}

struct LiveState {
    threads: usize,
    halted: bool,
}

impl Cpu {
    pub(crate) fn new(scheduler: Box<dyn scheduler::Scheduler>) -> Self {
        Cpu {
            scheduler,
            live: HostMutex::new(LiveState {
                threads: 0,
                halted: false,
            }),
            done: Condvar::new(),
            os_handles: HostMutex::new(Vec::new()),
            panicked: HostMutex::new(None),
        }
    }

    fn thread_started(&self) {
        self.live.lock().unwrap().threads += 1;
    }

    // Returns the number of threads still live.
    fn thread_finished(&self) -> usize {
        let mut live = self.live.lock().unwrap();
        live.threads -= 1;
        if live.threads == 0 {
            live.halted = true;
            self.done.notify_all();
        }
        live.threads
    }

    fn abort(&self, payload: Box<dyn std::any::Any + Send>) {
        let mut panicked = self.panicked.lock().unwrap();
        if panicked.is_none() {
            *panicked = Some(payload);
        }
        drop(panicked);
        let mut live = self.live.lock().unwrap();
        live.halted = true;
        self.done.notify_all();
    }

    // Host side: wait for the run to complete and surface any panic.
    pub(crate) fn wait_halt(&self) {
        let mut live = self.live.lock().unwrap();
        while !live.halted {
            live = self.done.wait(live).unwrap();
        }
        let clean = live.threads == 0;
        live.halted = false;
        drop(live);
        if clean {
            for handle in self.os_handles.lock().unwrap().drain(..) {
                let _ = handle.join();
            }
        }
        if let Some(payload) = self.panicked.lock().unwrap().take() {
            std::panic::resume_unwind(payload);
        }
    }
}

std::thread_local! {
    static CPU_LOCAL: RefCell<Option<CpuLocal>> = const { RefCell::new(None) };
}

#[derive(Clone)]
struct CpuLocal {
    thread: Arc<Thread>,
    kernel: Arc<Kernel>,
}

fn cpu_local() -> CpuLocal {
    CPU_LOCAL.with(|local| {
        local
            .borrow()
            .clone()
            .expect("not running on a kernel thread")
    })
}

/// The currently running thread.
pub fn current() -> Arc<Thread> {
    cpu_local().thread
}

/// Run `f` with a reference to the currently running thread.
pub fn with_current<R>(f: impl FnOnce(&Arc<Thread>) -> R) -> R {
    f(&cpu_local().thread)
}

/// The kernel the current thread is running on.
pub(crate) fn current_kernel() -> Arc<Kernel> {
    cpu_local().kernel
}

// Hand the processor to `next`.
fn switch_to(next: Arc<Thread>) {
    let mut sched = next.sched.lock();
    debug_assert_eq!(sched.state, ThreadState::Runnable);
    sched.state = ThreadState::Running;
    sched.unlock();
    next.parker.unpark();
}

/// Block the current thread.
///
/// The caller must already have published the thread on some wait list and
/// marked it [`ThreadState::Blocked`]; this routine merely hands the
/// processor over and parks. Returns once another thread unblocks us.
pub(crate) fn block_current() {
    assert!(
        !InterruptGuard::is_guarded(),
        "tried to block while holding a spinlock"
    );
    let local = cpu_local();
    debug_assert_eq!(local.thread.state(), ThreadState::Blocked);
    match local.kernel.cpu.scheduler.next_to_run() {
        Some(next) => switch_to(next),
        None => panic!(
            "deadlock: \"{}\" blocked with no runnable thread",
            local.thread.name
        ),
    }
    local.thread.parker.park();
}

/// Make `th` runnable again.
///
/// The wake itself never preempts; callers that must honor the
/// wake-higher-priority rule follow up with [`yield_if_higher`].
pub(crate) fn unblock(th: Arc<Thread>) {
    let local = cpu_local();
    let mut sched = th.sched.lock();
    debug_assert_eq!(sched.state, ThreadState::Blocked);
    sched.state = ThreadState::Runnable;
    sched.unlock();
    local.kernel.cpu.scheduler.push_to_queue(th);
}

/// Yield the processor to the highest-priority runnable thread.
///
/// The current thread goes back on the ready queue; if it is itself the
/// highest-priority runnable thread it keeps running.
pub(crate) fn yield_now() {
    assert!(
        !InterruptGuard::is_guarded(),
        "tried to yield while holding a spinlock"
    );
    let local = cpu_local();
    let mut sched = local.thread.sched.lock();
    sched.state = ThreadState::Runnable;
    sched.unlock();
    local.kernel.cpu.scheduler.push_to_queue(local.thread.clone());
    let next = local
        .kernel
        .cpu
        .scheduler
        .next_to_run()
        .expect("ready queue cannot be empty after a yield");
    if Arc::ptr_eq(&next, &local.thread) {
        let mut sched = local.thread.sched.lock();
        sched.state = ThreadState::Running;
        sched.unlock();
        return;
    }
    switch_to(next);
    local.thread.parker.park();
}

/// Yield iff some runnable thread now outranks the current one.
pub(crate) fn yield_if_higher() {
    if crate::interrupt::in_handler() {
        return;
    }
    let local = cpu_local();
    let mine = local.thread.priority();
    if local
        .kernel
        .cpu
        .scheduler
        .max_priority()
        .map_or(false, |p| p > mine)
    {
        yield_now();
    }
}

/// Recompute effective priorities along a chain of lock holders.
///
/// Starting from `th`, refresh `effective = max(base, max donor effective)`
/// and follow `blocked_on -> holder` links so a donation propagates through
/// nested lock waits. The recursion depth is bounded by the chain length.
pub(crate) fn refresh_priority_chain(mut th: Arc<Thread>) {
    loop {
        let mut sched = th.sched.lock();
        let mut priority = sched.base_priority;
        for donor in &sched.donors {
            let donor_sched = donor.sched.lock();
            priority = priority.max(donor_sched.priority);
            donor_sched.unlock();
        }
        sched.priority = priority;
        let next = sched
            .blocked_on
            .as_ref()
            .and_then(|lock| lock.holder_thread());
        sched.unlock();
        match next {
            Some(holder) if !Arc::ptr_eq(&holder, &th) => th = holder,
            _ => break,
        }
    }
}

/// A builder of a thread.
pub struct ThreadBuilder {
    name: String,
    priority: u32,
}

impl ThreadBuilder {
    /// Create a new builder with the given thread name.
    pub fn new(name: impl Into<String>) -> Self {
        ThreadBuilder {
            name: name.into(),
            priority: PRI_DEFAULT,
        }
    }

    /// Set the thread's base priority.
    pub fn priority(mut self, priority: u32) -> Self {
        assert!(priority <= PRI_MAX, "priority out of range");
        self.priority = priority;
        self
    }

    /// Spawn the thread.
    ///
    /// The new thread becomes runnable immediately; if it outranks the
    /// spawning thread, the spawner yields to it, so a freshly created
    /// high-priority thread runs before `spawn` returns.
    pub fn spawn<F>(self, f: F) -> JoinHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let kernel = current_kernel();
        let handle = spawn_on(&kernel, self.name, self.priority, f, false);
        yield_if_higher();
        handle
    }
}

/// An owned permission to join on a thread.
pub struct JoinHandle {
    thread: Arc<Thread>,
}

impl JoinHandle {
    /// The joined thread's id.
    pub fn tid(&self) -> u64 {
        self.thread.tid
    }

    /// The thread this handle refers to.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Wait for the thread to finish, returning its exit code.
    pub fn join(self) -> i32 {
        self.thread.exit_sema.down();
        // Leave the exit signal in place for other joiners.
        self.thread.exit_sema.up();
        let code = self.thread.exit_code.lock();
        let value = code.expect("joined thread has no exit code");
        code.unlock();
        value
    }
}

pub(crate) fn spawn_on<F>(
    kernel: &Arc<Kernel>,
    name: String,
    priority: u32,
    f: F,
    initial: bool,
) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    let th = Thread::new(name.clone(), priority);
    kernel.cpu.thread_started();
    let os_handle = std::thread::Builder::new()
        .name(name)
        .spawn({
            let th = th.clone();
            let kernel = kernel.clone();
            move || run_thread(kernel, th, f)
        })
        .expect("failed to spawn host thread");
    kernel.cpu.os_handles.lock().unwrap().push(os_handle);
    if initial {
        let mut sched = th.sched.lock();
        sched.state = ThreadState::Running;
        sched.unlock();
        th.parker.unpark();
    } else {
        kernel.cpu.scheduler.push_to_queue(th.clone());
    }
    JoinHandle { thread: th }
}

fn run_thread<F>(kernel: Arc<Kernel>, th: Arc<Thread>, f: F)
where
    F: FnOnce() + Send + 'static,
{
    CPU_LOCAL.with(|local| {
        *local.borrow_mut() = Some(CpuLocal {
            thread: th.clone(),
            kernel: kernel.clone(),
        })
    });
    th.parker.park();
    let result = catch_unwind(AssertUnwindSafe(|| {
        f();
        exit_current(&kernel, &th, 0);
    }));
    if let Err(payload) = result {
        kernel.cpu.abort(payload);
    }
    CPU_LOCAL.with(|local| *local.borrow_mut() = None);
}

fn exit_current(kernel: &Arc<Kernel>, th: &Arc<Thread>, code: i32) {
    let mut exit_code = th.exit_code.lock();
    *exit_code = Some(code);
    exit_code.unlock();
    // Wake joiners first: `up` may hand the processor to one of them and
    // come back here before the thread is torn down.
    th.exit_sema.up();
    let mut sched = th.sched.lock();
    sched.state = ThreadState::Exited(code);
    sched.unlock();
    let remaining = kernel.cpu.thread_finished();
    match kernel.cpu.scheduler.next_to_run() {
        Some(next) => switch_to(next),
        None => {
            if remaining != 0 {
                panic!(
                    "deadlock: \"{}\" exited leaving {} blocked thread(s)",
                    th.name, remaining
                );
            }
        }
    }
}
