//! Synchronization primitive scenarios.

use keel::{
    interrupt,
    sync::{Condvar, Lock, Mutex, RwLock, Semaphore, SpinLock},
    thread::{self, ThreadBuilder},
    KernelBuilder,
};
use std::sync::Arc;

type EventLog = Arc<SpinLock<Vec<String>>>;

fn record(events: &EventLog, what: &str) {
    let mut guard = events.lock();
    guard.push(what.to_string());
    guard.unlock();
}

fn recorded(events: &EventLog) -> Vec<String> {
    let guard = events.lock();
    let out = guard.clone();
    guard.unlock();
    out
}

// Control "ping-pongs" between a pair of threads through two semaphores.
#[test]
fn semaphore_ping_pong() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let ours = Arc::new(Semaphore::new(0));
        let theirs = Arc::new(Semaphore::new(0));
        let counter = Arc::new(SpinLock::new(0));
        let helper = {
            let ours = ours.clone();
            let theirs = theirs.clone();
            let counter = counter.clone();
            ThreadBuilder::new("ping-pong").spawn(move || {
                for _ in 0..10 {
                    ours.down();
                    let mut guard = counter.lock();
                    *guard += 1;
                    guard.unlock();
                    theirs.up();
                }
            })
        };
        for _ in 0..10 {
            ours.up();
            theirs.down();
        }
        helper.join();
        let guard = counter.lock();
        assert_eq!(*guard, 10);
        guard.unlock();
    });
}

#[test]
fn try_down_never_blocks() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let sema = Semaphore::new(1);
        assert!(sema.try_down());
        assert!(!sema.try_down());
        sema.up();
        assert!(sema.try_down());
    });
}

// `up` releases waiters in effective-priority order.
#[test]
fn up_wakes_highest_priority_waiter() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let target = Arc::new(Semaphore::new(0));
        let events: EventLog = Arc::new(SpinLock::new(Vec::new()));
        let mut handles = Vec::new();
        for priority in [40u32, 60, 50] {
            let target = target.clone();
            let events = events.clone();
            // Higher priority than the spawner, so each waiter reaches
            // its `down` before the next is created.
            handles.push(
                ThreadBuilder::new(format!("waiter-{}", priority))
                    .priority(priority)
                    .spawn(move || {
                        target.down();
                        record(&events, &format!("woke-{}", priority));
                    }),
            );
        }
        for _ in 0..3 {
            target.up();
        }
        for handle in handles {
            handle.join();
        }
        assert_eq!(recorded(&events), ["woke-60", "woke-50", "woke-40"]);
    });
}

// While H waits on a lock held by L, L runs at H's priority; when L
// releases, its priority drops back and H runs next.
#[test]
fn donated_priority_round_trip() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let events: EventLog = Arc::new(SpinLock::new(Vec::new()));
        let low = {
            let events = events.clone();
            ThreadBuilder::new("L").priority(10).spawn(move || {
                let lock = Arc::new(Lock::new());
                lock.acquire();
                let high = {
                    let lock = lock.clone();
                    let events = events.clone();
                    ThreadBuilder::new("H").priority(50).spawn(move || {
                        lock.acquire();
                        record(&events, "H got lock");
                        lock.release();
                    })
                };
                // H blocked on the lock, so we run with its priority.
                assert_eq!(thread::current().priority(), 50);
                assert_eq!(thread::current().base_priority(), 10);
                record(&events, "L releasing");
                lock.release();
                record(&events, "L after release");
                assert_eq!(thread::current().priority(), 10);
                high.join();
            })
        };
        low.join();
        assert_eq!(
            recorded(&events),
            ["L releasing", "H got lock", "L after release"]
        );
    });
}

// Donation propagates through a chain of lock holders.
#[test]
fn donation_is_transitive() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let k1 = Arc::new(Lock::new());
        let k2 = Arc::new(Lock::new());
        let a = {
            let k1 = k1.clone();
            let k2 = k2.clone();
            ThreadBuilder::new("A").priority(10).spawn(move || {
                k1.acquire();
                let b = {
                    let k1 = k1.clone();
                    let k2 = k2.clone();
                    ThreadBuilder::new("B").priority(20).spawn(move || {
                        k2.acquire();
                        k1.acquire(); // blocks on A
                        k1.release();
                        k2.release();
                    })
                };
                // B (20) waits on k1.
                assert_eq!(thread::current().priority(), 20);
                let c = {
                    let k2 = k2.clone();
                    ThreadBuilder::new("C").priority(50).spawn(move || {
                        k2.acquire(); // blocks on B, which blocks on A
                        k2.release();
                    })
                };
                // C (50) donates to B, and through B's wait to us.
                assert_eq!(thread::current().priority(), 50);
                k1.release();
                assert_eq!(thread::current().priority(), 10);
                b.join();
                c.join();
            })
        };
        a.join();
    });
}

#[test]
#[should_panic(expected = "reacquired a lock it already holds")]
fn lock_is_not_recursive() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let lock = Lock::new();
        lock.acquire();
        lock.acquire();
    });
}

#[test]
#[should_panic(expected = "released an unheld lock")]
fn release_of_unheld_lock_panics() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let lock = Lock::new();
        lock.release();
    });
}

#[test]
fn try_acquire_does_not_donate() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let lock = Arc::new(Lock::new());
        lock.acquire();
        let prober = {
            let lock = lock.clone();
            ThreadBuilder::new("prober").priority(55).spawn(move || {
                assert!(!lock.try_acquire());
            })
        };
        prober.join();
        // The probe failed without blocking, so nothing was donated.
        assert_eq!(thread::current().priority(), thread::PRI_DEFAULT);
        lock.release();
    });
}

// Mesa semantics: the waiter re-checks its predicate, and the state is
// handed over under the mutex.
#[test]
fn condvar_producer_consumer() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let queue = Arc::new(Mutex::new(Vec::<u32>::new()));
        let nonempty = Arc::new(Condvar::new());
        let consumer = {
            let queue = queue.clone();
            let nonempty = nonempty.clone();
            ThreadBuilder::new("consumer").priority(45).spawn(move || {
                let mut taken = Vec::new();
                while taken.len() < 3 {
                    let mut guard = nonempty.wait_while(&queue, |q| q.is_empty());
                    taken.push(guard.remove(0));
                    guard.unlock();
                }
                assert_eq!(taken, [7, 8, 9]);
            })
        };
        for item in [7u32, 8, 9] {
            let mut guard = queue.lock();
            guard.push(item);
            assert!(nonempty.signal(&guard));
            guard.unlock();
        }
        consumer.join();
    });
}

#[test]
fn condvar_signal_without_waiters_reports_false() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let state = Mutex::new(());
        let cond = Condvar::new();
        let guard = state.lock();
        assert!(!cond.signal(&guard));
        assert!(!cond.broadcast(&guard));
        guard.unlock();
    });
}

#[test]
fn condvar_broadcast_wakes_every_waiter() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let ready = Arc::new(Mutex::new(false));
        let flip = Arc::new(Condvar::new());
        let mut handles = Vec::new();
        for i in 0..4u32 {
            let ready = ready.clone();
            let flip = flip.clone();
            handles.push(
                ThreadBuilder::new(format!("waiter-{}", i))
                    .priority(40 + i)
                    .spawn(move || {
                        let guard = flip.wait_while(&ready, |ready| !*ready);
                        guard.unlock();
                    }),
            );
        }
        let mut guard = ready.lock();
        *guard = true;
        assert!(flip.broadcast(&guard));
        guard.unlock();
        for handle in handles {
            handle.join();
        }
    });
}

// Never a writer and a reader at once; a waiting writer gets
// the lock as soon as the last reader leaves.
#[test]
fn rwlock_excludes_writer_while_read() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let rw = Arc::new(RwLock::new(0u32));
        let events: EventLog = Arc::new(SpinLock::new(Vec::new()));
        let reader = rw.read();
        let writer = {
            let rw = rw.clone();
            let events = events.clone();
            ThreadBuilder::new("writer").priority(50).spawn(move || {
                record(&events, "writer waiting");
                let mut guard = rw.write();
                *guard = 1;
                record(&events, "writer active");
                guard.unlock();
            })
        };
        // The writer (higher priority) already tried and blocked.
        assert_eq!(rw.reader_count(), 1);
        assert!(!rw.writer_active());
        record(&events, "reader releasing");
        reader.unlock();
        writer.join();
        assert_eq!(
            recorded(&events),
            ["writer waiting", "reader releasing", "writer active"]
        );
        let check = rw.read();
        assert_eq!(*check, 1);
        check.unlock();
    });
}

#[test]
fn rwlock_write_release_lets_readers_in_together() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let rw = Arc::new(RwLock::new(0u32));
        let hold = Arc::new(Semaphore::new(0));
        let events: EventLog = Arc::new(SpinLock::new(Vec::new()));
        let writer = {
            let rw = rw.clone();
            let hold = hold.clone();
            ThreadBuilder::new("writer").priority(50).spawn(move || {
                let mut guard = rw.write();
                *guard = 42;
                hold.down();
                guard.unlock();
            })
        };
        let mut readers = Vec::new();
        for i in 0..2u32 {
            let rw = rw.clone();
            let events = events.clone();
            readers.push(
                ThreadBuilder::new(format!("reader-{}", i))
                    .priority(40 + i)
                    .spawn(move || {
                        let guard = rw.read();
                        record(&events, &format!("reader-{} in", i));
                        assert_eq!(*guard, 42);
                        guard.unlock();
                    }),
            );
        }
        assert!(rw.writer_active());
        assert_eq!(rw.reader_count(), 0);
        hold.up();
        writer.join();
        for reader in readers {
            reader.join();
        }
        // Both readers were released by the write-side broadcast,
        // highest priority first.
        assert_eq!(recorded(&events), ["reader-1 in", "reader-0 in"]);
        assert!(!rw.writer_active());
        assert_eq!(rw.reader_count(), 0);
    });
}

// An `up` from interrupt context wakes but must not yield.
#[test]
fn up_in_interrupt_context_defers_the_switch() {
    let kernel = KernelBuilder::new().build();
    kernel.launch(|| {
        let target = Arc::new(Semaphore::new(0));
        let events: EventLog = Arc::new(SpinLock::new(Vec::new()));
        let high = {
            let target = target.clone();
            let events = events.clone();
            ThreadBuilder::new("H").priority(60).spawn(move || {
                target.down();
                record(&events, "H resumed");
            })
        };
        interrupt::dispatch_as_handler(|| {
            target.up();
            // H (priority 60) is runnable but we keep the processor.
            record(&events, "handler finished");
        });
        record(&events, "main after handler");
        high.join();
        assert_eq!(
            recorded(&events),
            ["handler finished", "main after handler", "H resumed"]
        );
    });
}
