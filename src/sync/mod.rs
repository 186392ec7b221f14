//! Synchronization primitives.
//!
//! Two families live here. The [`SpinLock`] masks interrupts and never
//! sleeps; it protects the short critical sections inside the kernel
//! itself, including the blocking primitives' own state. Everything else,
//! [`Semaphore`], the priority-donating [`Lock`]/[`Mutex`], [`Condvar`],
//! and [`RwLock`], puts the caller to sleep, so those may only be used
//! from thread context and are the suspension points the memory and
//! filesystem layers rely on.

pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;

pub use self::condvar::Condvar;
pub use self::mutex::{Lock, Mutex, MutexGuard};
pub use self::rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use self::semaphore::Semaphore;
pub use self::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
