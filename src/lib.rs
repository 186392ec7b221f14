//! # Keel: a teaching kernel's virtual-memory core.
//!
//! Keel implements the memory heart of an instructional operating system:
//! demand paging over three backings (zero-fill, file, swap), a frame
//! table that evicts under pressure with a second-chance sweep, a swap
//! area, a write-back buffer cache over the filesystem device, and the
//! blocking synchronization primitives (semaphore, priority-donating
//! lock, condition variable, reader/writer lock) that make all of it
//! safe under preemption.
//!
//! The hardware collaborators are deterministic simulations carrying the
//! contracts the core needs: a software MMU per address space, in-memory
//! sector devices, and kernel threads serialized onto a single logical
//! processor with priority scheduling. That is what lets every paging and
//! locking scenario run, and reproduce exactly, under `cargo test`.
//!
//! ## Bring-up
//!
//! All kernel state lives in a [`Kernel`] context built once by
//! [`KernelBuilder`] and reached by handle; there are no process-global
//! statics. [`Kernel::launch`] boots the processor, runs the supplied
//! entry closure as the initial thread, flushes the buffer cache at halt,
//! and waits for every thread to finish.
//!
//! ```no_run
//! use keel::{KernelBuilder, addressing::Va, mm::pager::AddressSpace};
//!
//! let kernel = KernelBuilder::new().user_frames(2).build();
//! kernel.launch({
//!     let kernel = kernel.clone();
//!     move || {
//!         let space = AddressSpace::new(&kernel);
//!         space.install_anonymous(Va::new(0x0804_0000));
//!         space.write_user(Va::new(0x0804_0000), b"hello").unwrap();
//!     }
//! });
//! ```

pub mod addressing;
pub mod fs;
pub mod interrupt;
pub mod mm;
pub mod sync;
pub mod thread;

use crate::fs::{buffer_cache::BufferCache, Disk, MemDisk};
use crate::mm::{frame::FrameTable, swap::SwapArea};
use std::sync::Arc;
use crate::thread::scheduler::{PriorityScheduler, Scheduler};

pub use crate::addressing::{Pa, Va};

/// Enum representing errors that can occur during a kernel operation.
///
/// Only recoverable conditions are represented here; violated kernel
/// invariants panic instead (see the failure model of each module).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// IO Error. (EIO)
    IOError,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] into the corresponding negated errno
    /// value, cast to `usize` for use as a raw return value.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::IOError => -5isize,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

/// The process-wide VM context.
///
/// Owns the frame table, the swap area, and the buffer cache, together
/// with the (simulated) processor they run on. Subsystems reach each
/// other through this handle; address spaces keep an `Arc` to it.
pub struct Kernel {
    me: std::sync::Weak<Kernel>,
    pub(crate) cpu: thread::Cpu,
    /// Owner of all user physical frames.
    pub frames: FrameTable,
    /// Backing store for evicted anonymous pages.
    pub swap: SwapArea,
    /// Write-back cache over the filesystem device.
    pub cache: Arc<BufferCache>,
}

/// A builder for a [`Kernel`].
///
/// Configures the machine the kernel runs on: how many user frames of
/// physical memory, which devices back the swap area and the filesystem,
/// and the scheduling policy.
pub struct KernelBuilder {
    user_frames: usize,
    swap_disk: Option<Disk>,
    fs_disk: Option<Disk>,
    scheduler: Option<Box<dyn Scheduler>>,
}

impl KernelBuilder {
    /// Start from the defaults: 64 user frames, fresh in-memory swap and
    /// filesystem devices, priority scheduling.
    pub fn new() -> Self {
        KernelBuilder {
            user_frames: 64,
            swap_disk: None,
            fs_disk: None,
            scheduler: None,
        }
    }

    /// Number of user frames of physical memory.
    pub fn user_frames(mut self, frames: usize) -> Self {
        self.user_frames = frames;
        self
    }

    /// Device backing the swap area.
    pub fn swap_disk(mut self, disk: Disk) -> Self {
        self.swap_disk = Some(disk);
        self
    }

    /// Device backing the filesystem (behind the buffer cache).
    pub fn fs_disk(mut self, disk: Disk) -> Self {
        self.fs_disk = Some(disk);
        self
    }

    /// Replace the default priority scheduler.
    pub fn scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    /// Build the kernel context.
    pub fn build(self) -> Arc<Kernel> {
        let swap_disk = self
            .swap_disk
            .unwrap_or_else(|| Disk::new(MemDisk::new(1024)));
        let fs_disk = self
            .fs_disk
            .unwrap_or_else(|| Disk::new(MemDisk::new(2048)));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Box::new(PriorityScheduler::new()));
        log::info!("mem: {} user frames", self.user_frames);
        Arc::new_cyclic(|me| Kernel {
            me: me.clone(),
            cpu: thread::Cpu::new(scheduler),
            frames: FrameTable::new(self.user_frames),
            swap: SwapArea::new(swap_disk),
            cache: Arc::new(BufferCache::new(fs_disk)),
        })
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Boot the kernel and run `main` as the initial thread.
    ///
    /// Returns once every thread has finished. The buffer cache is
    /// flushed after `main` returns, so the filesystem device is
    /// consistent at halt. A panic on any kernel thread is resurfaced
    /// here on the caller.
    pub fn launch<F>(&self, main: F) -> i32
    where
        F: FnOnce() + Send + 'static,
    {
        let kernel = self.me.upgrade().expect("kernel context vanished");
        let halt_kernel = kernel.clone();
        let handle = thread::spawn_on(
            &kernel,
            "main".into(),
            thread::PRI_DEFAULT,
            move || {
                main();
                if let Err(e) = halt_kernel.cache.flush() {
                    log::warn!("cache flush at halt failed: {:?}", e);
                }
            },
            true,
        );
        self.cpu.wait_halt();
        let code = handle.thread().exit_code.lock();
        let value = code.unwrap_or(0);
        code.unlock();
        value
    }
}

/// The kernel the current thread is running on.
///
/// Only callable from a kernel thread (inside [`Kernel::launch`]).
pub fn kernel() -> Arc<Kernel> {
    thread::current_kernel()
}
