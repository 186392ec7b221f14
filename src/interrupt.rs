//! Interrupt management.
//!
//! The kernel models a single processor with interrupt-driven preemption.
//! Any shared state that an interrupt handler could observe must only be
//! mutated inside a critical section delimited by an [`InterruptGuard`];
//! every [`SpinLock`](crate::sync::SpinLock) acquisition takes one
//! implicitly.
//!
//! The guard nests: interrupts are re-enabled only when the outermost guard
//! is dropped.

use core::cell::Cell;

std::thread_local! {
    static MASK_DEPTH: Cell<usize> = const { Cell::new(0) };
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard that masks interrupts on the executing processor.
///
/// Creating the guard disables interrupts; dropping it restores the previous
/// level. Guards may nest.
pub struct InterruptGuard {
    _priv: (),
}

impl InterruptGuard {
    /// Disable interrupts, returning a guard that restores the previous
    /// level when dropped.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        MASK_DEPTH.with(|d| d.set(d.get() + 1));
        InterruptGuard { _priv: () }
    }

    /// Whether the executing processor currently has interrupts masked.
    pub fn is_guarded() -> bool {
        MASK_DEPTH.with(|d| d.get()) != 0
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        MASK_DEPTH.with(|d| {
            debug_assert_ne!(d.get(), 0);
            d.set(d.get() - 1)
        });
    }
}

/// Whether the processor is executing an external interrupt handler.
///
/// Blocking primitives must not be entered from a handler; `Semaphore::up`
/// consults this to decide whether waking a higher-priority thread should
/// also yield the processor.
pub fn in_handler() -> bool {
    IN_HANDLER.with(|h| h.get())
}

/// Run `f` as if it were an external interrupt handler.
///
/// Interrupt dispatch itself is outside this crate; this entry point exists
/// so handler-context rules (no blocking, no yield-on-wake) can be
/// exercised.
pub fn dispatch_as_handler<R>(f: impl FnOnce() -> R) -> R {
    IN_HANDLER.with(|h| {
        assert!(!h.get(), "nested interrupt dispatch");
        h.set(true)
    });
    let r = f();
    IN_HANDLER.with(|h| h.set(false));
    r
}
