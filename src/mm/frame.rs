//! Frame table.
//!
//! The frame table owns every user-dedicated physical frame. A frame is
//! either free, or allocated to exactly one loaded page of some address
//! space; allocated, unpinned frames sit in a FIFO **eviction queue** that
//! the second-chance sweep walks when memory runs out.
//!
//! Second-chance (clock) eviction repeatedly examines the queue head:
//! pinned frames are moved to the tail and skipped; frames whose mapping
//! was recently accessed have the accessed bit cleared and are moved to
//! the tail (their second chance); the first remaining frame is the
//! victim. Because every reprieve clears the accessed bit, each frame can
//! be reprieved at most once per sweep and selection always terminates.
//!
//! `allocate` never reports failure: when no frame is free it blocks in
//! eviction (possibly on swap or filesystem I/O) until one is.

use super::{pager::AddressSpace, FrameRef, PhysMem};
use crate::{
    addressing::{Pa, Va, PAGE_SIZE},
    sync::SpinLock,
};
use std::{
    collections::VecDeque,
    sync::Weak,
};

// Base physical address of the user frame pool.
const DRAM_BASE: usize = 0x4000_0000;

bitflags::bitflags! {
    /// Frame allocation flags.
    pub struct AllocFlags: u32 {
        /// Return the frame zero-filled.
        const ZEROED = 1 << 0;
    }
}

// The user page an allocated frame currently backs.
#[derive(Clone)]
struct Mapping {
    space: Weak<AddressSpace>,
    va: Va,
}

struct FrameInfo {
    mapped_to: Option<Mapping>,
    pinned: bool,
}

struct FrameTableInner {
    frames: Vec<FrameInfo>,
    // Indices of allocated frames in eviction (FIFO) order.
    queue: VecDeque<usize>,
    free: Vec<usize>,
}

/// Owner of all user physical frames.
pub struct FrameTable {
    mem: PhysMem,
    inner: SpinLock<FrameTableInner>,
}

impl FrameTable {
    /// Create a frame table owning `user_frames` frames of physical
    /// memory.
    pub fn new(user_frames: usize) -> Self {
        let mut frames = Vec::with_capacity(user_frames);
        for _ in 0..user_frames {
            frames.push(FrameInfo {
                mapped_to: None,
                pinned: false,
            });
        }
        FrameTable {
            mem: PhysMem::new(user_frames),
            inner: SpinLock::new(FrameTableInner {
                frames,
                queue: VecDeque::new(),
                free: (0..user_frames).rev().collect(),
            }),
        }
    }

    fn idx_to_pa(idx: usize) -> Pa {
        Pa::new(DRAM_BASE + (idx * PAGE_SIZE))
    }

    fn pa_to_idx(&self, pa: Pa) -> usize {
        assert!(pa.is_page_aligned());
        let idx = (pa.into_usize() - DRAM_BASE) / PAGE_SIZE;
        assert!(idx < self.mem.frames, "physical address out of range");
        idx
    }

    /// Allocate a frame for the page `va` of `owner`.
    ///
    /// On exhaustion, runs second-chance eviction, which may block on
    /// swap or filesystem I/O, until a frame is free. The returned frame
    /// is **pinned**; the caller unpins it once the page is installed in
    /// the MMU, so an in-flight fault can never race eviction.
    pub fn allocate(&self, owner: Weak<AddressSpace>, va: Va, flags: AllocFlags) -> Pa {
        assert!(va.is_page_aligned());
        let mut futile_sweeps = 0;
        loop {
            let mut inner = self.inner.lock();
            if let Some(idx) = inner.free.pop() {
                inner.frames[idx] = FrameInfo {
                    mapped_to: Some(Mapping {
                        space: owner.clone(),
                        va,
                    }),
                    pinned: true,
                };
                inner.queue.push_back(idx);
                inner.unlock();
                if flags.contains(AllocFlags::ZEROED) {
                    unsafe {
                        core::ptr::write_bytes(self.mem.frame_ptr(idx), 0, PAGE_SIZE);
                    }
                }
                return Self::idx_to_pa(idx);
            }
            let victim = Self::choose_victim(&mut inner);
            inner.unlock();
            let Some((idx, mapping)) = victim else {
                // Every frame is pinned right now; the pinners are other
                // threads mid-fault or mid-eviction, so give them the
                // processor and retry.
                futile_sweeps += 1;
                assert!(
                    futile_sweeps < 10_000,
                    "no evictable frame: all user frames stayed pinned"
                );
                crate::thread::yield_now();
                continue;
            };
            futile_sweeps = 0;
            match mapping.space.upgrade() {
                Some(space) => {
                    log::debug!("evicting frame {} backing {:?}", idx, mapping.va);
                    match space.evict_page(mapping.va) {
                        Some(pa) => {
                            assert_eq!(pa, Self::idx_to_pa(idx), "evicted page moved frames");
                            let mut inner = self.inner.lock();
                            inner.frames[idx] = FrameInfo {
                                mapped_to: None,
                                pinned: false,
                            };
                            inner.free.push(idx);
                            inner.unlock();
                        }
                        // The owner released the page while we waited for
                        // its table lock and freed the frame itself.
                        None => continue,
                    }
                }
                None => {
                    // The owning address space is mid-teardown; it will
                    // free this frame itself. Give it the processor.
                    let mut inner = self.inner.lock();
                    if inner.frames[idx].mapped_to.is_some() {
                        inner.frames[idx].pinned = false;
                        inner.queue.push_back(idx);
                    }
                    inner.unlock();
                    crate::thread::yield_now();
                }
            }
        }
    }

    // Second-chance selection. Removes the victim from the queue and pins
    // it so no concurrent sweep can choose it again; the caller completes
    // the eviction.
    fn choose_victim(inner: &mut FrameTableInner) -> Option<(usize, Mapping)> {
        let mut budget = inner.queue.len() * 2;
        while budget > 0 {
            budget -= 1;
            let idx = inner.queue.pop_front()?;
            if inner.frames[idx].pinned {
                inner.queue.push_back(idx);
                continue;
            }
            let mapping = inner.frames[idx]
                .mapped_to
                .clone()
                .expect("queued frame must be mapped");
            let accessed = match mapping.space.upgrade() {
                Some(space) => {
                    let accessed = space.page_table.is_accessed(mapping.va);
                    if accessed {
                        space.page_table.set_accessed(mapping.va, false);
                    }
                    accessed
                }
                // A dying address space no longer accesses its pages.
                None => false,
            };
            if accessed {
                inner.queue.push_back(idx);
            } else {
                inner.frames[idx].pinned = true;
                return Some((idx, mapping));
            }
        }
        None
    }

    /// Return the frame at `pa` to the free pool.
    pub fn free(&self, pa: Pa) {
        let idx = self.pa_to_idx(pa);
        let mut inner = self.inner.lock();
        assert!(
            inner.frames[idx].mapped_to.is_some(),
            "freeing a frame that is not allocated"
        );
        inner.frames[idx] = FrameInfo {
            mapped_to: None,
            pinned: false,
        };
        inner.queue.retain(|&i| i != idx);
        inner.free.push(idx);
        inner.unlock();
    }

    /// Pin the frame at `pa`: eviction will skip it until it is unpinned.
    pub fn pin(&self, pa: Pa) {
        let idx = self.pa_to_idx(pa);
        let mut inner = self.inner.lock();
        inner.frames[idx].pinned = true;
        inner.unlock();
    }

    /// Unpin the frame at `pa`.
    pub fn unpin(&self, pa: Pa) {
        let idx = self.pa_to_idx(pa);
        let mut inner = self.inner.lock();
        inner.frames[idx].pinned = false;
        inner.unlock();
    }

    /// Kernel alias of the frame at `pa`.
    ///
    /// # Safety
    ///
    /// The caller must own the frame (it allocated it and has not yet
    /// installed it, it holds it pinned, or it is the unique loaded page
    /// owner); otherwise the returned bytes may alias a concurrent user.
    pub(crate) unsafe fn frame(&self, pa: Pa) -> FrameRef<'_> {
        let idx = self.pa_to_idx(pa);
        FrameRef::new(self.mem.frame_ptr(idx))
    }

    /// Number of frames currently free. Test instrumentation.
    pub fn free_frames(&self) -> usize {
        let inner = self.inner.lock();
        let n = inner.free.len();
        inner.unlock();
        n
    }

    /// Total number of user frames.
    pub fn user_frames(&self) -> usize {
        self.mem.frames
    }

    /// The user page the frame at `pa` currently backs, if any. Test
    /// instrumentation.
    pub fn mapping_of(&self, pa: Pa) -> Option<Va> {
        let idx = self.pa_to_idx(pa);
        let inner = self.inner.lock();
        let va = inner.frames[idx].mapped_to.as_ref().map(|m| m.va);
        inner.unlock();
        va
    }
}
