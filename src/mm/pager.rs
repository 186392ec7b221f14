//! Supplemental page table.
//!
//! Each [`AddressSpace`] maps page-aligned virtual addresses to a
//! [`PageInfo`] describing how to materialize the page on a fault and what
//! to do with it on eviction. A page moves through three states:
//!
//! - **Uninitialized**: never loaded. The first fault uses the page's
//!   *init method*: zero-fill, or read from a backing file (with any
//!   remainder of the page zeroed).
//! - **Loaded**: currently backed by a physical frame and installed in
//!   the MMU.
//! - **Evicted**: was loaded, then pushed out. A later fault uses the
//!   *restore method*: read back from the swap slot recorded at eviction,
//!   or re-read from the backing file.
//!
//! The restore method also dictates the eviction writer: swap-restored
//! pages are written to a fresh swap slot (unless marked for discard
//! during teardown), while file-restored pages are written back to the
//! file only when they are writable and the MMU reports them dirty;
//! read-only mappings are simply dropped and re-read later.
//!
//! Segment pages (`install_segment`) initialize from the executable but
//! restore from swap, so a dirtied segment page never corrupts its file.
//! Mapped files (`install_file_mapping`) initialize *and* restore from
//! the file; their entries are chained head-to-tail so the whole mapping
//! can be torn down from its first page. Every installed page holds its
//! own reopened file handle, closed when the page is uninstalled.
//!
//! The module also provides [`read_user`]/[`write_user`], which model the
//! processor's user-mode accesses: translate through the MMU, maintain
//! accessed/dirty bits, and fault missing pages in on demand.
//!
//! [`read_user`]: AddressSpace::read_user
//! [`write_user`]: AddressSpace::write_user

use super::{
    frame::AllocFlags,
    page_table::{PageTable, PteFlags},
    swap::SwapSlot,
};
use crate::{
    addressing::{Pa, Va, PAGE_SIZE},
    fs::RegularFile,
    sync::Mutex,
    Kernel, KernelError,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

/// How a page obtains its very first contents.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum InitMethod {
    /// All bytes zero.
    ZeroFill,
    /// Read from the backing file.
    FromFile,
}

/// How a page is brought back after an eviction.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum RestoreMethod {
    /// From the swap slot written at eviction.
    Swap,
    /// By re-reading the backing file.
    File,
}

/// Externally visible state of a supplemental entry. Test
/// instrumentation.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PageStatus {
    /// Never loaded.
    Uninitialized,
    /// Resident in a frame.
    Loaded,
    /// Pushed out to its backing store.
    Evicted,
}

// File-backed portion of a page.
struct FileBacking {
    file: RegularFile,
    offset: usize,
    // Bytes of the page that come from the file; the rest is zeroed.
    bytes: usize,
    // Next page of the same mapped file, toward increasing offsets.
    next: Option<Va>,
}

// What currently backs the page's contents. Only the variant matching
// the entry's state and methods is ever present.
enum Backing {
    None,
    Swap(SwapSlot),
    File(FileBacking),
}

enum PageState {
    Uninitialized,
    Loaded(Pa),
    Evicted,
}

/// A supplemental page entry.
pub struct PageInfo {
    state: PageState,
    init: InitMethod,
    restore: RestoreMethod,
    writable: bool,
    backing: Backing,
    // Set while tearing down an anonymous page: eviction skips the swap
    // write and just surrenders the frame.
    discard_on_evict: bool,
}

impl PageInfo {
    fn file_backing(&self) -> &FileBacking {
        match &self.backing {
            Backing::File(fb) => fb,
            _ => panic!("page has no file backing"),
        }
    }

    fn take_swap_slot(&mut self) -> SwapSlot {
        match core::mem::replace(&mut self.backing, Backing::None) {
            Backing::Swap(slot) => slot,
            _ => panic!("page has no swap slot"),
        }
    }
}

// What a fault must do once the frame is in hand. Extracted under the
// table lock, executed outside it.
enum LoadPlan {
    Zero,
    Read {
        file: RegularFile,
        offset: usize,
        bytes: usize,
    },
    SwapIn(SwapSlot),
}

/// One user address space: its hardware page table plus the supplemental
/// entries that drive demand paging.
///
/// Dropping the address space tears down every remaining page
/// ([`uninstall_all`]).
///
/// [`uninstall_all`]: Self::uninstall_all
pub struct AddressSpace {
    kernel: Arc<Kernel>,
    // Self-handle recorded as the owner of the frames backing loaded
    // pages, so the frame table's eviction sweep can find its way back.
    me: Weak<AddressSpace>,
    /// The MMU mapping state for this address space.
    pub page_table: PageTable,
    supp: Mutex<BTreeMap<Va, PageInfo>>,
}

impl AddressSpace {
    /// Create an empty address space on `kernel`.
    pub fn new(kernel: &Arc<Kernel>) -> Arc<Self> {
        Arc::new_cyclic(|me| AddressSpace {
            kernel: kernel.clone(),
            me: me.clone(),
            page_table: PageTable::new(),
            supp: Mutex::new(BTreeMap::new()),
        })
    }

    /// Register the pages of an executable segment.
    ///
    /// Consecutive pages starting at `va` cover `read_bytes` bytes of
    /// `file` from `offset` followed by `zero_bytes` zero bytes. Pages
    /// initialize from the file but restore from swap: a dirtied segment
    /// page is never written back to the executable.
    pub fn install_segment(
        &self,
        file: &RegularFile,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        va: Va,
    ) {
        assert!(va.is_page_aligned());
        let pages = (read_bytes + zero_bytes).div_ceil(PAGE_SIZE);
        let mut supp = self.supp.lock();
        for i in 0..pages {
            let page_va = va + i * PAGE_SIZE;
            let consumed = i * PAGE_SIZE;
            let bytes = read_bytes.saturating_sub(consumed).min(PAGE_SIZE);
            let prev = supp.insert(
                page_va,
                PageInfo {
                    state: PageState::Uninitialized,
                    init: InitMethod::FromFile,
                    restore: RestoreMethod::Swap,
                    writable,
                    backing: Backing::File(FileBacking {
                        file: file.reopen(),
                        offset: offset + consumed,
                        bytes,
                        next: None,
                    }),
                    discard_on_evict: false,
                },
            );
            assert!(prev.is_none(), "segment page {:?} already installed", page_va);
        }
        supp.unlock();
    }

    /// Register a whole-file mapping at `va`, one page per
    /// `ceil(file_length / PAGE_SIZE)`.
    ///
    /// Pages both initialize from and restore to the file; writable pages
    /// are written back on eviction iff dirty, read-only pages are
    /// discarded. The entries are chained from the head page so
    /// [`uninstall_file`] can unmap the whole file.
    ///
    /// [`uninstall_file`]: Self::uninstall_file
    pub fn install_file_mapping(&self, file: &RegularFile, writable: bool, va: Va) {
        assert!(va.is_page_aligned());
        let length = file.length();
        assert!(length > 0, "cannot map an empty file");
        let pages = length.div_ceil(PAGE_SIZE);
        let mut supp = self.supp.lock();
        let mut next = None;
        for i in (0..pages).rev() {
            let page_va = va + i * PAGE_SIZE;
            let offset = i * PAGE_SIZE;
            let prev = supp.insert(
                page_va,
                PageInfo {
                    state: PageState::Uninitialized,
                    init: InitMethod::FromFile,
                    restore: RestoreMethod::File,
                    writable,
                    backing: Backing::File(FileBacking {
                        file: file.reopen(),
                        offset,
                        bytes: (length - offset).min(PAGE_SIZE),
                        next,
                    }),
                    discard_on_evict: false,
                },
            );
            assert!(prev.is_none(), "mapped page {:?} already installed", page_va);
            next = Some(page_va);
        }
        supp.unlock();
    }

    /// Register one anonymous, zero-filled, swap-restored page at `va`.
    pub fn install_anonymous(&self, va: Va) {
        assert!(va.is_page_aligned());
        let mut supp = self.supp.lock();
        let prev = supp.insert(
            va,
            PageInfo {
                state: PageState::Uninitialized,
                init: InitMethod::ZeroFill,
                restore: RestoreMethod::Swap,
                writable: true,
                backing: Backing::None,
                discard_on_evict: false,
            },
        );
        assert!(prev.is_none(), "anonymous page {:?} already installed", va);
        supp.unlock();
    }

    /// Register an anonymous page at `va` and materialize it eagerly.
    ///
    /// Used for the initial user stack, which must be resident before the
    /// process first runs.
    pub fn install_and_load_anonymous(&self, va: Va) {
        self.install_anonymous(va);
        self.fault_in(va)
            .expect("eager load of an anonymous page cannot fail");
    }

    /// Handle a page fault at `va`.
    ///
    /// Rounds down to the containing page and materializes it according
    /// to its supplemental entry. Faults on addresses with no entry
    /// return [`KernelError::BadAddress`]; the caller owns any further
    /// policy (stack growth, user-pointer validation, termination).
    ///
    /// # Panics
    ///
    /// Panics on a fault for a page that is already loaded: the MMU holds
    /// a translation for it and could not have faulted.
    pub fn handle_fault(&self, va: Va) -> Result<(), KernelError> {
        self.fault_in(va.page_down())
    }

    fn fault_in(&self, va: Va) -> Result<(), KernelError> {
        let mut supp = self.supp.lock();
        let Some(entry) = supp.get_mut(&va) else {
            supp.unlock();
            return Err(KernelError::BadAddress);
        };
        let evicted = match entry.state {
            PageState::Loaded(_) => panic!("page fault on loaded page {:?}", va),
            PageState::Uninitialized => false,
            PageState::Evicted => true,
        };
        // Dispatch on (state, init method, restore method).
        let from_file = if evicted {
            matches!(entry.restore, RestoreMethod::File)
        } else {
            matches!(entry.init, InitMethod::FromFile)
        };
        let plan = if from_file {
            let fb = entry.file_backing();
            LoadPlan::Read {
                file: fb.file.reopen(),
                offset: fb.offset,
                bytes: fb.bytes,
            }
        } else if evicted {
            LoadPlan::SwapIn(entry.take_swap_slot())
        } else {
            LoadPlan::Zero
        };
        let writable = entry.writable;
        supp.unlock();

        // The frame comes back pinned, so eviction cannot take it while
        // we fill it below; it enters the eviction queue now but is
        // skipped until unpinned.
        let flags = match plan {
            LoadPlan::Zero => AllocFlags::ZEROED,
            _ => AllocFlags::empty(),
        };
        let pa = self.kernel.frames.allocate(self.me.clone(), va, flags);
        let filled = (|| -> Result<(), KernelError> {
            let mut frame = unsafe { self.kernel.frames.frame(pa) };
            match plan {
                LoadPlan::Zero => {}
                LoadPlan::Read {
                    file,
                    offset,
                    bytes,
                } => {
                    let buf = frame.inner_mut();
                    let read = file.read_at(&mut buf[..bytes], offset)?;
                    if read < bytes {
                        panic!(
                            "short read backing {:?}: got {} of {} bytes",
                            va, read, bytes
                        );
                    }
                    buf[bytes..].fill(0);
                }
                LoadPlan::SwapIn(slot) => {
                    self.kernel.swap.read_and_free(slot, frame.inner_mut());
                }
            }
            Ok(())
        })();
        if let Err(e) = filled {
            self.kernel.frames.free(pa);
            return Err(e);
        }

        let mut supp = self.supp.lock();
        let entry = supp.get_mut(&va).expect("entry vanished during fault");
        self.page_table
            .install_page(va, pa, writable)
            .expect("fault target already mapped in the MMU");
        entry.state = PageState::Loaded(pa);
        supp.unlock();
        self.kernel.frames.unpin(pa);
        Ok(())
    }

    /// Evict the loaded page at `va`, surrendering its frame.
    ///
    /// Invoked by the frame table once its second-chance sweep has chosen
    /// (and pinned) the victim. Writes the page out as its restore method
    /// dictates, removes the MMU translation, and returns the frame's
    /// address. Returns `None` when the owner released the page (and with
    /// it the frame) while the evictor was waiting for the table lock.
    pub(crate) fn evict_page(&self, va: Va) -> Option<Pa> {
        let mut supp = self.supp.lock();
        let Some(entry) = supp.get_mut(&va) else {
            supp.unlock();
            return None;
        };
        if !matches!(entry.state, PageState::Loaded(_)) {
            supp.unlock();
            return None;
        }
        let pa = self.evict_locked(va, entry);
        supp.unlock();
        Some(pa)
    }

    // Eviction body, shared with the teardown paths that already hold the
    // table lock.
    fn evict_locked(&self, va: Va, entry: &mut PageInfo) -> Pa {
        let pa = match entry.state {
            PageState::Loaded(pa) => pa,
            _ => panic!("evicting page {:?} that is not loaded", va),
        };
        match entry.restore {
            RestoreMethod::Swap => {
                if !entry.discard_on_evict {
                    let frame = unsafe { self.kernel.frames.frame(pa) };
                    let slot = self.kernel.swap.reserve_and_write(frame.inner());
                    entry.backing = Backing::Swap(slot);
                }
            }
            RestoreMethod::File => {
                // Write back only what was actually dirtied; read-only
                // mappings are never written.
                if entry.writable && self.page_table.is_dirty(va) {
                    let fb = entry.file_backing();
                    let frame = unsafe { self.kernel.frames.frame(pa) };
                    let written = fb
                        .file
                        .write_at(&frame.inner()[..fb.bytes], fb.offset)
                        .expect("file write-back failed");
                    assert_eq!(written, fb.bytes, "short write backing {:?}", va);
                }
            }
        }
        let unmapped = self.page_table.uninstall_page(va);
        debug_assert_eq!(unmapped, pa);
        entry.state = PageState::Evicted;
        pa
    }

    // Release one removed entry: flush or discard its residency, free its
    // frame and swap slot. Dropping the entry afterwards closes any
    // reopened file handle it held.
    fn release_entry(&self, va: Va, entry: &mut PageInfo) {
        if matches!(entry.state, PageState::Loaded(_)) {
            // Anonymous residency is discarded; file pages still flush
            // their dirty contents through the normal eviction writer.
            if matches!(entry.restore, RestoreMethod::Swap) {
                entry.discard_on_evict = true;
            }
            let pa = self.evict_locked(va, entry);
            self.kernel.frames.free(pa);
        } else if matches!(entry.state, PageState::Evicted) {
            if let Backing::Swap(slot) = entry.backing {
                self.kernel.swap.discard(slot);
                entry.backing = Backing::None;
            }
        }
    }

    /// Unmap a whole mapped file given its head page.
    ///
    /// Walks the entry chain built by [`install_file_mapping`]: loaded
    /// pages are evicted first (writing back dirty writable pages), then
    /// every entry is removed and its file handle closed.
    ///
    /// [`install_file_mapping`]: Self::install_file_mapping
    pub fn uninstall_file(&self, head: Va) {
        let mut supp = self.supp.lock();
        let mut cursor = Some(head);
        while let Some(va) = cursor {
            let mut entry = supp.remove(&va).expect("file mapping chain is broken");
            assert!(
                matches!(entry.restore, RestoreMethod::File),
                "page {:?} is not part of a file mapping",
                va
            );
            cursor = entry.file_backing().next;
            self.release_entry(va, &mut entry);
        }
        supp.unlock();
    }

    /// Remove the anonymous page at `va`.
    ///
    /// An evicted page's swap slot is discarded without a read; a loaded
    /// page surrenders its frame without a swap write.
    pub fn uninstall_anonymous(&self, va: Va) {
        let mut supp = self.supp.lock();
        let mut entry = supp.remove(&va).expect("uninstalling an unmapped page");
        assert!(
            matches!(entry.restore, RestoreMethod::Swap),
            "page {:?} is not anonymous",
            va
        );
        self.release_entry(va, &mut entry);
        supp.unlock();
    }

    /// Tear down every remaining page of the address space.
    ///
    /// Dirty writable file pages are written back; anonymous residency
    /// and swap slots are discarded. Runs automatically when the address
    /// space is dropped.
    pub fn uninstall_all(&self) {
        let mut supp = self.supp.lock();
        let entries = core::mem::take(&mut *supp);
        for (va, mut entry) in entries {
            self.release_entry(va, &mut entry);
        }
        supp.unlock();
    }

    /// Copy `data` into this address space at `va`, faulting pages in on
    /// demand, as a user-mode store would.
    ///
    /// # Errors
    ///
    /// [`KernelError::BadAddress`] when the range touches an uninstalled
    /// page; [`KernelError::InvalidAccess`] when it touches a read-only
    /// page.
    pub fn write_user(&self, va: Va, data: &[u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < data.len() {
            let addr = va + done;
            let page = addr.page_down();
            let offset = addr.page_offset();
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let pte = self.translate_or_fault(page)?;
            if !pte.flags.contains(PteFlags::WRITABLE) {
                return Err(KernelError::InvalidAccess);
            }
            self.page_table.mark_access(page, true);
            let mut frame = unsafe { self.kernel.frames.frame(pte.pa) };
            frame.inner_mut()[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy from this address space at `va` into `buf`, faulting pages in
    /// on demand, as a user-mode load would.
    pub fn read_user(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let page = addr.page_down();
            let offset = addr.page_offset();
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            let pte = self.translate_or_fault(page)?;
            self.page_table.mark_access(page, false);
            let frame = unsafe { self.kernel.frames.frame(pte.pa) };
            buf[done..done + chunk].copy_from_slice(&frame.inner()[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn translate_or_fault(
        &self,
        page: Va,
    ) -> Result<super::page_table::Pte, KernelError> {
        loop {
            if let Some(pte) = self.page_table.translate(page) {
                return Ok(pte);
            }
            self.fault_in(page)?;
        }
    }

    /// State of the supplemental entry at `va`, if one exists. Test
    /// instrumentation.
    pub fn page_status(&self, va: Va) -> Option<PageStatus> {
        let supp = self.supp.lock();
        let status = supp.get(&va).map(|entry| match entry.state {
            PageState::Uninitialized => PageStatus::Uninitialized,
            PageState::Loaded(_) => PageStatus::Loaded,
            PageState::Evicted => PageStatus::Evicted,
        });
        supp.unlock();
        status
    }

    /// The swap slot held by the evicted entry at `va`, if any. Test
    /// instrumentation.
    pub fn swap_slot_of(&self, va: Va) -> Option<SwapSlot> {
        let supp = self.supp.lock();
        let slot = supp.get(&va).and_then(|entry| match entry.backing {
            Backing::Swap(slot) => Some(slot),
            _ => None,
        });
        supp.unlock();
        slot
    }

    /// Number of supplemental entries. Test instrumentation.
    pub fn installed_pages(&self) -> usize {
        let supp = self.supp.lock();
        let len = supp.len();
        supp.unlock();
        len
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.uninstall_all();
    }
}
