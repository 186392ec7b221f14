//! Software MMU.
//!
//! Each address space owns a [`PageTable`] that models the hardware
//! mapping structure: page-aligned virtual addresses to physical frames,
//! with x86-style status bits. The pager installs and removes
//! translations; the frame table's second-chance sweep reads and clears
//! the accessed bits; eviction consults the dirty bit to decide whether a
//! file-backed page must be written back.
//!
//! Accessed and dirty bits are maintained by the user-memory access
//! emulation in [`pager`](super::pager), standing in for what the MMU
//! does on real hardware.

use crate::{
    addressing::{Pa, Va},
    sync::SpinLock,
    KernelError,
};
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Page table entry flags, at their x86 bit positions.
    pub struct PteFlags: u64 {
        /// The translation is valid.
        const PRESENT = 1 << 0;
        /// The page may be written.
        const WRITABLE = 1 << 1;
        /// The page has been read or written since the bit was cleared.
        const ACCESSED = 1 << 5;
        /// The page has been written since it was mapped.
        const DIRTY = 1 << 6;
    }
}

/// A page table entry.
#[derive(Clone, Copy)]
pub struct Pte {
    /// The mapped frame.
    pub pa: Pa,
    /// Status bits.
    pub flags: PteFlags,
}

/// Hardware mapping state of one address space.
pub struct PageTable {
    entries: SpinLock<BTreeMap<Va, Pte>>,
}

impl PageTable {
    /// Creates an empty page table.
    pub fn new() -> Self {
        PageTable {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Map `va` to the frame at `pa`.
    ///
    /// # Errors
    ///
    /// Fails with [`KernelError::InvalidArgument`] if `va` is already
    /// mapped.
    pub fn install_page(&self, va: Va, pa: Pa, writable: bool) -> Result<(), KernelError> {
        assert!(va.is_page_aligned() && pa.is_page_aligned());
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        let mut entries = self.entries.lock();
        let result = if entries.contains_key(&va) {
            Err(KernelError::InvalidArgument)
        } else {
            entries.insert(va, Pte { pa, flags });
            Ok(())
        };
        entries.unlock();
        result
    }

    /// Remove the mapping for `va`, returning the frame it pointed at.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not mapped; the pager only uninstalls pages it
    /// knows to be loaded.
    pub fn uninstall_page(&self, va: Va) -> Pa {
        let mut entries = self.entries.lock();
        let pte = entries.remove(&va);
        entries.unlock();
        pte.expect("uninstalling an unmapped page").pa
    }

    /// Look up the translation for `va`.
    pub fn translate(&self, va: Va) -> Option<Pte> {
        let entries = self.entries.lock();
        let pte = entries.get(&va).copied();
        entries.unlock();
        pte
    }

    /// Whether the page at `va` has been accessed. Unmapped pages report
    /// `false`.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.translate(va)
            .map_or(false, |pte| pte.flags.contains(PteFlags::ACCESSED))
    }

    /// Set or clear the accessed bit of the page at `va`.
    pub fn set_accessed(&self, va: Va, accessed: bool) {
        let mut entries = self.entries.lock();
        if let Some(pte) = entries.get_mut(&va) {
            if accessed {
                pte.flags |= PteFlags::ACCESSED;
            } else {
                pte.flags &= !PteFlags::ACCESSED;
            }
        }
        entries.unlock();
    }

    /// Whether the page at `va` has been written since it was mapped.
    /// Unmapped pages report `false`.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.translate(va)
            .map_or(false, |pte| pte.flags.contains(PteFlags::DIRTY))
    }

    /// Record an access to the page at `va`, as the MMU would.
    pub(crate) fn mark_access(&self, va: Va, write: bool) {
        let mut entries = self.entries.lock();
        if let Some(pte) = entries.get_mut(&va) {
            pte.flags |= PteFlags::ACCESSED;
            if write {
                pte.flags |= PteFlags::DIRTY;
            }
        }
        entries.unlock();
    }

    /// Number of live translations.
    pub fn mapped_pages(&self) -> usize {
        let entries = self.entries.lock();
        let len = entries.len();
        entries.unlock();
        len
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_translate_uninstall() {
        let pt = PageTable::new();
        let (va, pa) = (Va::new(0x8000_0000), Pa::new(0x4000_0000));
        pt.install_page(va, pa, true).unwrap();
        assert!(pt.install_page(va, pa, true).is_err());
        let pte = pt.translate(va).unwrap();
        assert_eq!(pte.pa, pa);
        assert!(pte.flags.contains(PteFlags::WRITABLE));
        assert!(!pt.is_dirty(va));
        pt.mark_access(va, true);
        assert!(pt.is_accessed(va));
        assert!(pt.is_dirty(va));
        pt.set_accessed(va, false);
        assert!(!pt.is_accessed(va));
        assert_eq!(pt.uninstall_page(va), pa);
        assert!(pt.translate(va).is_none());
    }
}
