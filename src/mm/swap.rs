//! Swap area.
//!
//! The swap device is a dense sequence of page-sized slots starting at
//! sector 0; there is no header. A bitmap records which slots are in use,
//! and a single mutex guards both the bitmap and the device, so slot
//! reservation and the sector-by-sector page transfer are atomic with
//! respect to other swappers.
//!
//! A slot is owned by exactly one supplemental page entry from
//! [`reserve_and_write`] until the matching [`read_and_free`] or
//! [`discard`]. Running out of slots panics: an evicting thread has no
//! recovery path, and out-of-swap is a configuration error, not a runtime
//! condition.
//!
//! [`reserve_and_write`]: SwapArea::reserve_and_write
//! [`read_and_free`]: SwapArea::read_and_free
//! [`discard`]: SwapArea::discard

use crate::{
    addressing::PAGE_SIZE,
    fs::{Disk, Sector, SECTOR_SIZE},
    sync::Mutex,
};

/// Number of device sectors holding one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Index of a page-sized slot in the swap area.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct SwapSlot(pub usize);

struct SwapInner {
    disk: Disk,
    // One bit per slot; set means in use.
    map: Vec<u64>,
    slots: usize,
}

/// Fixed-size backing store for anonymous pages.
pub struct SwapArea {
    inner: Mutex<SwapInner>,
}

impl SwapArea {
    /// Build a swap area covering the whole of `disk`.
    pub fn new(disk: Disk) -> Self {
        let slots = disk.sector_count() / SECTORS_PER_PAGE;
        log::info!("swap: {} page slots", slots);
        SwapArea {
            inner: Mutex::new(SwapInner {
                disk,
                map: vec![0; slots.div_ceil(64)],
                slots,
            }),
        }
    }

    /// Reserve a free slot and write `page` into it, sector by sector.
    ///
    /// # Panics
    ///
    /// Panics when no slot is free; the evicting caller has no recovery
    /// path.
    pub fn reserve_and_write(&self, page: &[u8; PAGE_SIZE]) -> SwapSlot {
        let mut inner = self.inner.lock();
        let slot = match Self::scan_and_flip(&mut inner) {
            Some(slot) => slot,
            None => panic!("out of swap: no free slot"),
        };
        let base = Sector(slot * SECTORS_PER_PAGE);
        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            inner
                .disk
                .write(base + i, chunk.try_into().unwrap())
                .expect("swap write failed");
        }
        inner.unlock();
        log::trace!("swap: wrote slot {}", slot);
        SwapSlot(slot)
    }

    /// Read the contents of `slot` into `dst` and free the slot.
    pub fn read_and_free(&self, slot: SwapSlot, dst: &mut [u8; PAGE_SIZE]) {
        let mut inner = self.inner.lock();
        Self::clear(&mut inner, slot);
        let base = Sector(slot.0 * SECTORS_PER_PAGE);
        for (i, chunk) in dst.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            inner
                .disk
                .read(base + i, chunk.try_into().unwrap())
                .expect("swap read failed");
        }
        inner.unlock();
        log::trace!("swap: read and freed slot {}", slot.0);
    }

    /// Free `slot` without reading it.
    pub fn discard(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        Self::clear(&mut inner, slot);
        inner.unlock();
    }

    /// Whether `slot` is currently reserved. Test instrumentation.
    pub fn slot_in_use(&self, slot: SwapSlot) -> bool {
        let inner = self.inner.lock();
        let (word, bit) = (slot.0 / 64, slot.0 % 64);
        let used = slot.0 < inner.slots && inner.map[word] & (1 << bit) != 0;
        inner.unlock();
        used
    }

    /// Number of free slots. Test instrumentation.
    pub fn free_slots(&self) -> usize {
        let inner = self.inner.lock();
        let used: u32 = inner.map.iter().map(|w| w.count_ones()).sum();
        let free = inner.slots - used as usize;
        inner.unlock();
        free
    }

    // Find the first clear bit, set it, and return its index.
    fn scan_and_flip(inner: &mut SwapInner) -> Option<usize> {
        for slot in 0..inner.slots {
            let (word, bit) = (slot / 64, slot % 64);
            if inner.map[word] & (1 << bit) == 0 {
                inner.map[word] |= 1 << bit;
                return Some(slot);
            }
        }
        None
    }

    fn clear(inner: &mut SwapInner, slot: SwapSlot) {
        assert!(slot.0 < inner.slots, "swap slot out of range");
        let (word, bit) = (slot.0 / 64, slot.0 % 64);
        assert!(
            inner.map[word] & (1 << bit) != 0,
            "freeing a swap slot that is not in use"
        );
        inner.map[word] &= !(1 << bit);
    }
}
