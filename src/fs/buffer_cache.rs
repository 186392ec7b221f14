//! Buffer cache.
//!
//! A fixed pool of [`CACHE_SLOTS`] sector-sized slots amortizes block
//! device I/O for the filesystem. The cache is **write-back**: writes land
//! in a slot and set its dirty bit; the device sees the data only when the
//! slot is evicted or on an explicit [`flush`].
//!
//! Two levels of locking keep concurrent access safe without serializing
//! I/O:
//!
//! - the **directory lock** protects the sector-to-slot map (and the
//!   eviction state);
//! - a **per-slot lock** protects each slot's data and dirty bit, and is
//!   held across the device transfer that fills or drains the slot.
//!
//! The directory lock precedes any slot lock in the global order. On a
//! hit, the directory is released *before* the slot lock is taken, so the
//! looked-up slot may have been repurposed in between; the holder
//! re-checks the slot's own `sector` field and retries on a mismatch. On a
//! miss, the chosen slot's lock is taken (never blocking: unoccupied slots
//! are unreachable and eviction candidates are claimed with `try_lock`)
//! before the directory is released, so a re-checking racer simply sleeps
//! on the slot until its new contents arrive.
//!
//! Eviction runs a clock sweep over the slot array with per-slot reference
//! bits; a dirty victim is written back before the slot is repurposed.
//!
//! [`flush`]: BufferCache::flush

use super::{Disk, Sector, SECTOR_SIZE};
use crate::{
    sync::{Mutex, MutexGuard},
    KernelError,
};
use std::collections::HashMap;

/// Number of slots in the cache.
pub const CACHE_SLOTS: usize = 64;

struct SlotState {
    // Current owner; `None` is the unoccupied sentinel.
    sector: Option<Sector>,
    dirty: bool,
    data: [u8; SECTOR_SIZE],
}

struct CacheSlot {
    state: Mutex<SlotState>,
}

struct Directory {
    map: HashMap<Sector, usize>,
    // The directory's view of each slot's owner. The slot's own `sector`
    // field is the ground truth that hit paths re-check.
    owners: Vec<Option<Sector>>,
    referenced: Vec<bool>,
    hand: usize,
}

/// Write-back cache over the filesystem device.
pub struct BufferCache {
    disk: Disk,
    directory: Mutex<Directory>,
    slots: Vec<CacheSlot>,
}

impl BufferCache {
    /// Create a cache over `disk` with all slots unoccupied.
    pub fn new(disk: Disk) -> Self {
        let mut slots = Vec::with_capacity(CACHE_SLOTS);
        for _ in 0..CACHE_SLOTS {
            slots.push(CacheSlot {
                state: Mutex::new(SlotState {
                    sector: None,
                    dirty: false,
                    data: [0; SECTOR_SIZE],
                }),
            });
        }
        log::info!("buffer cache: {} slots", CACHE_SLOTS);
        BufferCache {
            disk,
            directory: Mutex::new(Directory {
                map: HashMap::new(),
                owners: vec![None; CACHE_SLOTS],
                referenced: vec![false; CACHE_SLOTS],
                hand: 0,
            }),
            slots,
        }
    }

    /// Read a whole sector.
    pub fn read(&self, sector: Sector, dst: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let guard = self.acquire(sector)?;
        dst.copy_from_slice(&guard.data);
        guard.unlock();
        Ok(())
    }

    /// Write a whole sector. The data reaches the device on eviction or
    /// flush.
    pub fn write(&self, sector: Sector, src: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut guard = self.acquire(sector)?;
        guard.data.copy_from_slice(src);
        guard.dirty = true;
        guard.unlock();
        Ok(())
    }

    /// Read `dst.len()` bytes from `sector` starting at byte `offset`.
    ///
    /// The range must lie within the sector; the cache never issues a
    /// partial block transfer to the device.
    pub fn read_bytes(
        &self,
        sector: Sector,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), KernelError> {
        assert!(offset + dst.len() <= SECTOR_SIZE, "read crosses a sector");
        let guard = self.acquire(sector)?;
        dst.copy_from_slice(&guard.data[offset..offset + dst.len()]);
        guard.unlock();
        Ok(())
    }

    /// Write `src` into `sector` starting at byte `offset`.
    pub fn write_bytes(
        &self,
        sector: Sector,
        offset: usize,
        src: &[u8],
    ) -> Result<(), KernelError> {
        assert!(offset + src.len() <= SECTOR_SIZE, "write crosses a sector");
        let mut guard = self.acquire(sector)?;
        guard.data[offset..offset + src.len()].copy_from_slice(src);
        guard.dirty = true;
        guard.unlock();
        Ok(())
    }

    /// Write every dirty slot back to the device.
    pub fn flush(&self) -> Result<(), KernelError> {
        let mut result = Ok(());
        for slot in &self.slots {
            let mut guard = slot.state.lock();
            if guard.dirty {
                let sector = guard.sector.expect("dirty slot without an owner");
                match self.disk.write(sector, &guard.data) {
                    Ok(()) => guard.dirty = false,
                    Err(e) => result = Err(e),
                }
            }
            guard.unlock();
        }
        result
    }

    /// Whether `sector` currently occupies a slot. Test instrumentation.
    pub fn contains(&self, sector: Sector) -> bool {
        let dir = self.directory.lock();
        let hit = dir.map.contains_key(&sector);
        dir.unlock();
        hit
    }

    // Acquire-for-sector: return the locked slot holding `sector`,
    // filling one from the device on a miss.
    fn acquire(&self, sector: Sector) -> Result<MutexGuard<'_, SlotState>, KernelError> {
        loop {
            let mut dir = self.directory.lock();
            if let Some(&idx) = dir.map.get(&sector) {
                dir.referenced[idx] = true;
                dir.unlock();
                let guard = self.slots[idx].state.lock();
                if guard.sector == Some(sector) {
                    return Ok(guard);
                }
                // The slot was evicted between the directory lookup and
                // our slot lock; start over.
                guard.unlock();
                continue;
            }

            // Miss. Claim a slot (an unoccupied one, counting down from
            // the last, or a clock victim) with its lock held before the
            // directory is released.
            let claimed = match Self::empty_slot(&dir) {
                Some(idx) => {
                    let guard = match self.slots[idx].state.try_lock() {
                        Ok(guard) => guard,
                        // Unreachable slots are uncontended; don't fight
                        // whoever got here first, just retry.
                        Err(_) => {
                            dir.unlock();
                            continue;
                        }
                    };
                    Some((idx, guard))
                }
                None => self.clock_victim(&mut dir),
            };
            let (idx, mut guard) = match claimed {
                Some(v) => v,
                None => {
                    // Every slot is mid-I/O on some other thread. Let
                    // them run and retry.
                    dir.unlock();
                    crate::thread::yield_now();
                    continue;
                }
            };
            if let Some(old) = dir.owners[idx].take() {
                dir.map.remove(&old);
            }
            dir.map.insert(sector, idx);
            dir.owners[idx] = Some(sector);
            dir.referenced[idx] = true;
            dir.unlock();

            // Directory released, slot lock held: drain the previous
            // occupant if dirty, then pull in the requested sector.
            if guard.dirty {
                let old = guard.sector.expect("dirty slot without an owner");
                if let Err(e) = self.disk.write(old, &guard.data) {
                    return Err(self.abandon(sector, idx, guard, e));
                }
                guard.dirty = false;
            }
            match self.disk.read(sector, &mut guard.data) {
                Ok(()) => {
                    guard.sector = Some(sector);
                    guard.dirty = false;
                    return Ok(guard);
                }
                Err(e) => return Err(self.abandon(sector, idx, guard, e)),
            }
        }
    }

    // Undo a failed fill: mark the slot unoccupied and retract the
    // directory entry installed for `sector`.
    fn abandon(
        &self,
        sector: Sector,
        idx: usize,
        mut guard: MutexGuard<'_, SlotState>,
        e: KernelError,
    ) -> KernelError {
        guard.sector = None;
        guard.dirty = false;
        guard.unlock();
        let mut dir = self.directory.lock();
        if dir.map.get(&sector) == Some(&idx) {
            dir.map.remove(&sector);
            dir.owners[idx] = None;
        }
        dir.unlock();
        e
    }

    // Highest-numbered slot the directory has never handed out.
    fn empty_slot(dir: &Directory) -> Option<usize> {
        (0..CACHE_SLOTS).rev().find(|&idx| dir.owners[idx].is_none())
    }

    // Clock sweep: skip recently referenced slots (clearing their bit)
    // and slots whose lock is held, claim the first remaining one.
    fn clock_victim<'a>(
        &'a self,
        dir: &mut Directory,
    ) -> Option<(usize, MutexGuard<'a, SlotState>)> {
        for _ in 0..2 * CACHE_SLOTS {
            let idx = dir.hand;
            dir.hand = (dir.hand + 1) % CACHE_SLOTS;
            if dir.owners[idx].is_none() {
                continue;
            }
            if dir.referenced[idx] {
                dir.referenced[idx] = false;
                continue;
            }
            if let Ok(guard) = self.slots[idx].state.try_lock() {
                return Some((idx, guard));
            }
        }
        None
    }
}
