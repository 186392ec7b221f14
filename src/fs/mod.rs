//! Filesystem abstraction.
//!
//! The core consumes two boundary interfaces here: a sector-addressed
//! [`BlockDevice`] (two named instances exist per kernel: the filesystem
//! device behind the buffer cache, and the swap device), and a positional
//! file interface ([`traits::RegularFile`]) whose reads and writes always
//! go through the buffer cache.
//!
//! [`Disk`] wraps a device handle and optionally a [`Hook`] that observes
//! every sector transfer, which is how tests assert properties like "no
//! write ever reached the file device".

pub mod buffer_cache;

use crate::{sync::RwLock, sync::SpinLock, KernelError};
use self::buffer_cache::BufferCache;
use std::sync::Arc;

/// Size of a device sector, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector, the access granularity of a disk.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Sector(pub usize);

impl Sector {
    /// Byte offset of the start of this sector on its device.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 * SECTOR_SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// A sector-addressed block device.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn sector_count(&self) -> usize;
    /// Read one sector into `buf`.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError>;
    /// Write one sector from `buf`.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError>;
}

/// An in-memory block device.
pub struct MemDisk {
    sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    /// Create a zero-filled device with `count` sectors.
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(MemDisk {
            sectors: SpinLock::new(vec![[0; SECTOR_SIZE]; count]),
        })
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> usize {
        let sectors = self.sectors.lock();
        let count = sectors.len();
        sectors.unlock();
        count
    }

    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let sectors = self.sectors.lock();
        let result = match sectors.get(sector.into_usize()) {
            Some(data) => {
                buf.copy_from_slice(data);
                Ok(())
            }
            None => Err(KernelError::IOError),
        };
        sectors.unlock();
        result
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut sectors = self.sectors.lock();
        let result = match sectors.get_mut(sector.into_usize()) {
            Some(data) => {
                data.copy_from_slice(buf);
                Ok(())
            }
            None => Err(KernelError::IOError),
        };
        sectors.unlock();
        result
    }
}

/// The type for disk hooking.
pub type Hook =
    Arc<dyn Fn(Sector, &[u8; SECTOR_SIZE], bool) -> Result<(), KernelError> + Send + Sync>;

/// A handle to a block device, optionally with an observation hook.
#[derive(Clone)]
pub struct Disk {
    dev: Arc<dyn BlockDevice>,
    hook: Option<Hook>,
}

impl Disk {
    /// Create a new disk over the given device.
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Disk { dev, hook: None }
    }

    /// Add a hook for the disk.
    ///
    /// The hook sees every transfer (`is_write` distinguishes direction)
    /// before it reaches the device, and may fail it.
    pub fn hook(self, hook: Hook) -> Self {
        Disk {
            dev: self.dev,
            hook: Some(hook),
        }
    }

    /// Number of sectors on the device.
    pub fn sector_count(&self) -> usize {
        self.dev.sector_count()
    }

    /// Read one sector from the disk.
    pub fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        self.dev.read(sector, buf)
    }

    /// Write one sector to the disk.
    pub fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, true)?;
        }
        self.dev.write(sector, buf)
    }
}

/// Defines traits for file operations.
pub mod traits {
    use crate::KernelError;

    /// Trait representing a regular file.
    ///
    /// Offsets are absolute; handles carry no cursor, so independently
    /// reopened handles never interfere.
    pub trait RegularFile: Send + Sync {
        /// Size of the file in bytes.
        fn length(&self) -> usize;

        /// Read up to `buf.len()` bytes starting at `offset`.
        ///
        /// Returns the number of bytes read, clamped at end of file.
        fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError>;

        /// Write `buf` starting at `offset`, extending the file if the
        /// write reaches past its current end.
        ///
        /// Returns the number of bytes written.
        fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, KernelError>;
    }
}

/// A handle to a regular file.
///
/// Reference-counted: [`reopen`] yields an independent handle to the same
/// file, and the file is closed when the last handle is dropped. The
/// supplemental page table keeps one reopened handle per installed page so
/// that no page can outlive its backing file.
///
/// [`reopen`]: Self::reopen
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Open an independent handle to the same file.
    pub fn reopen(&self) -> RegularFile {
        RegularFile(self.0.clone())
    }

    /// Size of the file in bytes.
    #[inline]
    pub fn length(&self) -> usize {
        self.0.length()
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    #[inline]
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        self.0.read_at(buf, offset)
    }

    /// Write `buf` starting at `offset`.
    #[inline]
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, KernelError> {
        self.0.write_at(buf, offset)
    }
}

/// A regular file stored as a contiguous run of sectors on the filesystem
/// device.
///
/// All I/O goes through the buffer cache; the device itself is only
/// touched by cache eviction and flush. The length is guarded by a
/// reader/writer lock: concurrent readers share it, while a write that may
/// extend the file holds it exclusively.
pub struct ExtentFile {
    cache: Arc<BufferCache>,
    start: Sector,
    capacity: usize,
    length: RwLock<usize>,
}

impl ExtentFile {
    /// Create an empty file occupying `capacity_sectors` sectors starting
    /// at `start`.
    pub fn create(cache: Arc<BufferCache>, start: Sector, capacity_sectors: usize) -> RegularFile {
        RegularFile::new(ExtentFile {
            cache,
            start,
            capacity: capacity_sectors * SECTOR_SIZE,
            length: RwLock::new(0),
        })
    }

    /// Open an extent already holding `length` bytes of data.
    pub fn open(
        cache: Arc<BufferCache>,
        start: Sector,
        capacity_sectors: usize,
        length: usize,
    ) -> RegularFile {
        assert!(length <= capacity_sectors * SECTOR_SIZE);
        RegularFile::new(ExtentFile {
            cache,
            start,
            capacity: capacity_sectors * SECTOR_SIZE,
            length: RwLock::new(length),
        })
    }

    fn transfer(
        &self,
        offset: usize,
        len: usize,
        mut op: impl FnMut(Sector, usize, usize, usize) -> Result<(), KernelError>,
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < len {
            let pos = offset + done;
            let sector = self.start + pos / SECTOR_SIZE;
            let in_sector = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - in_sector).min(len - done);
            op(sector, in_sector, done, chunk)?;
            done += chunk;
        }
        Ok(())
    }
}

impl traits::RegularFile for ExtentFile {
    fn length(&self) -> usize {
        let guard = self.length.read();
        let length = *guard;
        guard.unlock();
        length
    }

    fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        let guard = self.length.read();
        let length = *guard;
        guard.unlock();
        if offset >= length {
            return Ok(0);
        }
        let n = buf.len().min(length - offset);
        self.transfer(offset, n, |sector, in_sector, done, chunk| {
            self.cache
                .read_bytes(sector, in_sector, &mut buf[done..done + chunk])
        })?;
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, KernelError> {
        let mut guard = self.length.write();
        let end = offset + buf.len();
        if end > self.capacity {
            guard.unlock();
            return Err(KernelError::NoSpace);
        }
        let result = self.transfer(offset, buf.len(), |sector, in_sector, done, chunk| {
            self.cache
                .write_bytes(sector, in_sector, &buf[done..done + chunk])
        });
        match result {
            Ok(()) => {
                if end > *guard {
                    *guard = end;
                }
                guard.unlock();
                Ok(buf.len())
            }
            Err(e) => {
                guard.unlock();
                Err(e)
            }
        }
    }
}
