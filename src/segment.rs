//! Segment-addressed, memory-mapped storage arena.
//!
//! The arena owns one file holding `max_segments` fixed-size segments after
//! a 64-byte header. Segments are addressed by opaque ids; all access goes
//! through a checked-out [`SegmentGuard`] whose release is guaranteed by
//! scope exit, so acquire/release pairing is structural and cannot be
//! forgotten on an error path.
//!
//! Segment lifetime is protected by per-segment reference counts with
//! bounded spin-retry rather than blocking locks. A reference attempt that
//! cannot succeed within the retry budget is reported as an abnormal
//! (deadlock) condition, never silently retried forever.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::error;
use memmap2::{MmapMut, MmapOptions};

use crate::config::EngineConfig;
use crate::error::DataCorruption;
use crate::{GristError, Result};

pub type SegmentId = u32;

/// Sentinel "no segment" id. Callers treat it as exhausted capacity.
pub const NO_SEGMENT: SegmentId = u32::MAX;

pub const SEGMENT_MAGIC: &[u8; 8] = b"GristSg1";
pub const FORMAT_VERSION_LEGACY: u32 = 1;
pub const FORMAT_VERSION_CURRENT: u32 = 2;

const FILE_HEADER_BYTES: u64 = 64;

/// Refcount sentinel meaning "segment locked for expiry".
const REFCOUNT_LOCKED: u32 = u32::MAX;
const MAX_ACQUIRE_RETRIES: usize = 500;
const ACQUIRE_RETRY_SLEEP: Duration = Duration::from_micros(50);

/// On-disk format variant, selected once at open time from the stored tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentFormat {
    /// Current layout, read-write.
    Current,
    /// Previous layout, readable but never mutated.
    Legacy,
}

impl SegmentFormat {
    fn from_version(version: u32) -> Result<SegmentFormat> {
        match version {
            FORMAT_VERSION_CURRENT => Ok(SegmentFormat::Current),
            FORMAT_VERSION_LEGACY => Ok(SegmentFormat::Legacy),
            other => Err(GristError::IncompatibleFormat(format!(
                "unknown segment file version {}",
                other
            ))),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, SegmentFormat::Current)
    }
}

struct SegmentSlot {
    refcount: AtomicU32,
    mmap: RwLock<Option<MmapMut>>,
}

impl SegmentSlot {
    fn new() -> SegmentSlot {
        SegmentSlot {
            refcount: AtomicU32::new(0),
            mmap: RwLock::new(None),
        }
    }
}

pub struct SegmentArena {
    path: PathBuf,
    file: File,
    segment_size: u32,
    max_segments: u32,
    format: SegmentFormat,
    cache_size: usize,
    mapped_count: AtomicUsize,
    slots: Vec<SegmentSlot>,
}

fn header_bytes(segment_size: u32, max_segments: u32) -> [u8; FILE_HEADER_BYTES as usize] {
    let mut header = [0u8; FILE_HEADER_BYTES as usize];
    header[..8].copy_from_slice(SEGMENT_MAGIC);
    LittleEndian::write_u32(&mut header[8..12], FORMAT_VERSION_CURRENT);
    LittleEndian::write_u32(&mut header[12..16], segment_size);
    LittleEndian::write_u32(&mut header[16..20], max_segments);
    let crc = crc32fast::hash(&header[..20]);
    LittleEndian::write_u32(&mut header[20..24], crc);
    header
}

impl SegmentArena {
    /// Creates a new arena file sized for `max_segments` segments.
    pub fn create(path: &Path, config: &EngineConfig) -> Result<SegmentArena> {
        if path.exists() {
            return Err(GristError::FileAlreadyExists(path.to_path_buf()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let total = FILE_HEADER_BYTES
            + u64::from(config.segment_size) * u64::from(config.max_segments);
        file.set_len(total)?;
        file.write_all(&header_bytes(config.segment_size, config.max_segments))?;
        file.sync_all()?;
        Ok(SegmentArena::from_parts(
            path.to_path_buf(),
            file,
            config.segment_size,
            config.max_segments,
            SegmentFormat::Current,
            config.segment_cache_size,
        ))
    }

    /// Opens an existing arena file, verifying magic, checksum and version.
    ///
    /// Geometry is taken from the stored header, not from `config`.
    pub fn open(path: &Path, config: &EngineConfig) -> Result<SegmentArena> {
        if !path.exists() {
            return Err(GristError::PathDoesNotExist(path.to_path_buf()));
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header = [0u8; FILE_HEADER_BYTES as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if &header[..8] != SEGMENT_MAGIC {
            return Err(DataCorruption::new(
                path.to_path_buf(),
                "bad magic in segment file header".to_string(),
            )
            .into());
        }
        let stored_crc = LittleEndian::read_u32(&header[20..24]);
        if crc32fast::hash(&header[..20]) != stored_crc {
            return Err(DataCorruption::new(
                path.to_path_buf(),
                "segment file header checksum mismatch".to_string(),
            )
            .into());
        }
        let version = LittleEndian::read_u32(&header[8..12]);
        let format = SegmentFormat::from_version(version)?;
        let segment_size = LittleEndian::read_u32(&header[12..16]);
        let max_segments = LittleEndian::read_u32(&header[16..20]);
        if !segment_size.is_power_of_two() || max_segments == 0 {
            return Err(DataCorruption::new(
                path.to_path_buf(),
                format!(
                    "implausible stored geometry: segment_size={} max_segments={}",
                    segment_size, max_segments
                ),
            )
            .into());
        }
        Ok(SegmentArena::from_parts(
            path.to_path_buf(),
            file,
            segment_size,
            max_segments,
            format,
            config.segment_cache_size,
        ))
    }

    fn from_parts(
        path: PathBuf,
        file: File,
        segment_size: u32,
        max_segments: u32,
        format: SegmentFormat,
        cache_size: usize,
    ) -> SegmentArena {
        let slots = (0..max_segments).map(|_| SegmentSlot::new()).collect();
        SegmentArena {
            path,
            file,
            segment_size,
            max_segments,
            format,
            cache_size: cache_size.max(4),
            mapped_count: AtomicUsize::new(0),
            slots,
        }
    }

    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    pub fn max_segments(&self) -> u32 {
        self.max_segments
    }

    pub fn format(&self) -> SegmentFormat {
        self.format
    }

    fn slot(&self, seg: SegmentId) -> Result<&SegmentSlot> {
        self.slots.get(seg as usize).ok_or_else(|| {
            GristError::Abnormal(format!(
                "segment id {} out of range (max {})",
                seg, self.max_segments
            ))
        })
    }

    /// Checks out a segment. Increments its reference count; the returned
    /// guard releases it on drop.
    pub fn acquire(&self, seg: SegmentId) -> Result<SegmentGuard<'_>> {
        let slot = self.slot(seg)?;
        let mut retries = 0usize;
        loop {
            let refcount = slot.refcount.load(Ordering::Acquire);
            if refcount != REFCOUNT_LOCKED {
                if slot
                    .refcount
                    .compare_exchange(
                        refcount,
                        refcount + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            retries += 1;
            if retries > MAX_ACQUIRE_RETRIES {
                error!(
                    "segment {} of {:?} reference deadlock after {} retries",
                    seg, self.path, retries
                );
                return Err(GristError::Abnormal(format!(
                    "segment {} reference deadlock",
                    seg
                )));
            }
            thread::sleep(ACQUIRE_RETRY_SLEEP);
        }
        if let Err(map_err) = self.ensure_mapped(seg) {
            slot.refcount.fetch_sub(1, Ordering::AcqRel);
            return Err(map_err);
        }
        Ok(SegmentGuard { arena: self, seg })
    }

    fn ensure_mapped(&self, seg: SegmentId) -> Result<()> {
        let slot = self.slot(seg)?;
        {
            let mmap = slot.mmap.read()?;
            if mmap.is_some() {
                return Ok(());
            }
        }
        if self.mapped_count.load(Ordering::Acquire) >= self.cache_size {
            self.expire_unreferenced();
        }
        let mut mmap = slot.mmap.write()?;
        if mmap.is_none() {
            let offset = FILE_HEADER_BYTES + u64::from(seg) * u64::from(self.segment_size);
            let mapping = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(self.segment_size as usize)
                    .map_mut(&self.file)?
            };
            *mmap = Some(mapping);
            self.mapped_count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Voluntarily drops the mapping of `seg` if nobody references it.
    pub fn expire(&self, seg: SegmentId) -> Result<bool> {
        let slot = self.slot(seg)?;
        if slot
            .refcount
            .compare_exchange(0, REFCOUNT_LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let result = (|| -> Result<bool> {
            let mut mmap = slot.mmap.write()?;
            if let Some(mapping) = mmap.take() {
                mapping.flush()?;
                self.mapped_count.fetch_sub(1, Ordering::AcqRel);
                Ok(true)
            } else {
                Ok(false)
            }
        })();
        slot.refcount.store(0, Ordering::Release);
        result
    }

    fn expire_unreferenced(&self) {
        for seg in 0..self.max_segments {
            if self.mapped_count.load(Ordering::Acquire) < self.cache_size {
                return;
            }
            // Best effort; a busy segment is simply skipped.
            let _ = self.expire(seg);
        }
    }

    /// Flushes every live mapping to disk.
    pub fn sync_all(&self) -> Result<()> {
        for slot in &self.slots {
            let mmap = slot.mmap.read()?;
            if let Some(ref mapping) = *mmap {
                mapping.flush()?;
            }
        }
        Ok(())
    }
}

/// Checked-out reference to one segment.
///
/// All byte access to segment content goes through this guard; dropping it
/// releases the reference count taken by [`SegmentArena::acquire`].
pub struct SegmentGuard<'a> {
    arena: &'a SegmentArena,
    seg: SegmentId,
}

impl<'a> SegmentGuard<'a> {
    pub fn segment_id(&self) -> SegmentId {
        self.seg
    }

    pub fn segment_size(&self) -> u32 {
        self.arena.segment_size
    }

    fn check_bounds(&self, offset: u32, len: usize) -> Result<()> {
        if (offset as usize) + len > self.arena.segment_size as usize {
            return Err(GristError::Abnormal(format!(
                "segment {} access out of bounds: offset {} len {}",
                self.seg, offset, len
            )));
        }
        Ok(())
    }

    fn with_map<T>(&self, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        let slot = self.arena.slot(self.seg)?;
        let mmap = slot.mmap.read()?;
        let mapping = mmap.as_ref().ok_or_else(|| {
            GristError::Abnormal(format!("segment {} unmapped while referenced", self.seg))
        })?;
        Ok(f(&mapping[..]))
    }

    fn with_map_mut<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> Result<T> {
        let slot = self.arena.slot(self.seg)?;
        let mut mmap = slot.mmap.write()?;
        let mapping = mmap.as_mut().ok_or_else(|| {
            GristError::Abnormal(format!("segment {} unmapped while referenced", self.seg))
        })?;
        Ok(f(&mut mapping[..]))
    }

    pub fn read_u32(&self, offset: u32) -> Result<u32> {
        self.check_bounds(offset, 4)?;
        self.with_map(|bytes| LittleEndian::read_u32(&bytes[offset as usize..]))
    }

    pub fn write_u32(&self, offset: u32, value: u32) -> Result<()> {
        self.check_bounds(offset, 4)?;
        self.with_map_mut(|bytes| LittleEndian::write_u32(&mut bytes[offset as usize..], value))
    }

    pub fn read_bytes(&self, offset: u32, len: usize) -> Result<Vec<u8>> {
        self.check_bounds(offset, len)?;
        self.with_map(|bytes| bytes[offset as usize..offset as usize + len].to_vec())
    }

    pub fn write_bytes(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        self.with_map_mut(|bytes| {
            bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data)
        })
    }

    /// Zeroes a byte range. Used when retiring a buffer segment.
    pub fn zero_range(&self, offset: u32, len: usize) -> Result<()> {
        self.check_bounds(offset, len)?;
        self.with_map_mut(|bytes| {
            for byte in &mut bytes[offset as usize..offset as usize + len] {
                *byte = 0;
            }
        })
    }
}

impl<'a> Drop for SegmentGuard<'a> {
    fn drop(&mut self) {
        if let Ok(slot) = self.arena.slot(self.seg) {
            slot.refcount.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::EngineConfig;

    fn test_config() -> EngineConfig {
        EngineConfig {
            segment_size: 1 << 12,
            max_segments: 8,
            segment_cache_size: 4,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_create_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.seg");
        let config = test_config();
        {
            let arena = SegmentArena::create(&path, &config).unwrap();
            let guard = arena.acquire(3).unwrap();
            guard.write_u32(100, 0xDEAD_BEEF).unwrap();
            arena.sync_all().unwrap();
        }
        let arena = SegmentArena::open(&path, &config).unwrap();
        assert_eq!(arena.segment_size(), config.segment_size);
        assert_eq!(arena.format(), SegmentFormat::Current);
        let guard = arena.acquire(3).unwrap();
        assert_eq!(guard.read_u32(100).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.seg");
        let config = test_config();
        SegmentArena::create(&path, &config).unwrap();
        assert!(matches!(
            SegmentArena::create(&path, &config),
            Err(GristError::FileAlreadyExists(_))
        ));
    }

    #[test]
    fn test_expire_skips_referenced_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.seg");
        let arena = SegmentArena::create(&path, &test_config()).unwrap();
        let guard = arena.acquire(0).unwrap();
        assert!(!arena.expire(0).unwrap());
        drop(guard);
        assert!(arena.expire(0).unwrap());
        // Re-acquire remaps transparently.
        let guard = arena.acquire(0).unwrap();
        assert_eq!(guard.read_u32(0).unwrap(), 0);
    }

    #[test]
    fn test_acquire_reports_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.seg");
        let arena = SegmentArena::create(&path, &test_config()).unwrap();
        arena.slots[1]
            .refcount
            .store(REFCOUNT_LOCKED, Ordering::Release);
        assert!(matches!(arena.acquire(1), Err(GristError::Abnormal(_))));
        arena.slots[1].refcount.store(0, Ordering::Release);
    }

    #[test]
    fn test_out_of_bounds_access_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.seg");
        let config = test_config();
        let arena = SegmentArena::create(&path, &config).unwrap();
        let guard = arena.acquire(0).unwrap();
        assert!(guard.read_u32(config.segment_size - 2).is_err());
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.seg");
        let config = test_config();
        SegmentArena::create(&path, &config).unwrap();
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.write_all(b"NotGrist").unwrap();
        }
        assert!(SegmentArena::open(&path, &config).is_err());
    }
}
