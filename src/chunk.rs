//! Chunk heap: byte space for immutable compressed posting runs.
//!
//! The heap spans multiple backing extent files because a single extent has
//! a maximum size. Allocation is size-classed (power-of-two multiples of
//! the alignment block); freed runs go back to per-class free lists and are
//! reused by later flushes. Free lists are session-local: after a reopen
//! the heap resumes from its persisted bump watermark and space freed in
//! the previous session is reclaimed as runs get rewritten by flushes.
//!
//! Reads are copy-on-read: a read window materializes an owned byte vector,
//! so a concurrent remap (extent growth) can never invalidate a reader.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use log::debug;
use memmap2::{MmapMut, MmapOptions};

use crate::{GristError, Result};

/// Default maximum size of a single backing extent file.
const DEFAULT_MAX_EXTENT_BYTES: u64 = 1 << 28;
/// Extent files grow in steps of this many bytes.
const EXTENT_GROW_STEP: u64 = 1 << 20;
const NUM_SIZE_CLASSES: usize = 40;

/// Address of one allocated run inside the heap.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkRef {
    pub offset: u64,
    pub len: u64,
}

struct Extent {
    file: File,
    mmap: Option<MmapMut>,
    len: u64,
}

pub struct ChunkHeap {
    base: PathBuf,
    align: u64,
    max_extent_bytes: u64,
    extents: RwLock<Vec<Extent>>,
    used: Mutex<u64>,
    free_lists: Mutex<Vec<Vec<u64>>>,
}

impl ChunkHeap {
    /// Opens (or lazily creates) the heap rooted at `base`, resuming from
    /// the persisted bump watermark `used`.
    pub fn open(base: PathBuf, align: u32, used: u64) -> Result<ChunkHeap> {
        Self::open_with_extent_limit(base, align, used, DEFAULT_MAX_EXTENT_BYTES)
    }

    pub(crate) fn open_with_extent_limit(
        base: PathBuf,
        align: u32,
        used: u64,
        max_extent_bytes: u64,
    ) -> Result<ChunkHeap> {
        debug_assert!(align.is_power_of_two());
        debug_assert!(max_extent_bytes % u64::from(align) == 0);
        let heap = ChunkHeap {
            base,
            align: u64::from(align),
            max_extent_bytes,
            extents: RwLock::new(Vec::new()),
            used: Mutex::new(used),
            free_lists: Mutex::new(vec![Vec::new(); NUM_SIZE_CLASSES]),
        };
        if used > 0 {
            // Ensure every extent covering used space is open and sized.
            let last = (used - 1) / heap.max_extent_bytes;
            for ext_idx in 0..=last {
                let covered = (used - ext_idx * heap.max_extent_bytes).min(heap.max_extent_bytes);
                heap.ensure_extent(ext_idx as usize, covered)?;
            }
        }
        Ok(heap)
    }

    /// Current bump watermark. Persisted by the engine in the control page.
    pub fn used(&self) -> Result<u64> {
        Ok(*self.used.lock()?)
    }

    pub fn align(&self) -> u64 {
        self.align
    }

    fn size_class(&self, bytes: u64) -> Result<(usize, u64)> {
        let rounded = bytes.max(1).next_power_of_two().max(self.align);
        if rounded > self.max_extent_bytes {
            return Err(GristError::ResourceExhausted(format!(
                "chunk run of {} bytes exceeds the {} byte extent limit",
                bytes, self.max_extent_bytes
            )));
        }
        let class = (rounded / self.align).trailing_zeros() as usize;
        debug_assert!(class < NUM_SIZE_CLASSES);
        Ok((class, rounded))
    }

    fn extent_path(&self, ext_idx: usize) -> PathBuf {
        let mut name = self
            .base
            .file_name()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "grist".to_string());
        name.push_str(&format!(".c{}", ext_idx));
        self.base.with_file_name(name)
    }

    fn ensure_extent(&self, ext_idx: usize, min_len: u64) -> Result<()> {
        let mut extents = self.extents.write()?;
        while extents.len() <= ext_idx {
            let path = self.extent_path(extents.len());
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            let len = file.metadata()?.len();
            extents.push(Extent {
                file,
                mmap: None,
                len,
            });
        }
        let extent = &mut extents[ext_idx];
        if extent.len < min_len {
            let new_len = min_len
                .div_ceil(EXTENT_GROW_STEP)
                .saturating_mul(EXTENT_GROW_STEP)
                .min(self.max_extent_bytes);
            extent.file.set_len(new_len)?;
            extent.len = new_len;
            extent.mmap = None;
            debug!(
                "chunk extent {} grown to {} bytes",
                ext_idx, new_len
            );
        }
        if extent.mmap.is_none() && extent.len > 0 {
            let mapping = unsafe {
                MmapOptions::new()
                    .len(extent.len as usize)
                    .map_mut(&extent.file)?
            };
            extent.mmap = Some(mapping);
        }
        Ok(())
    }

    /// Allocates a run of at least `bytes` bytes.
    pub fn allocate(&self, bytes: u64) -> Result<ChunkRef> {
        let (class, rounded) = self.size_class(bytes)?;
        if let Some(offset) = self.free_lists.lock()?[class].pop() {
            return Ok(ChunkRef {
                offset,
                len: bytes,
            });
        }
        let mut used = self.used.lock()?;
        let local = *used % self.max_extent_bytes;
        if local + rounded > self.max_extent_bytes {
            // A run never straddles an extent boundary; the tail of the
            // current extent is abandoned.
            *used += self.max_extent_bytes - local;
        }
        let offset = *used;
        *used += rounded;
        let ext_idx = (offset / self.max_extent_bytes) as usize;
        let local_end = offset % self.max_extent_bytes + rounded;
        self.ensure_extent(ext_idx, local_end)?;
        Ok(ChunkRef {
            offset,
            len: bytes,
        })
    }

    /// Returns a run's space to the allocator.
    pub fn release(&self, chunk: ChunkRef) -> Result<()> {
        let (class, _) = self.size_class(chunk.len)?;
        self.free_lists.lock()?[class].push(chunk.offset);
        Ok(())
    }

    fn locate(&self, offset: u64, len: usize) -> Result<(usize, usize)> {
        let ext_idx = (offset / self.max_extent_bytes) as usize;
        let local = (offset % self.max_extent_bytes) as usize;
        if local + len > self.max_extent_bytes as usize {
            return Err(GristError::Abnormal(format!(
                "chunk window [{}, +{}) straddles an extent boundary",
                offset, len
            )));
        }
        Ok((ext_idx, local))
    }

    /// Copy-on-read window over `[offset, offset + len)`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (ext_idx, local) = self.locate(offset, len)?;
        let extents = self.extents.read()?;
        let extent = extents.get(ext_idx).ok_or_else(|| {
            GristError::Abnormal(format!("chunk read from unopened extent {}", ext_idx))
        })?;
        let mapping = extent.mmap.as_ref().ok_or_else(|| {
            GristError::Abnormal(format!("chunk extent {} not mapped", ext_idx))
        })?;
        if local + len > mapping.len() {
            return Err(GristError::Abnormal(format!(
                "chunk read past extent {} end: local {} len {}",
                ext_idx, local, len
            )));
        }
        Ok(mapping[local..local + len].to_vec())
    }

    /// Writes `data` at `offset`. The caller must have allocated the range.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (ext_idx, local) = self.locate(offset, data.len())?;
        let mut extents = self.extents.write()?;
        let extent = extents.get_mut(ext_idx).ok_or_else(|| {
            GristError::Abnormal(format!("chunk write to unopened extent {}", ext_idx))
        })?;
        let mapping = extent.mmap.as_mut().ok_or_else(|| {
            GristError::Abnormal(format!("chunk extent {} not mapped", ext_idx))
        })?;
        if local + data.len() > mapping.len() {
            return Err(GristError::Abnormal(format!(
                "chunk write past extent {} end: local {} len {}",
                ext_idx, local, data.len()
            )));
        }
        mapping[local..local + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        let extents = self.extents.read()?;
        for extent in extents.iter() {
            if let Some(ref mapping) = extent.mmap {
                mapping.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap(dir: &std::path::Path) -> ChunkHeap {
        ChunkHeap::open_with_extent_limit(dir.join("index"), 16, 0, 1 << 16).unwrap()
    }

    #[test]
    fn test_allocate_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let heap = test_heap(dir.path());
        let data = b"compressed run bytes".to_vec();
        let chunk = heap.allocate(data.len() as u64).unwrap();
        heap.write(chunk.offset, &data).unwrap();
        assert_eq!(heap.read(chunk.offset, data.len()).unwrap(), data);
    }

    #[test]
    fn test_release_reuses_space() {
        let dir = tempfile::tempdir().unwrap();
        let heap = test_heap(dir.path());
        let first = heap.allocate(100).unwrap();
        heap.release(first).unwrap();
        let second = heap.allocate(100).unwrap();
        assert_eq!(second.offset, first.offset);
    }

    #[test]
    fn test_runs_do_not_straddle_extents() {
        let dir = tempfile::tempdir().unwrap();
        let heap = test_heap(dir.path());
        // Fill most of the first 64 KiB extent, then force a spill.
        heap.allocate(60_000).unwrap();
        let spilled = heap.allocate(10_000).unwrap();
        assert_eq!(spilled.offset, 1 << 16);
        heap.write(spilled.offset, &vec![7u8; 10_000]).unwrap();
        assert_eq!(heap.read(spilled.offset, 10_000).unwrap(), vec![7u8; 10_000]);
    }

    #[test]
    fn test_oversized_run_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let heap = test_heap(dir.path());
        assert!(matches!(
            heap.allocate(1 << 20),
            Err(GristError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_reopen_resumes_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![3u8; 512];
        let (offset, used) = {
            let heap = test_heap(dir.path());
            let chunk = heap.allocate(data.len() as u64).unwrap();
            heap.write(chunk.offset, &data).unwrap();
            heap.sync_all().unwrap();
            (chunk.offset, heap.used().unwrap())
        };
        let heap =
            ChunkHeap::open_with_extent_limit(dir.path().join("index"), 16, used, 1 << 16).unwrap();
        assert_eq!(heap.read(offset, data.len()).unwrap(), data);
        let fresh = heap.allocate(64).unwrap();
        assert!(fresh.offset >= used);
    }
}
