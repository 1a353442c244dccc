//! Mutable buffer segments.
//!
//! A buffer segment hosts the in-place-updatable postings of many terms.
//! Its layout, all offsets relative to the segment start:
//!
//! ```text
//! [ header 32B ][ term slots 24B each, growing up ] ... free ... [ record heap, growing down ]
//! ```
//!
//! The record heap grows downward from the segment end; `free` in the
//! header is the byte count of the unused middle, so the heap floor is
//! always `slots_end + free`. Term slots are never moved while the segment
//! is live; a flushed-away term leaves a void slot behind.
//!
//! Records of one term form a singly linked list in ascending docid order
//! (`step` pointers), with sparse long-range `jump` pointers layered on top
//! by the insert path. Offset 0 is the header, so 0 doubles as the nil
//! link. A `jump` of 1 marks a dead (tombstoned or unlinked) record.

use log::warn;
use smallvec::SmallVec;

use crate::doc::{DocAddr, Posting};
use crate::error::DataCorruption;
use crate::segment::SegmentGuard;
use crate::{GristError, Result};

mod put;

pub(crate) use put::buffer_put;

pub(crate) const BUFFER_HEADER_BYTES: u32 = 32;
pub(crate) const SLOT_BYTES: u32 = 24;
pub(crate) const RECORD_HEADER_BYTES: u32 = 28;

/// Nil link in a record chain.
pub(crate) const NIL_OFF: u32 = 0;
/// `tid` of a void slot (term flushed away entirely).
pub(crate) const VOID_TID: u32 = u32::MAX;
/// Header `chunk_off` meaning "this buffer has no chunk region yet".
pub(crate) const NO_CHUNK: u32 = u32::MAX;
/// `jump` value marking a dead record.
pub(crate) const JUMP_TOMBSTONE: u32 = 1;

// Header field offsets.
const HDR_CHUNK_OFF: u32 = 0;
const HDR_CHUNK_LEN: u32 = 4;
const HDR_FREE: u32 = 8;
const HDR_NTERMS: u32 = 12;
const HDR_NVOIDS: u32 = 16;
const HDR_BUCKET: u32 = 20;

// Slot field offsets.
const SLOT_TID: u32 = 0;
const SLOT_CHUNK_OFF: u32 = 4;
const SLOT_CHUNK_LEN: u32 = 8;
const SLOT_HEAD: u32 = 12;
const SLOT_BUF_BYTES: u32 = 16;
const SLOT_COUNT: u32 = 20;

// Record field offsets.
const REC_RID: u32 = 0;
const REC_SID: u32 = 4;
const REC_TF: u32 = 8;
const REC_SCORE: u32 = 12;
const REC_NPOS: u32 = 16;
const REC_STEP: u32 = 20;
const REC_JUMP: u32 = 24;

pub(crate) fn init_buffer(guard: &SegmentGuard<'_>, bucket: u32) -> Result<()> {
    guard.write_u32(HDR_CHUNK_OFF, NO_CHUNK)?;
    guard.write_u32(HDR_CHUNK_LEN, 0)?;
    guard.write_u32(HDR_FREE, guard.segment_size() - BUFFER_HEADER_BYTES)?;
    guard.write_u32(HDR_NTERMS, 0)?;
    guard.write_u32(HDR_NVOIDS, 0)?;
    guard.write_u32(HDR_BUCKET, bucket)
}

pub(crate) fn header_chunk(guard: &SegmentGuard<'_>) -> Result<Option<(u32, u32)>> {
    let off = guard.read_u32(HDR_CHUNK_OFF)?;
    if off == NO_CHUNK {
        return Ok(None);
    }
    Ok(Some((off, guard.read_u32(HDR_CHUNK_LEN)?)))
}

pub(crate) fn set_header_chunk(guard: &SegmentGuard<'_>, chunk: Option<(u32, u32)>) -> Result<()> {
    let (off, len) = chunk.unwrap_or((NO_CHUNK, 0));
    guard.write_u32(HDR_CHUNK_OFF, off)?;
    guard.write_u32(HDR_CHUNK_LEN, len)
}

pub(crate) fn header_free(guard: &SegmentGuard<'_>) -> Result<u32> {
    guard.read_u32(HDR_FREE)
}

pub(crate) fn header_nterms(guard: &SegmentGuard<'_>) -> Result<u32> {
    guard.read_u32(HDR_NTERMS)
}

pub(crate) fn header_nvoids(guard: &SegmentGuard<'_>) -> Result<u32> {
    guard.read_u32(HDR_NVOIDS)
}

pub(crate) fn header_bucket(guard: &SegmentGuard<'_>) -> Result<u32> {
    guard.read_u32(HDR_BUCKET)
}

fn slot_off(idx: u32) -> u32 {
    BUFFER_HEADER_BYTES + idx * SLOT_BYTES
}

pub(crate) fn slot_tid(guard: &SegmentGuard<'_>, idx: u32) -> Result<u32> {
    guard.read_u32(slot_off(idx) + SLOT_TID)
}

pub(crate) fn slot_chunk(guard: &SegmentGuard<'_>, idx: u32) -> Result<(u32, u32)> {
    Ok((
        guard.read_u32(slot_off(idx) + SLOT_CHUNK_OFF)?,
        guard.read_u32(slot_off(idx) + SLOT_CHUNK_LEN)?,
    ))
}

pub(crate) fn set_slot_chunk(
    guard: &SegmentGuard<'_>,
    idx: u32,
    chunk_off: u32,
    chunk_len: u32,
) -> Result<()> {
    guard.write_u32(slot_off(idx) + SLOT_CHUNK_OFF, chunk_off)?;
    guard.write_u32(slot_off(idx) + SLOT_CHUNK_LEN, chunk_len)
}

pub(crate) fn slot_head(guard: &SegmentGuard<'_>, idx: u32) -> Result<u32> {
    guard.read_u32(slot_off(idx) + SLOT_HEAD)
}

pub(crate) fn set_slot_head(guard: &SegmentGuard<'_>, idx: u32, head: u32) -> Result<()> {
    guard.write_u32(slot_off(idx) + SLOT_HEAD, head)
}

pub(crate) fn slot_buf_bytes(guard: &SegmentGuard<'_>, idx: u32) -> Result<u32> {
    guard.read_u32(slot_off(idx) + SLOT_BUF_BYTES)
}

pub(crate) fn set_slot_buf_bytes(guard: &SegmentGuard<'_>, idx: u32, bytes: u32) -> Result<()> {
    guard.write_u32(slot_off(idx) + SLOT_BUF_BYTES, bytes)
}

pub(crate) fn slot_count(guard: &SegmentGuard<'_>, idx: u32) -> Result<u32> {
    guard.read_u32(slot_off(idx) + SLOT_COUNT)
}

pub(crate) fn set_slot_count(guard: &SegmentGuard<'_>, idx: u32, count: u32) -> Result<()> {
    guard.write_u32(slot_off(idx) + SLOT_COUNT, count)
}

/// First byte past the slot table.
pub(crate) fn slots_end(guard: &SegmentGuard<'_>) -> Result<u32> {
    Ok(slot_off(header_nterms(guard)?))
}

/// Byte floor of the record heap: everything at or above it is allocated.
pub(crate) fn heap_low(guard: &SegmentGuard<'_>) -> Result<u32> {
    Ok(slots_end(guard)? + header_free(guard)?)
}

/// Finds the slot of `tid`, if the term lives in this buffer.
pub(crate) fn find_slot(guard: &SegmentGuard<'_>, tid: u32) -> Result<Option<u32>> {
    for idx in 0..header_nterms(guard)? {
        if slot_tid(guard, idx)? == tid {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

/// Claims a slot for `tid`: a void slot when one exists, else a fresh one
/// carved out of free space.
pub(crate) fn add_slot(guard: &SegmentGuard<'_>, tid: u32) -> Result<u32> {
    debug_assert!(tid != VOID_TID);
    let nterms = header_nterms(guard)?;
    let idx = if header_nvoids(guard)? > 0 {
        let mut reused = None;
        for idx in 0..nterms {
            if slot_tid(guard, idx)? == VOID_TID {
                reused = Some(idx);
                break;
            }
        }
        match reused {
            Some(idx) => {
                guard.write_u32(HDR_NVOIDS, header_nvoids(guard)? - 1)?;
                idx
            }
            None => {
                // Stale void count. Repair and fall through to a fresh slot.
                warn!(
                    "buffer segment {}: nvoids > 0 but no void slot found",
                    guard.segment_id()
                );
                guard.write_u32(HDR_NVOIDS, 0)?;
                new_slot(guard, nterms)?
            }
        }
    } else {
        new_slot(guard, nterms)?
    };
    let base = slot_off(idx);
    guard.write_u32(base + SLOT_TID, tid)?;
    guard.write_u32(base + SLOT_CHUNK_OFF, 0)?;
    guard.write_u32(base + SLOT_CHUNK_LEN, 0)?;
    guard.write_u32(base + SLOT_HEAD, NIL_OFF)?;
    guard.write_u32(base + SLOT_BUF_BYTES, 0)?;
    guard.write_u32(base + SLOT_COUNT, 0)?;
    Ok(idx)
}

fn new_slot(guard: &SegmentGuard<'_>, nterms: u32) -> Result<u32> {
    let free = header_free(guard)?;
    if free < SLOT_BYTES {
        return Err(GristError::ResourceExhausted(format!(
            "buffer segment {} has no room for a new term slot",
            guard.segment_id()
        )));
    }
    guard.write_u32(HDR_FREE, free - SLOT_BYTES)?;
    guard.write_u32(HDR_NTERMS, nterms + 1)?;
    Ok(nterms)
}

/// Marks a slot void. Its records stay in the heap until the segment is
/// retired.
pub(crate) fn void_slot(guard: &SegmentGuard<'_>, idx: u32) -> Result<()> {
    let base = slot_off(idx);
    guard.write_u32(base + SLOT_TID, VOID_TID)?;
    guard.write_u32(base + SLOT_CHUNK_OFF, 0)?;
    guard.write_u32(base + SLOT_CHUNK_LEN, 0)?;
    guard.write_u32(base + SLOT_HEAD, NIL_OFF)?;
    guard.write_u32(base + SLOT_BUF_BYTES, 0)?;
    guard.write_u32(base + SLOT_COUNT, 0)?;
    guard.write_u32(HDR_NVOIDS, header_nvoids(guard)? + 1)
}

/// Bytes a record for `posting` occupies in the heap.
pub(crate) fn record_bytes(posting: &Posting) -> u32 {
    RECORD_HEADER_BYTES + 4 * posting.positions.len() as u32
}

/// Carves `bytes` off the bottom of the free middle; the heap grows down.
pub(crate) fn alloc_record(guard: &SegmentGuard<'_>, bytes: u32) -> Result<u32> {
    let free = header_free(guard)?;
    if free < bytes {
        return Err(GristError::ResourceExhausted(format!(
            "buffer segment {} heap full ({} bytes free, {} needed)",
            guard.segment_id(),
            free,
            bytes
        )));
    }
    let new_free = free - bytes;
    guard.write_u32(HDR_FREE, new_free)?;
    Ok(slots_end(guard)? + new_free)
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RecordMeta {
    pub doc: DocAddr,
    pub tf: u32,
    pub score: u32,
    pub npos: u32,
    pub step: u32,
    pub jump: u32,
}

/// Reads a record header, validating the offset against the current heap
/// extent. A bad offset is reported as corruption, not a panic.
pub(crate) fn record_meta(guard: &SegmentGuard<'_>, off: u32) -> Result<RecordMeta> {
    let floor = heap_low(guard)?;
    let seg_size = guard.segment_size();
    let header_end = off.checked_add(RECORD_HEADER_BYTES);
    if off < floor || header_end.map_or(true, |end| end > seg_size) {
        return Err(DataCorruption::comment_only(format!(
            "record offset {} outside heap [{}, {}) in segment {}",
            off,
            floor,
            seg_size,
            guard.segment_id()
        ))
        .into());
    }
    let meta = RecordMeta {
        doc: DocAddr::new(guard.read_u32(off + REC_RID)?, guard.read_u32(off + REC_SID)?),
        tf: guard.read_u32(off + REC_TF)?,
        score: guard.read_u32(off + REC_SCORE)?,
        npos: guard.read_u32(off + REC_NPOS)?,
        step: guard.read_u32(off + REC_STEP)?,
        jump: guard.read_u32(off + REC_JUMP)?,
    };
    let record_end = meta
        .npos
        .checked_mul(4)
        .and_then(|pos_bytes| (off + RECORD_HEADER_BYTES).checked_add(pos_bytes));
    if record_end.map_or(true, |end| end > seg_size) {
        return Err(DataCorruption::comment_only(format!(
            "record at {} claims {} positions past segment end",
            off, meta.npos
        ))
        .into());
    }
    Ok(meta)
}

/// Reads a full record: posting plus its forward link.
pub(crate) fn record_posting(guard: &SegmentGuard<'_>, off: u32) -> Result<(Posting, u32)> {
    let meta = record_meta(guard, off)?;
    let mut positions: SmallVec<[u32; 4]> = SmallVec::with_capacity(meta.npos as usize);
    for pos_idx in 0..meta.npos {
        positions.push(guard.read_u32(off + RECORD_HEADER_BYTES + pos_idx * 4)?);
    }
    Ok((
        Posting {
            doc: meta.doc,
            tf: meta.tf,
            score: meta.score,
            positions,
        },
        meta.step,
    ))
}

/// Copies a term's record chain out of the segment, raw markers included.
/// Cursors read from the copy, so a flush rewriting the segment in place
/// cannot pull the heap out from under an open reader.
pub(crate) fn snapshot_chain(guard: &SegmentGuard<'_>, head: u32) -> Result<Vec<Posting>> {
    let floor = heap_low(guard)?;
    let max_chain = (guard.segment_size() - floor) / RECORD_HEADER_BYTES + 1;
    let mut postings = Vec::new();
    let mut cur = head;
    while cur != NIL_OFF {
        if postings.len() as u32 >= max_chain {
            return Err(DataCorruption::comment_only(format!(
                "record chain cycle suspected in segment {}",
                guard.segment_id()
            ))
            .into());
        }
        let (posting, step) = record_posting(guard, cur)?;
        postings.push(posting);
        cur = step;
    }
    Ok(postings)
}

/// Writes a fresh, unlinked record at `off`.
pub(crate) fn write_record(guard: &SegmentGuard<'_>, off: u32, posting: &Posting) -> Result<()> {
    guard.write_u32(off + REC_RID, posting.doc.rid)?;
    guard.write_u32(off + REC_SID, posting.doc.sid)?;
    guard.write_u32(off + REC_TF, posting.tf)?;
    guard.write_u32(off + REC_SCORE, posting.score)?;
    guard.write_u32(off + REC_NPOS, posting.positions.len() as u32)?;
    guard.write_u32(off + REC_STEP, NIL_OFF)?;
    guard.write_u32(off + REC_JUMP, NIL_OFF)?;
    for (pos_idx, &position) in posting.positions.iter().enumerate() {
        guard.write_u32(off + RECORD_HEADER_BYTES + pos_idx as u32 * 4, position)?;
    }
    Ok(())
}

pub(crate) fn set_record_step(guard: &SegmentGuard<'_>, off: u32, step: u32) -> Result<()> {
    guard.write_u32(off + REC_STEP, step)
}

pub(crate) fn set_record_jump(guard: &SegmentGuard<'_>, off: u32, jump: u32) -> Result<()> {
    guard.write_u32(off + REC_JUMP, jump)
}

/// Marks a record dead: zero tf (cursors skip it) and a tombstone jump.
pub(crate) fn tombstone_record(guard: &SegmentGuard<'_>, off: u32) -> Result<()> {
    guard.write_u32(off + REC_TF, 0)?;
    guard.write_u32(off + REC_JUMP, JUMP_TOMBSTONE)
}

/// How many live terms a buffer of this geometry may host. Shrinks as the
/// buffer's chunk region grows, so that chunk-heavy buffers flush more and
/// accept fewer newcomers.
fn term_density_limit(segment_size: u32, chunk_len: u32) -> u32 {
    let base = (segment_size / 256).max(8);
    let shrink = 1 + chunk_len / segment_size.max(1);
    (base / shrink).max(8)
}

/// Whether this buffer can host `need` more bytes for one more term.
pub(crate) fn capable(guard: &SegmentGuard<'_>, need: u32) -> Result<bool> {
    if header_free(guard)? < need {
        return Ok(false);
    }
    let live = header_nterms(guard)? - header_nvoids(guard)?;
    let chunk_len = header_chunk(guard)?.map(|(_, len)| len).unwrap_or(0);
    Ok(live < term_density_limit(guard.segment_size(), chunk_len))
}

/// Clears a term's record chain after a detected inconsistency. The chain's
/// records leak until the next flush retires the segment; buffered postings
/// of the term are lost but the shared structures stay intact.
pub(crate) fn reset_slot_list(guard: &SegmentGuard<'_>, idx: u32) -> Result<()> {
    set_slot_head(guard, idx, NIL_OFF)?;
    set_slot_count(guard, idx, 0)?;
    set_slot_buf_bytes(guard, idx, 0)
}

/// Resets the record heap to empty after a flush dropped every chain.
/// Free space becomes everything between the slot table and the segment
/// end again.
pub(crate) fn reclaim_heap(guard: &SegmentGuard<'_>) -> Result<()> {
    let nterms = header_nterms(guard)?;
    guard.write_u32(
        HDR_FREE,
        guard.segment_size() - BUFFER_HEADER_BYTES - nterms * SLOT_BYTES,
    )
}

/// Structural check of one buffer segment. Returns the number of problems
/// found; each is logged at warn level.
pub(crate) fn check_segment(guard: &SegmentGuard<'_>) -> Result<usize> {
    let mut errors = 0usize;
    let seg = guard.segment_id();
    let seg_size = guard.segment_size();
    let nterms = header_nterms(guard)?;
    let free = header_free(guard)?;
    if BUFFER_HEADER_BYTES + nterms * SLOT_BYTES + free > seg_size {
        warn!(
            "segment {}: free accounting exceeds segment size (nterms={} free={})",
            seg, nterms, free
        );
        return Ok(1);
    }
    let floor = heap_low(guard)?;
    // A chain can hold at most one record per heap byte slot.
    let max_chain = (seg_size - floor) / RECORD_HEADER_BYTES + 1;
    let (_, header_chunk_len) = header_chunk(guard)?.unwrap_or((0, 0));
    for idx in 0..nterms {
        if slot_tid(guard, idx)? == VOID_TID {
            continue;
        }
        let (chunk_off, chunk_len) = slot_chunk(guard, idx)?;
        let run_end = chunk_off.checked_add(chunk_len);
        if chunk_len > 0 && run_end.map_or(true, |end| end > header_chunk_len) {
            warn!(
                "segment {} slot {}: chunk run [{}, +{}) outside buffer chunk region of {} bytes",
                seg, idx, chunk_off, chunk_len, header_chunk_len
            );
            errors += 1;
        }
        errors += check_chain(guard, idx, floor, max_chain)?;
    }
    Ok(errors)
}

fn check_chain(guard: &SegmentGuard<'_>, idx: u32, floor: u32, max_chain: u32) -> Result<usize> {
    let seg = guard.segment_id();
    let mut errors = 0usize;
    let mut reachable: Vec<u32> = Vec::new();
    let mut last_packed: Option<u64> = None;
    let mut cur = slot_head(guard, idx)?;
    while cur != NIL_OFF {
        if reachable.len() as u32 >= max_chain {
            warn!("segment {} slot {}: record chain cycle suspected", seg, idx);
            return Ok(errors + 1);
        }
        let meta = match record_meta(guard, cur) {
            Ok(meta) => meta,
            Err(_) => {
                warn!(
                    "segment {} slot {}: unreadable record at offset {}",
                    seg, idx, cur
                );
                return Ok(errors + 1);
            }
        };
        let packed = meta.doc.pack();
        if let Some(last) = last_packed {
            if packed <= last {
                warn!(
                    "segment {} slot {}: docid order violated at offset {}",
                    seg, idx, cur
                );
                return Ok(errors + 1);
            }
        }
        last_packed = Some(packed);
        if floor > cur {
            // record_meta already rejects this; belt for future layouts.
            errors += 1;
        }
        reachable.push(cur);
        cur = meta.step;
    }
    if reachable.len() as u32 != slot_count(guard, idx)? {
        warn!(
            "segment {} slot {}: chain length {} != recorded count {}",
            seg,
            idx,
            reachable.len(),
            slot_count(guard, idx)?
        );
        errors += 1;
    }
    // Jump pointers must land on a reachable record with a larger docid.
    // A jump to an unlinked record is stale, not corrupt; it is ignored
    // here and lazily overwritten by later inserts.
    reachable.sort_unstable();
    for &off in &reachable {
        let meta = record_meta(guard, off)?;
        if meta.jump == NIL_OFF || meta.jump == JUMP_TOMBSTONE {
            continue;
        }
        if reachable.binary_search(&meta.jump).is_err() {
            continue;
        }
        let target = record_meta(guard, meta.jump)?;
        if target.doc.pack() <= meta.doc.pack() {
            warn!(
                "segment {} slot {}: jump from {} to {} does not advance",
                seg, idx, off, meta.jump
            );
            errors += 1;
        }
    }
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::segment::SegmentArena;

    fn test_arena(dir: &std::path::Path) -> SegmentArena {
        let config = EngineConfig {
            segment_size: 1 << 12,
            max_segments: 8,
            ..EngineConfig::default()
        };
        SegmentArena::create(&dir.join("arena.seg"), &config).unwrap()
    }

    #[test]
    fn test_init_and_slot_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 3).unwrap();
        assert_eq!(header_bucket(&guard).unwrap(), 3);
        assert_eq!(header_free(&guard).unwrap(), (1 << 12) - BUFFER_HEADER_BYTES);
        assert_eq!(header_chunk(&guard).unwrap(), None);

        let idx = add_slot(&guard, 42).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(find_slot(&guard, 42).unwrap(), Some(0));
        assert_eq!(find_slot(&guard, 43).unwrap(), None);
        assert_eq!(slot_head(&guard, idx).unwrap(), NIL_OFF);
        assert_eq!(
            header_free(&guard).unwrap(),
            (1 << 12) - BUFFER_HEADER_BYTES - SLOT_BYTES
        );
    }

    #[test]
    fn test_void_slot_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let a = add_slot(&guard, 1).unwrap();
        let _b = add_slot(&guard, 2).unwrap();
        void_slot(&guard, a).unwrap();
        assert_eq!(header_nvoids(&guard).unwrap(), 1);
        let c = add_slot(&guard, 3).unwrap();
        assert_eq!(c, a);
        assert_eq!(header_nvoids(&guard).unwrap(), 0);
        assert_eq!(header_nterms(&guard).unwrap(), 2);
    }

    #[test]
    fn test_record_roundtrip_and_heap_floor() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        add_slot(&guard, 7).unwrap();
        let posting = Posting::new(DocAddr::new(9, 2), 3, 11, &[1, 4, 6]);
        let bytes = record_bytes(&posting);
        let off = alloc_record(&guard, bytes).unwrap();
        assert_eq!(off, heap_low(&guard).unwrap());
        assert_eq!(off + bytes, guard.segment_size());
        write_record(&guard, off, &posting).unwrap();
        let (read_back, step) = record_posting(&guard, off).unwrap();
        assert_eq!(read_back, posting);
        assert_eq!(step, NIL_OFF);
    }

    #[test]
    fn test_record_meta_rejects_free_space_offset() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        // Offset inside the free middle, below the heap floor.
        assert!(record_meta(&guard, BUFFER_HEADER_BYTES + 100).is_err());
    }

    #[test]
    fn test_record_meta_rejects_offset_near_u32_max() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        // Adding the header size to this offset would wrap around u32.
        assert!(record_meta(&guard, u32::MAX - 4).is_err());
    }

    #[test]
    fn test_record_meta_rejects_wrapping_position_count() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let posting = Posting::new(DocAddr::new(1, 1), 1, 0, &[]);
        let off = alloc_record(&guard, record_bytes(&posting)).unwrap();
        write_record(&guard, off, &posting).unwrap();
        // A position count whose byte size wraps u32 must be corruption,
        // not an arithmetic panic.
        guard.write_u32(off + REC_NPOS, u32::MAX).unwrap();
        assert!(record_meta(&guard, off).is_err());
    }

    #[test]
    fn test_check_segment_counts_wrapping_chunk_run() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let idx = add_slot(&guard, 5).unwrap();
        set_header_chunk(&guard, Some((0, 64))).unwrap();
        set_slot_chunk(&guard, idx, u32::MAX - 2, 8).unwrap();
        assert_eq!(check_segment(&guard).unwrap(), 1);
    }

    #[test]
    fn test_snapshot_chain_copies_records() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let idx = add_slot(&guard, 9).unwrap();
        let first = Posting::new(DocAddr::new(2, 1), 1, 0, &[4]);
        let second = Posting::new(DocAddr::new(6, 1), 2, 0, &[1, 8]);
        for posting in [&first, &second] {
            buffer_put(&guard, idx, posting, 4).unwrap();
        }
        let copied = snapshot_chain(&guard, slot_head(&guard, idx).unwrap()).unwrap();
        assert_eq!(copied, vec![first, second]);
    }

    #[test]
    fn test_heap_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let free = header_free(&guard).unwrap();
        assert!(alloc_record(&guard, free + 1).is_err());
        alloc_record(&guard, free).unwrap();
        assert_eq!(header_free(&guard).unwrap(), 0);
    }

    #[test]
    fn test_density_limit_shrinks_with_chunk() {
        let no_chunk = term_density_limit(1 << 17, 0);
        let heavy = term_density_limit(1 << 17, 3 << 17);
        assert!(heavy < no_chunk);
        assert!(heavy >= 8);
    }
}
