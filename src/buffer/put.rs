//! Ordered insert into a term's buffered record chain.
//!
//! The chain is kept in strictly ascending docid order by a linear walk.
//! The walk doubles as a verification pass: any order violation or
//! unreadable record means the chain is damaged, and the list is reset
//! (records leak until the segment is retired) rather than propagated as
//! a hard error. Corruption here is private to one term.
//!
//! Long-range `jump` pointers are maintained with a binary-counter scheme:
//! after the n-th insert, with k the number of trailing zero bits of n,
//! the record 2^k positions back receives a jump to the new record. Jumps
//! always point from a smaller docid to a larger one; the insert path
//! never creates a backward or self jump, so chasing jumps cannot cycle.

use log::warn;

use crate::doc::Posting;
use crate::segment::SegmentGuard;
use crate::Result;

use super::{
    alloc_record, record_bytes, record_meta, reset_slot_list, set_record_jump, set_record_step,
    set_slot_buf_bytes, set_slot_count, set_slot_head, slot_buf_bytes, slot_count, slot_head,
    tombstone_record, write_record, NIL_OFF,
};

/// Inserts `posting` into the chain of `slot_idx`.
///
/// The caller has verified there is room (`free >= record_bytes`); running
/// out of space here is still surfaced as `ResourceExhausted`, never as a
/// partial insert. A whole-document marker (`sid == 0`) additionally kills
/// every live record of the same `rid` already in the chain; an exact
/// docid match unlinks the superseded record.
pub(crate) fn buffer_put(
    guard: &SegmentGuard<'_>,
    slot_idx: u32,
    posting: &Posting,
    max_jump_depth: usize,
) -> Result<()> {
    let bytes = record_bytes(posting);
    let new_off = alloc_record(guard, bytes)?;
    write_record(guard, new_off, posting)?;
    let new_packed = posting.doc.pack();
    let whole_doc = posting.doc.is_whole_doc();

    'restart: loop {
        let mut visited: Vec<u32> = Vec::new();
        let mut prev = NIL_OFF;
        let mut last_packed: Option<u64> = None;
        let mut cur = slot_head(guard, slot_idx)?;
        while cur != NIL_OFF {
            let meta = match record_meta(guard, cur) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(
                        "segment {} slot {}: {:?}; resetting term chain",
                        guard.segment_id(),
                        slot_idx,
                        err
                    );
                    reset_slot_list(guard, slot_idx)?;
                    continue 'restart;
                }
            };
            let packed = meta.doc.pack();
            if last_packed.map(|last| packed <= last).unwrap_or(false) {
                warn!(
                    "segment {} slot {}: docid order violated at offset {}; resetting term chain",
                    guard.segment_id(),
                    slot_idx,
                    cur
                );
                reset_slot_list(guard, slot_idx)?;
                continue 'restart;
            }
            if packed == new_packed {
                // Superseded record: unlink it so the chain never holds two
                // entries for one docid.
                if prev == NIL_OFF {
                    set_slot_head(guard, slot_idx, meta.step)?;
                } else {
                    set_record_step(guard, prev, meta.step)?;
                }
                tombstone_record(guard, cur)?;
                let count = slot_count(guard, slot_idx)?;
                set_slot_count(guard, slot_idx, count.saturating_sub(1))?;
                let tracked = slot_buf_bytes(guard, slot_idx)?;
                set_slot_buf_bytes(
                    guard,
                    slot_idx,
                    tracked.saturating_sub(super::RECORD_HEADER_BYTES + 4 * meta.npos),
                )?;
                cur = meta.step;
                continue;
            }
            if packed > new_packed {
                break;
            }
            last_packed = Some(packed);
            visited.push(cur);
            prev = cur;
            cur = meta.step;
        }

        if whole_doc {
            // Every record of this rid sorts after the (rid, 0) marker;
            // kill them in place without unlinking.
            let mut scan = cur;
            let mut scan_last = new_packed;
            while scan != NIL_OFF {
                let meta = match record_meta(guard, scan) {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!(
                            "segment {} slot {}: {:?}; resetting term chain",
                            guard.segment_id(),
                            slot_idx,
                            err
                        );
                        reset_slot_list(guard, slot_idx)?;
                        continue 'restart;
                    }
                };
                let packed = meta.doc.pack();
                if packed <= scan_last {
                    warn!(
                        "segment {} slot {}: docid order violated at offset {}; resetting term chain",
                        guard.segment_id(),
                        slot_idx,
                        scan
                    );
                    reset_slot_list(guard, slot_idx)?;
                    continue 'restart;
                }
                scan_last = packed;
                if meta.doc.rid != posting.doc.rid {
                    break;
                }
                if meta.tf != 0 {
                    tombstone_record(guard, scan)?;
                }
                scan = meta.step;
            }
        }

        // Splice in between prev and cur.
        set_record_step(guard, new_off, cur)?;
        if prev == NIL_OFF {
            set_slot_head(guard, slot_idx, new_off)?;
        } else {
            set_record_step(guard, prev, new_off)?;
        }
        let count = slot_count(guard, slot_idx)? + 1;
        set_slot_count(guard, slot_idx, count)?;
        let tracked = slot_buf_bytes(guard, slot_idx)?;
        set_slot_buf_bytes(guard, slot_idx, tracked + bytes)?;

        let k = count.trailing_zeros().min(max_jump_depth.min(31) as u32);
        if k >= 1 {
            let back = 1usize << k;
            if visited.len() >= back {
                // All visited records carry a smaller docid than the new
                // one, so this jump always points forward.
                let ancestor = visited[visited.len() - back];
                set_record_jump(guard, ancestor, new_off)?;
            }
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{
        add_slot, check_segment, init_buffer, record_meta, record_posting, JUMP_TOMBSTONE,
    };
    use crate::config::{EngineConfig, DEFAULT_MAX_JUMP_DEPTH};
    use crate::doc::DocAddr;
    use crate::segment::SegmentArena;

    fn test_arena(dir: &std::path::Path) -> SegmentArena {
        let config = EngineConfig {
            segment_size: 1 << 14,
            max_segments: 8,
            ..EngineConfig::default()
        };
        SegmentArena::create(&dir.join("arena.seg"), &config).unwrap()
    }

    fn chain(guard: &SegmentGuard<'_>, slot_idx: u32) -> Vec<Posting> {
        let mut out = Vec::new();
        let mut cur = slot_head(guard, slot_idx).unwrap();
        while cur != NIL_OFF {
            let (posting, step) = record_posting(guard, cur).unwrap();
            out.push(posting);
            cur = step;
        }
        out
    }

    fn put(guard: &SegmentGuard<'_>, slot_idx: u32, posting: &Posting) {
        buffer_put(guard, slot_idx, posting, DEFAULT_MAX_JUMP_DEPTH).unwrap();
    }

    #[test]
    fn test_inserts_keep_docid_order() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let slot = add_slot(&guard, 1).unwrap();
        for &(rid, sid) in &[(5u32, 1u32), (2, 1), (5, 3), (2, 2), (9, 1)] {
            put(&guard, slot, &Posting::new(DocAddr::new(rid, sid), 1, 0, &[0]));
        }
        let docs: Vec<(u32, u32)> = chain(&guard, slot)
            .iter()
            .map(|posting| (posting.doc.rid, posting.doc.sid))
            .collect();
        assert_eq!(docs, vec![(2, 1), (2, 2), (5, 1), (5, 3), (9, 1)]);
        assert_eq!(check_segment(&guard).unwrap(), 0);
    }

    #[test]
    fn test_same_docid_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let slot = add_slot(&guard, 1).unwrap();
        put(&guard, slot, &Posting::new(DocAddr::new(4, 1), 2, 0, &[1, 3]));
        put(&guard, slot, &Posting::new(DocAddr::new(4, 1), 1, 7, &[8]));
        let postings = chain(&guard, slot);
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].tf, 1);
        assert_eq!(postings[0].score, 7);
        assert_eq!(postings[0].positions.as_slice(), &[8]);
        assert_eq!(check_segment(&guard).unwrap(), 0);
    }

    #[test]
    fn test_whole_doc_marker_kills_sections() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let slot = add_slot(&guard, 1).unwrap();
        for &(rid, sid) in &[(3u32, 1u32), (3, 2), (4, 1)] {
            put(&guard, slot, &Posting::new(DocAddr::new(rid, sid), 1, 0, &[0]));
        }
        put(&guard, slot, &Posting::delete_marker(DocAddr::whole_doc(3)));
        let postings = chain(&guard, slot);
        // Marker first, then the two dead rid-3 records, then live rid 4.
        assert_eq!(postings.len(), 4);
        assert!(postings[0].doc.is_whole_doc());
        assert_eq!(postings[1].tf, 0);
        assert_eq!(postings[2].tf, 0);
        assert_eq!(postings[3].doc, DocAddr::new(4, 1));
        assert_eq!(postings[3].tf, 1);
    }

    #[test]
    fn test_jump_pointers_advance() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let slot = add_slot(&guard, 1).unwrap();
        for rid in 1..=32u32 {
            put(&guard, slot, &Posting::new(DocAddr::new(rid, 1), 1, 0, &[]));
        }
        let mut jumps = 0;
        let mut cur = slot_head(&guard, slot).unwrap();
        while cur != NIL_OFF {
            let meta = record_meta(&guard, cur).unwrap();
            if meta.jump != NIL_OFF && meta.jump != JUMP_TOMBSTONE {
                let target = record_meta(&guard, meta.jump).unwrap();
                assert!(target.doc.pack() > meta.doc.pack());
                jumps += 1;
            }
            cur = meta.step;
        }
        assert!(jumps > 0);
        assert_eq!(check_segment(&guard).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_chain_resets_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let arena = test_arena(dir.path());
        let guard = arena.acquire(1).unwrap();
        init_buffer(&guard, 0).unwrap();
        let slot = add_slot(&guard, 1).unwrap();
        put(&guard, slot, &Posting::new(DocAddr::new(1, 1), 1, 0, &[]));
        put(&guard, slot, &Posting::new(DocAddr::new(2, 1), 1, 0, &[]));
        // Break the head link so it points into the free middle.
        set_slot_head(&guard, slot, crate::buffer::BUFFER_HEADER_BYTES + 64).unwrap();
        put(&guard, slot, &Posting::new(DocAddr::new(3, 1), 1, 0, &[]));
        // The damaged chain was reset; only the newest insert survives.
        let postings = chain(&guard, slot);
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].doc, DocAddr::new(3, 1));
        assert_eq!(check_segment(&guard).unwrap(), 0);
    }
}
