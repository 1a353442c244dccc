//! Flush: re-encode a buffer segment's terms into fresh chunk runs.
//!
//! Flushing merges each term's buffered records with its existing chunk
//! run and writes the merged result as a new compressed run in the chunk
//! heap. The pass is commit-last: all merging and encoding happens into
//! owned memory and the new chunk region first, and only then are slots,
//! headers and locators rewritten. A failure before the commit point
//! leaves the segment exactly as it was.
//!
//! Per-term outcomes:
//! - no live postings left: the term's locator is emptied and the slot
//!   voided (the term dictionary is notified),
//! - exactly one posting, small enough: packed into an immediate locator,
//!   the slot voided,
//! - otherwise: a new chunk run, the slot kept with its chain reset.

use log::{debug, info, warn};

use crate::buffer;
use crate::chunk::{ChunkHeap, ChunkRef};
use crate::codec::encode_run;
use crate::config::EngineConfig;
use crate::doc::Posting;
use crate::engine::TermLexicon;
use crate::error::DataCorruption;
use crate::locator::{self, Locator, LocatorTable, SegRole, CONTROL_SEGMENT};
use crate::merge::{BufferStream, ChunkStream, MergedStream};
use crate::segment::{SegmentArena, SegmentId};
use crate::{GristError, Result};

enum SlotOutcome {
    Drop,
    Immediate(Locator),
    Run(Vec<u8>),
}

struct SlotPlan {
    idx: u32,
    tid: u32,
    outcome: SlotOutcome,
}

/// Drains one term's merged view into owned memory. `Ok(None)` means the
/// merge hit corruption; other errors propagate untouched.
fn collect_term(
    arena: &SegmentArena,
    heap: &ChunkHeap,
    config: &EngineConfig,
    seg: SegmentId,
    head: u32,
    chunk: Option<(u64, u32)>,
) -> Result<Option<Vec<Posting>>> {
    let chunk_stream = match chunk {
        Some((offset, len)) => ChunkStream::new(heap.read(offset, len as usize)?, config.tf_cap),
        None => ChunkStream::empty(),
    };
    let buf_stream = BufferStream::new(arena.acquire(seg)?, head);
    let mut merged = MergedStream::new(chunk_stream, buf_stream);
    let mut postings: Vec<Posting> = Vec::new();
    loop {
        match merged.next_live() {
            Ok(Some(posting)) => postings.push(posting),
            Ok(None) => return Ok(Some(postings)),
            Err(GristError::DataCorruption(_)) => return Ok(None),
            Err(other) => return Err(other),
        }
    }
}

/// Flushes one buffer segment. Readers opened before the commit keep
/// consuming the old chunk region; its space is only recycled afterwards.
pub(crate) fn flush_segment(
    arena: &SegmentArena,
    heap: &ChunkHeap,
    locators: &LocatorTable,
    config: &EngineConfig,
    seg: SegmentId,
    lexicon: Option<&dyn TermLexicon>,
) -> Result<()> {
    let guard = arena.acquire(seg)?;
    let old_region = buffer::header_chunk(&guard)?;
    let old_base = old_region.map(|(off, _)| u64::from(off) * heap.align());
    let nterms = buffer::header_nterms(&guard)?;

    // Phase 1: merge and encode every term into owned memory.
    let mut plans: Vec<SlotPlan> = Vec::new();
    let mut total_run_bytes = 0u64;
    for idx in 0..nterms {
        let tid = buffer::slot_tid(&guard, idx)?;
        if tid == buffer::VOID_TID {
            continue;
        }
        let (chunk_off, chunk_len) = buffer::slot_chunk(&guard, idx)?;
        let chunk = if chunk_len > 0 {
            let base = old_base.ok_or_else(|| {
                DataCorruption::comment_only(format!(
                    "segment {} slot {} references a chunk run but the buffer has no chunk region",
                    seg, idx
                ))
            })?;
            Some((base + u64::from(chunk_off), chunk_len))
        } else {
            None
        };
        let head = buffer::slot_head(&guard, idx)?;
        // Corruption in one term's postings costs that term, not the
        // flush: a damaged chunk run is dropped and its buffered records
        // kept; a damaged chain on top of that drops the term entirely.
        let postings = match collect_term(arena, heap, config, seg, head, chunk)? {
            Some(postings) => postings,
            None if chunk.is_some() => {
                warn!(
                    "segment {} slot {} (tid {}): corrupt chunk run, keeping buffered records only",
                    seg, idx, tid
                );
                match collect_term(arena, heap, config, seg, head, None)? {
                    Some(postings) => postings,
                    None => {
                        warn!(
                            "segment {} slot {} (tid {}): buffered chain also damaged, term lost",
                            seg, idx, tid
                        );
                        Vec::new()
                    }
                }
            }
            None => {
                warn!(
                    "segment {} slot {} (tid {}): buffered chain damaged, term lost",
                    seg, idx, tid
                );
                Vec::new()
            }
        };
        let outcome = if postings.is_empty() {
            SlotOutcome::Drop
        } else if postings.len() == 1 {
            match Locator::immediate_from(&postings[0]) {
                Some(immediate) => SlotOutcome::Immediate(immediate),
                None => {
                    let mut encoded = Vec::new();
                    encode_run(&postings, &mut encoded);
                    total_run_bytes += encoded.len() as u64;
                    SlotOutcome::Run(encoded)
                }
            }
        } else {
            let mut encoded = Vec::new();
            encode_run(&postings, &mut encoded);
            total_run_bytes += encoded.len() as u64;
            SlotOutcome::Run(encoded)
        };
        plans.push(SlotPlan { idx, tid, outcome });
    }

    // Phase 2: lay the new runs down in a fresh chunk region. Nothing
    // points at it yet, so this is still pre-commit.
    let new_region: Option<ChunkRef> = if total_run_bytes > 0 {
        Some(heap.allocate(total_run_bytes)?)
    } else {
        None
    };
    let mut run_offsets: Vec<(u32, u32, u32)> = Vec::new();
    if let Some(region) = new_region {
        let mut cursor = 0u64;
        for plan in &plans {
            if let SlotOutcome::Run(ref encoded) = plan.outcome {
                heap.write(region.offset + cursor, encoded)?;
                run_offsets.push((plan.idx, cursor as u32, encoded.len() as u32));
                cursor += encoded.len() as u64;
            }
        }
    }

    // Commit: rewrite slots, header and locators.
    let mut dropped: Vec<u32> = Vec::new();
    for plan in &plans {
        match plan.outcome {
            SlotOutcome::Drop => {
                locators.set(arena, plan.tid, Locator::Empty)?;
                buffer::void_slot(&guard, plan.idx)?;
                dropped.push(plan.tid);
            }
            SlotOutcome::Immediate(immediate) => {
                locators.set(arena, plan.tid, immediate)?;
                buffer::void_slot(&guard, plan.idx)?;
            }
            SlotOutcome::Run(_) => {
                buffer::reset_slot_list(&guard, plan.idx)?;
            }
        }
    }
    for &(idx, rel_off, len) in &run_offsets {
        buffer::set_slot_chunk(&guard, idx, rel_off, len)?;
    }
    match new_region {
        Some(region) => {
            debug_assert_eq!(region.offset % heap.align(), 0);
            buffer::set_header_chunk(
                &guard,
                Some(((region.offset / heap.align()) as u32, region.len as u32)),
            )?;
        }
        None => buffer::set_header_chunk(&guard, None)?,
    }
    buffer::reclaim_heap(&guard)?;

    let control = arena.acquire(CONTROL_SEGMENT)?;
    let live = buffer::header_nterms(&guard)? - buffer::header_nvoids(&guard)?;
    if live == 0 && new_region.is_none() {
        // Nothing left in this buffer at all; return it to the pool.
        guard.zero_range(0, arena.segment_size() as usize)?;
        locator::set_seg_role(&control, seg, SegRole::Free)?;
        info!("buffer segment {} retired after flush", seg);
    }
    locator::set_heap_used(&control, heap.used()?)?;
    drop(control);

    if let Some(lex) = lexicon {
        for &tid in &dropped {
            lex.term_dropped(tid);
        }
    }

    // Old runs are unreachable now; recycle their space.
    if let Some((off, len)) = old_region {
        if len > 0 {
            heap.release(ChunkRef {
                offset: u64::from(off) * heap.align(),
                len: u64::from(len),
            })?;
        }
    }
    debug!(
        "flushed segment {}: {} terms, {} run bytes, {} dropped",
        seg,
        plans.len(),
        total_run_bytes,
        dropped.len()
    );
    Ok(())
}
