//! Term locator table and arena control page.
//!
//! The locator table maps a dense term id to a single 32-bit locator word
//! stored in dedicated locator segments. A locator is either *empty*,
//! *immediate* (the term's only posting packed directly into the word), or
//! *indirect* (segment id and term-slot index inside a buffer segment).
//!
//! Segment 0 of the arena is the control page: chunk-heap watermark,
//! locator page map and per-segment role table.

use crate::buffer;
use crate::doc::Posting;
use crate::error::DataCorruption;
use crate::segment::{SegmentArena, SegmentGuard, SegmentId, NO_SEGMENT};
use crate::{GristError, Result};

pub(crate) const CONTROL_SEGMENT: SegmentId = 0;

/// Control page layout.
const CTRL_HEAP_USED_LO: u32 = 0;
const CTRL_HEAP_USED_HI: u32 = 4;
const CTRL_LOC_MAP_OFF: u32 = 16;
pub(crate) const MAX_LOCATOR_PAGES: u32 = 512;
const CTRL_ROLE_OFF: u32 = CTRL_LOC_MAP_OFF + MAX_LOCATOR_PAGES * 4;

/// Role of a segment, tracked in the control page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SegRole {
    Free,
    Control,
    Locator,
    Buffer,
}

impl SegRole {
    fn from_u32(raw: u32) -> Result<SegRole> {
        match raw {
            0 => Ok(SegRole::Free),
            1 => Ok(SegRole::Control),
            2 => Ok(SegRole::Locator),
            3 => Ok(SegRole::Buffer),
            other => Err(DataCorruption::comment_only(format!(
                "invalid segment role tag {}",
                other
            ))
            .into()),
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            SegRole::Free => 0,
            SegRole::Control => 1,
            SegRole::Locator => 2,
            SegRole::Buffer => 3,
        }
    }
}

/// Bytes the control structures need; must fit into one segment.
pub(crate) fn control_bytes(max_segments: u32) -> u32 {
    CTRL_ROLE_OFF + max_segments * 4
}

pub(crate) fn heap_used(control: &SegmentGuard<'_>) -> Result<u64> {
    let lo = control.read_u32(CTRL_HEAP_USED_LO)?;
    let hi = control.read_u32(CTRL_HEAP_USED_HI)?;
    Ok((u64::from(hi) << 32) | u64::from(lo))
}

pub(crate) fn set_heap_used(control: &SegmentGuard<'_>, used: u64) -> Result<()> {
    control.write_u32(CTRL_HEAP_USED_LO, used as u32)?;
    control.write_u32(CTRL_HEAP_USED_HI, (used >> 32) as u32)
}

pub(crate) fn seg_role(control: &SegmentGuard<'_>, seg: SegmentId) -> Result<SegRole> {
    SegRole::from_u32(control.read_u32(CTRL_ROLE_OFF + seg * 4)?)
}

pub(crate) fn set_seg_role(
    control: &SegmentGuard<'_>,
    seg: SegmentId,
    role: SegRole,
) -> Result<()> {
    control.write_u32(CTRL_ROLE_OFF + seg * 4, role.as_u32())
}

fn locator_page(control: &SegmentGuard<'_>, page: u32) -> Result<SegmentId> {
    // Stored as id + 1 so that zeroed memory means "no page".
    let raw = control.read_u32(CTRL_LOC_MAP_OFF + page * 4)?;
    if raw == 0 {
        Ok(NO_SEGMENT)
    } else {
        Ok(raw - 1)
    }
}

fn set_locator_page(control: &SegmentGuard<'_>, page: u32, seg: SegmentId) -> Result<()> {
    control.write_u32(CTRL_LOC_MAP_OFF + page * 4, seg + 1)
}

/// Finds a free segment, assigns it `role` and zeroes it.
pub(crate) fn alloc_segment(
    arena: &SegmentArena,
    control: &SegmentGuard<'_>,
    role: SegRole,
) -> Result<SegmentId> {
    for seg in 1..arena.max_segments() {
        if seg_role(control, seg)? == SegRole::Free {
            let guard = arena.acquire(seg)?;
            guard.zero_range(0, arena.segment_size() as usize)?;
            set_seg_role(control, seg, role)?;
            return Ok(seg);
        }
    }
    Err(GristError::ResourceExhausted(format!(
        "all {} segments in use",
        arena.max_segments()
    )))
}

const LOC_TAG_IMMEDIATE: u32 = 1;
const LOC_TAG_INDIRECT: u32 = 2;

/// Maximum rid storable in an immediate locator.
pub(crate) const IMMEDIATE_RID_LIMIT: u32 = 1 << 20;
const IMMEDIATE_SID_LIMIT: u32 = 1 << 3;
const IMMEDIATE_POS_LIMIT: u32 = 1 << 7;

/// Decoded state of one term locator word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Locator {
    Empty,
    Immediate { rid: u32, sid: u32, pos: u32 },
    Indirect { seg: SegmentId, slot: u32 },
}

impl Locator {
    pub(crate) fn encode(self) -> u32 {
        match self {
            Locator::Empty => 0,
            Locator::Immediate { rid, sid, pos } => {
                debug_assert!(rid < IMMEDIATE_RID_LIMIT);
                debug_assert!(sid > 0 && sid < IMMEDIATE_SID_LIMIT);
                debug_assert!(pos < IMMEDIATE_POS_LIMIT);
                (LOC_TAG_IMMEDIATE << 30) | (rid << 10) | (sid << 7) | pos
            }
            Locator::Indirect { seg, slot } => {
                debug_assert!(seg < 1 << 12);
                debug_assert!(slot < 1 << 18);
                (LOC_TAG_INDIRECT << 30) | (seg << 18) | slot
            }
        }
    }

    pub(crate) fn decode(word: u32) -> Result<Locator> {
        if word == 0 {
            return Ok(Locator::Empty);
        }
        match word >> 30 {
            LOC_TAG_IMMEDIATE => Ok(Locator::Immediate {
                rid: (word >> 10) & 0xF_FFFF,
                sid: (word >> 7) & 0x7,
                pos: word & 0x7F,
            }),
            LOC_TAG_INDIRECT => Ok(Locator::Indirect {
                seg: (word >> 18) & 0xFFF,
                slot: word & 0x3_FFFF,
            }),
            tag => Err(DataCorruption::comment_only(format!(
                "invalid locator tag {} (word {:#010x})",
                tag, word
            ))
            .into()),
        }
    }

    /// Immediate encoding for `posting`, when it is small enough to pack.
    pub(crate) fn immediate_from(posting: &Posting) -> Option<Locator> {
        if posting.tf != 1 || posting.score != 0 || posting.positions.len() != 1 {
            return None;
        }
        let pos = posting.positions[0];
        let (rid, sid) = (posting.doc.rid, posting.doc.sid);
        if rid < IMMEDIATE_RID_LIMIT
            && sid > 0
            && sid < IMMEDIATE_SID_LIMIT
            && pos < IMMEDIATE_POS_LIMIT
        {
            Some(Locator::Immediate { rid, sid, pos })
        } else {
            None
        }
    }

    /// Reconstructs the posting packed into an immediate locator.
    pub(crate) fn immediate_posting(rid: u32, sid: u32, pos: u32) -> Posting {
        Posting::new(crate::DocAddr::new(rid, sid), 1, 0, &[pos])
    }
}

pub(crate) struct LocatorTable {
    locators_per_page: u32,
}

impl LocatorTable {
    pub(crate) fn new(segment_size: u32) -> LocatorTable {
        LocatorTable {
            locators_per_page: segment_size / 4,
        }
    }

    fn page_of(&self, tid: u32) -> Result<(u32, u32)> {
        let page = tid / self.locators_per_page;
        if page >= MAX_LOCATOR_PAGES {
            return Err(GristError::ResourceExhausted(format!(
                "term id {} beyond locator table capacity",
                tid
            )));
        }
        Ok((page, (tid % self.locators_per_page) * 4))
    }

    /// Read-only lookup. Unallocated pages read as `Empty`.
    pub(crate) fn at(&self, arena: &SegmentArena, tid: u32) -> Result<Locator> {
        let (page, offset) = self.page_of(tid)?;
        let control = arena.acquire(CONTROL_SEGMENT)?;
        let seg = locator_page(&control, page)?;
        drop(control);
        if seg == NO_SEGMENT {
            return Ok(Locator::Empty);
        }
        let guard = arena.acquire(seg)?;
        Locator::decode(guard.read_u32(offset)?)
    }

    /// Lookup that allocates the backing page on a miss.
    pub(crate) fn get(&self, arena: &SegmentArena, tid: u32) -> Result<Locator> {
        let (page, offset) = self.page_of(tid)?;
        let seg = self.ensure_page(arena, page)?;
        let guard = arena.acquire(seg)?;
        Locator::decode(guard.read_u32(offset)?)
    }

    pub(crate) fn set(&self, arena: &SegmentArena, tid: u32, locator: Locator) -> Result<()> {
        let (page, offset) = self.page_of(tid)?;
        let seg = self.ensure_page(arena, page)?;
        let guard = arena.acquire(seg)?;
        guard.write_u32(offset, locator.encode())
    }

    fn ensure_page(&self, arena: &SegmentArena, page: u32) -> Result<SegmentId> {
        let control = arena.acquire(CONTROL_SEGMENT)?;
        let seg = locator_page(&control, page)?;
        if seg != NO_SEGMENT {
            return Ok(seg);
        }
        let seg = alloc_segment(arena, &control, SegRole::Locator)?;
        set_locator_page(&control, page, seg)?;
        Ok(seg)
    }

    /// Visits every allocated locator word. Used by stat and diagnostics.
    pub(crate) fn for_each(
        &self,
        arena: &SegmentArena,
        mut visit: impl FnMut(u32, Locator),
    ) -> Result<()> {
        let control = arena.acquire(CONTROL_SEGMENT)?;
        for page in 0..MAX_LOCATOR_PAGES {
            let seg = locator_page(&control, page)?;
            if seg == NO_SEGMENT {
                continue;
            }
            let guard = arena.acquire(seg)?;
            for idx in 0..self.locators_per_page {
                let word = guard.read_u32(idx * 4)?;
                if word != 0 {
                    let tid = page * self.locators_per_page + idx;
                    visit(tid, Locator::decode(word)?);
                }
            }
        }
        Ok(())
    }
}

/// Searches for a buffer segment able to host `size_hint` more bytes near
/// the wanted placement bucket; allocates a fresh buffer segment if none
/// qualifies. Returns `None` when the arena is exhausted.
pub(crate) fn buffer_new(
    arena: &SegmentArena,
    size_hint: u32,
    bucket: u32,
) -> Result<Option<SegmentId>> {
    let control = arena.acquire(CONTROL_SEGMENT)?;
    // Pass (a): segments created for the same bucket, oldest generation first.
    // Pass (b): any buffer segment with capacity.
    for same_bucket_only in [true, false] {
        for seg in 1..arena.max_segments() {
            if seg_role(&control, seg)? != SegRole::Buffer {
                continue;
            }
            let guard = arena.acquire(seg)?;
            if same_bucket_only && buffer::header_bucket(&guard)? != bucket {
                continue;
            }
            if buffer::capable(&guard, size_hint)? {
                return Ok(Some(seg));
            }
        }
    }
    // Pass (c): claim an unused segment.
    match alloc_segment(arena, &control, SegRole::Buffer) {
        Ok(seg) => {
            let guard = arena.acquire(seg)?;
            buffer::init_buffer(&guard, bucket)?;
            Ok(Some(seg))
        }
        Err(GristError::ResourceExhausted(_)) => Ok(None),
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::DocAddr;

    #[test]
    fn test_locator_word_roundtrip() {
        for locator in [
            Locator::Empty,
            Locator::Immediate {
                rid: (1 << 20) - 1,
                sid: 7,
                pos: 127,
            },
            Locator::Immediate {
                rid: 0,
                sid: 1,
                pos: 0,
            },
            Locator::Indirect {
                seg: (1 << 12) - 1,
                slot: (1 << 18) - 1,
            },
            Locator::Indirect { seg: 1, slot: 0 },
        ] {
            assert_eq!(Locator::decode(locator.encode()).unwrap(), locator);
        }
    }

    #[test]
    fn test_invalid_tag_rejected() {
        assert!(Locator::decode(0b11 << 30).is_err());
        // Tag 0 with a non-zero payload is not a valid word either.
        assert!(Locator::decode(5).is_err());
    }

    #[test]
    fn test_immediate_eligibility() {
        let small = Posting {
            doc: DocAddr::new(12, 1),
            tf: 1,
            score: 0,
            positions: smallvec![3],
        };
        assert!(Locator::immediate_from(&small).is_some());

        let big_rid = Posting {
            doc: DocAddr::new(1 << 20, 1),
            ..small.clone()
        };
        assert!(Locator::immediate_from(&big_rid).is_none());

        let scored = Posting {
            score: 9,
            ..small.clone()
        };
        assert!(Locator::immediate_from(&scored).is_none());

        let no_positions = Posting {
            positions: smallvec![],
            ..small.clone()
        };
        assert!(Locator::immediate_from(&no_positions).is_none());

        let multi_tf = Posting {
            tf: 2,
            positions: smallvec![3, 8],
            ..small.clone()
        };
        assert!(Locator::immediate_from(&multi_tf).is_none());
    }

    #[test]
    fn test_immediate_posting_roundtrip() {
        let posting = Locator::immediate_posting(12, 1, 3);
        let locator = Locator::immediate_from(&posting).unwrap();
        assert_eq!(
            locator,
            Locator::Immediate {
                rid: 12,
                sid: 1,
                pos: 3
            }
        );
    }
}
