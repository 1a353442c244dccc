//! The posting engine: the crate's public entry point.
//!
//! One engine owns three files derived from a base path: the segment
//! arena (`<base>.seg`), the chunk heap extents (`<base>.c0`, `<base>.c1`,
//! ...) and a small JSON metadata file (`<base>.meta.json`).
//!
//! Reads are lock-free with respect to each other; mutations serialize on
//! a single writer lock. A mutation that finds its target buffer full
//! flushes that buffer and retries once before giving up.

use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::buffer;
use crate::chunk::ChunkHeap;
use crate::config::EngineConfig;
use crate::cursor::Cursor;
use crate::doc::{DocAddr, Posting, TermId};
use crate::error::DataCorruption;
use crate::flush::flush_segment;
use crate::locator::{self, Locator, LocatorTable, SegRole, CONTROL_SEGMENT};
use crate::merge::{ChunkStream, MergedStream, SnapshotStream};
use crate::segment::{SegmentArena, SegmentFormat, SegmentGuard, SegmentId};
use crate::{GristError, Result};

/// Callbacks into the term dictionary owning the term-id space.
pub trait TermLexicon: Send + Sync {
    /// The term's last posting is gone; its id may be retired.
    fn term_dropped(&self, tid: TermId);
}

const META_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
struct IndexMeta {
    format_version: u32,
    segment_size: u32,
    max_segments: u32,
    alignment_block_size: u32,
}

/// Point-in-time counters, for monitoring and tests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EngineStat {
    pub terms_immediate: u64,
    pub terms_buffered: u64,
    pub buffer_segments: u32,
    pub chunk_bytes_used: u64,
}

pub struct PostingEngine {
    config: EngineConfig,
    arena: SegmentArena,
    heap: ChunkHeap,
    locators: LocatorTable,
    lexicon: Option<Box<dyn TermLexicon>>,
    write_lock: Mutex<()>,
}

fn file_with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "grist".to_string());
    name.push_str(suffix);
    base.with_file_name(name)
}

impl PostingEngine {
    /// Creates a fresh index rooted at `base`.
    pub fn create(base: &Path, config: EngineConfig) -> Result<PostingEngine> {
        config.validate()?;
        if locator::control_bytes(config.max_segments) > config.segment_size {
            return Err(GristError::InvalidArgument(format!(
                "control structures for {} segments do not fit a {} byte segment",
                config.max_segments, config.segment_size
            )));
        }
        let arena = SegmentArena::create(&file_with_suffix(base, ".seg"), &config)?;
        {
            let control = arena.acquire(CONTROL_SEGMENT)?;
            locator::set_seg_role(&control, CONTROL_SEGMENT, SegRole::Control)?;
            locator::set_heap_used(&control, 0)?;
        }
        let heap = ChunkHeap::open(base.to_path_buf(), config.alignment_block_size, 0)?;
        let meta = IndexMeta {
            format_version: META_FORMAT_VERSION,
            segment_size: config.segment_size,
            max_segments: config.max_segments,
            alignment_block_size: config.alignment_block_size,
        };
        let meta_file = File::create(file_with_suffix(base, ".meta.json"))?;
        let mut writer = BufWriter::new(meta_file);
        serde_json::to_writer_pretty(&mut writer, &meta)?;
        writer.flush()?;
        let locators = LocatorTable::new(arena.segment_size());
        info!(
            "created index at {:?}: segment_size={} max_segments={}",
            base, config.segment_size, config.max_segments
        );
        Ok(PostingEngine {
            config,
            arena,
            heap,
            locators,
            lexicon: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Opens an existing index. Geometry comes from the stored metadata and
    /// the arena header, not from `config`. A legacy-format index opens
    /// read-only: cursors work, mutations fail with `IncompatibleFormat`.
    pub fn open(base: &Path, config: EngineConfig) -> Result<PostingEngine> {
        let meta_path = file_with_suffix(base, ".meta.json");
        if !meta_path.exists() {
            return Err(GristError::PathDoesNotExist(meta_path));
        }
        let meta: IndexMeta = serde_json::from_reader(BufReader::new(File::open(&meta_path)?))?;
        if meta.format_version != META_FORMAT_VERSION {
            return Err(GristError::IncompatibleFormat(format!(
                "metadata format version {} (expected {})",
                meta.format_version, META_FORMAT_VERSION
            )));
        }
        let arena = SegmentArena::open(&file_with_suffix(base, ".seg"), &config)?;
        if arena.segment_size() != meta.segment_size || arena.max_segments() != meta.max_segments
        {
            return Err(DataCorruption::new(
                meta_path,
                "metadata geometry disagrees with the arena header".to_string(),
            )
            .into());
        }
        let heap_used = {
            let control = arena.acquire(CONTROL_SEGMENT)?;
            locator::heap_used(&control)?
        };
        let heap = ChunkHeap::open(base.to_path_buf(), meta.alignment_block_size, heap_used)?;
        let locators = LocatorTable::new(arena.segment_size());
        if arena.format() == SegmentFormat::Legacy {
            info!("index at {:?} uses the legacy format; opened read-only", base);
        }
        let mut config = config;
        config.segment_size = arena.segment_size();
        config.max_segments = arena.max_segments();
        config.alignment_block_size = meta.alignment_block_size;
        Ok(PostingEngine {
            config,
            arena,
            heap,
            locators,
            lexicon: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Registers the dictionary to notify when terms lose their last
    /// posting.
    pub fn set_lexicon(&mut self, lexicon: Box<dyn TermLexicon>) {
        self.lexicon = Some(lexicon);
    }

    pub fn format(&self) -> SegmentFormat {
        self.arena.format()
    }

    fn check_writable(&self) -> Result<()> {
        if !self.arena.format().is_writable() {
            return Err(GristError::IncompatibleFormat(
                "index uses the legacy format and is read-only".to_string(),
            ));
        }
        Ok(())
    }

    fn bucket_of(&self, tid: TermId) -> u32 {
        let mut hasher = FxHasher::default();
        tid.hash(&mut hasher);
        (hasher.finish() % u64::from(self.config.buffer_bucket_count)) as u32
    }

    /// Inserts or replaces the posting of `(tid, posting.doc)`.
    ///
    /// `tf` must be at least 1 (deletions go through [`delete`]); positions,
    /// when given, must match `tf` and are truncated alongside `tf` when it
    /// exceeds the configured cap.
    ///
    /// [`delete`]: PostingEngine::delete
    pub fn update(&self, tid: TermId, posting: Posting) -> Result<()> {
        self.check_writable()?;
        if posting.doc.is_whole_doc() {
            return Err(GristError::InvalidArgument(
                "section id 0 is reserved for whole-document deletion".to_string(),
            ));
        }
        if posting.tf == 0 {
            return Err(GristError::InvalidArgument(
                "tf 0 is a deletion; use delete()".to_string(),
            ));
        }
        let posting = self.normalize(tid, posting)?;
        if self.config.debug_logging {
            debug!(
                "update tid={} doc=({}, {}) tf={}",
                tid, posting.doc.rid, posting.doc.sid, posting.tf
            );
        }
        let _write = self.write_lock.lock()?;
        self.upsert(tid, posting)
    }

    /// Deletes the posting at `doc`, or all of the document's postings for
    /// this term when `doc.sid == 0`. Deleting something absent is a no-op.
    pub fn delete(&self, tid: TermId, doc: DocAddr) -> Result<()> {
        self.check_writable()?;
        if self.config.debug_logging {
            debug!("delete tid={} doc=({}, {})", tid, doc.rid, doc.sid);
        }
        let _write = self.write_lock.lock()?;
        match self.locators.at(&self.arena, tid)? {
            Locator::Empty => Ok(()),
            Locator::Immediate { rid, sid, pos: _ } => {
                let covered = (doc.is_whole_doc() && rid == doc.rid)
                    || (rid == doc.rid && sid == doc.sid);
                if covered {
                    self.locators.set(&self.arena, tid, Locator::Empty)?;
                    if let Some(ref lexicon) = self.lexicon {
                        lexicon.term_dropped(tid);
                    }
                }
                Ok(())
            }
            Locator::Indirect { .. } => self.upsert(tid, Posting::delete_marker(doc)),
        }
    }

    fn normalize(&self, tid: TermId, mut posting: Posting) -> Result<Posting> {
        if posting.tf > self.config.tf_cap {
            warn!(
                "tid {} doc ({}, {}): tf {} exceeds cap {}, truncating",
                tid, posting.doc.rid, posting.doc.sid, posting.tf, self.config.tf_cap
            );
            posting.tf = self.config.tf_cap;
        }
        if !posting.positions.is_empty() {
            if posting.positions.len() > posting.tf as usize {
                posting.positions.truncate(posting.tf as usize);
            } else if posting.positions.len() < posting.tf as usize {
                return Err(GristError::InvalidArgument(format!(
                    "{} positions given for tf {}",
                    posting.positions.len(),
                    posting.tf
                )));
            }
            if posting.positions.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(GristError::InvalidArgument(
                    "positions must be strictly ascending".to_string(),
                ));
            }
        }
        Ok(posting)
    }

    /// Write-lock-held insert path shared by update and buffered delete.
    fn upsert(&self, tid: TermId, posting: Posting) -> Result<()> {
        let mut flushed = false;
        loop {
            match self.locators.get(&self.arena, tid)? {
                Locator::Empty => {
                    if posting.is_delete_marker() {
                        return Ok(());
                    }
                    if let Some(immediate) = Locator::immediate_from(&posting) {
                        return self.locators.set(&self.arena, tid, immediate);
                    }
                    return self.place_new(tid, &[posting]);
                }
                Locator::Immediate { rid, sid, pos } => {
                    let old = Locator::immediate_posting(rid, sid, pos);
                    if posting.is_delete_marker() {
                        let covered = (posting.doc.is_whole_doc()
                            && old.doc.rid == posting.doc.rid)
                            || old.doc == posting.doc;
                        if covered {
                            self.locators.set(&self.arena, tid, Locator::Empty)?;
                            if let Some(ref lexicon) = self.lexicon {
                                lexicon.term_dropped(tid);
                            }
                        }
                        return Ok(());
                    }
                    if posting.doc == old.doc {
                        if let Some(immediate) = Locator::immediate_from(&posting) {
                            return self.locators.set(&self.arena, tid, immediate);
                        }
                        return self.place_new(tid, &[posting]);
                    }
                    // Two postings now; the term graduates to a buffer.
                    let pair = if old.doc < posting.doc {
                        [old, posting]
                    } else {
                        [posting, old]
                    };
                    return self.place_new(tid, &pair);
                }
                Locator::Indirect { seg, slot } => {
                    let guard = self.arena.acquire(seg)?;
                    self.check_slot(&guard, slot, tid)?;
                    let need = buffer::record_bytes(&posting);
                    if buffer::header_free(&guard)? < need {
                        drop(guard);
                        if flushed {
                            return Err(GristError::ResourceExhausted(format!(
                                "buffer segment {} cannot hold a {} byte record even after a flush",
                                seg, need
                            )));
                        }
                        flush_segment(
                            &self.arena,
                            &self.heap,
                            &self.locators,
                            &self.config,
                            seg,
                            self.lexicon.as_deref(),
                        )?;
                        flushed = true;
                        continue;
                    }
                    return buffer::buffer_put(&guard, slot, &posting, self.config.max_jump_depth);
                }
            }
        }
    }

    fn check_slot(&self, guard: &SegmentGuard<'_>, slot: u32, tid: TermId) -> Result<()> {
        if slot >= buffer::header_nterms(guard)? || buffer::slot_tid(guard, slot)? != tid {
            return Err(DataCorruption::comment_only(format!(
                "locator of tid {} points at segment {} slot {} which belongs to another term",
                tid,
                guard.segment_id(),
                slot
            ))
            .into());
        }
        Ok(())
    }

    /// Places a term's first buffered records, claiming a slot in a
    /// suitable buffer segment.
    fn place_new(&self, tid: TermId, postings: &[Posting]) -> Result<()> {
        let need = buffer::SLOT_BYTES
            + postings.iter().map(buffer::record_bytes).sum::<u32>();
        let bucket = self.bucket_of(tid);
        let seg = locator::buffer_new(&self.arena, need, bucket)?.ok_or_else(|| {
            GristError::ResourceExhausted("no buffer segment can host the term".to_string())
        })?;
        let guard = self.arena.acquire(seg)?;
        let slot = buffer::add_slot(&guard, tid)?;
        for posting in postings {
            buffer::buffer_put(&guard, slot, posting, self.config.max_jump_depth)?;
        }
        self.locators
            .set(&self.arena, tid, Locator::Indirect { seg, slot })
    }

    /// Opens a cursor over the term's live postings. The cursor owns a
    /// copy of both tiers taken under this call, so later flushes do not
    /// disturb it.
    pub fn open_cursor(&self, tid: TermId, want_positions: bool) -> Result<Cursor> {
        match self.locators.at(&self.arena, tid)? {
            Locator::Empty => Ok(Cursor::exhausted(want_positions)),
            Locator::Immediate { rid, sid, pos } => Ok(Cursor::immediate(
                Locator::immediate_posting(rid, sid, pos),
                want_positions,
            )),
            Locator::Indirect { seg, slot } => {
                let guard = self.arena.acquire(seg)?;
                self.check_slot(&guard, slot, tid)?;
                let chunk_stream = self.chunk_stream(&guard, slot)?;
                let head = buffer::slot_head(&guard, slot)?;
                let buffered = buffer::snapshot_chain(&guard, head)?;
                drop(guard);
                let stream = MergedStream::new(chunk_stream, SnapshotStream::new(buffered));
                Ok(Cursor::merged(stream, want_positions))
            }
        }
    }

    fn chunk_stream(&self, guard: &SegmentGuard<'_>, slot: u32) -> Result<ChunkStream> {
        let (chunk_off, chunk_len) = buffer::slot_chunk(guard, slot)?;
        if chunk_len == 0 {
            return Ok(ChunkStream::empty());
        }
        let (region_off, _) = buffer::header_chunk(guard)?.ok_or_else(|| {
            DataCorruption::comment_only(format!(
                "segment {} slot {} references a chunk run but the buffer has no chunk region",
                guard.segment_id(),
                slot
            ))
        })?;
        let base = u64::from(region_off) * self.heap.align();
        Ok(ChunkStream::new(
            self.heap.read(base + u64::from(chunk_off), chunk_len as usize)?,
            self.config.tf_cap,
        ))
    }

    /// Rough byte footprint of a term's postings, without decoding them.
    pub fn estimate_size(&self, tid: TermId) -> Result<u64> {
        match self.locators.at(&self.arena, tid)? {
            Locator::Empty => Ok(0),
            Locator::Immediate { .. } => Ok(8),
            Locator::Indirect { seg, slot } => {
                let guard = self.arena.acquire(seg)?;
                self.check_slot(&guard, slot, tid)?;
                let (_, chunk_len) = buffer::slot_chunk(&guard, slot)?;
                let buffered = buffer::slot_buf_bytes(&guard, slot)?;
                Ok(u64::from(chunk_len) + u64::from(buffered))
            }
        }
    }

    /// Flushes every buffer segment's postings into chunk runs.
    pub fn flush_all(&self) -> Result<()> {
        self.check_writable()?;
        let _write = self.write_lock.lock()?;
        for seg in self.segments_with_role(SegRole::Buffer)? {
            flush_segment(
                &self.arena,
                &self.heap,
                &self.locators,
                &self.config,
                seg,
                self.lexicon.as_deref(),
            )?;
        }
        Ok(())
    }

    fn segments_with_role(&self, role: SegRole) -> Result<Vec<SegmentId>> {
        let control = self.arena.acquire(CONTROL_SEGMENT)?;
        let mut segments = Vec::new();
        for seg in 0..self.arena.max_segments() {
            if locator::seg_role(&control, seg)? == role {
                segments.push(seg);
            }
        }
        Ok(segments)
    }

    /// Structural verification of every shared structure. Returns the
    /// number of problems found (all logged); zero means consistent.
    pub fn check_consistency(&self) -> Result<usize> {
        let mut errors = 0usize;
        for seg in self.segments_with_role(SegRole::Buffer)? {
            let guard = self.arena.acquire(seg)?;
            errors += buffer::check_segment(&guard)?;
        }
        let mut locator_errors = 0usize;
        let arena = &self.arena;
        self.locators.for_each(arena, |tid, loc| {
            if let Locator::Indirect { seg, slot } = loc {
                let ok = arena
                    .acquire(seg)
                    .and_then(|guard| {
                        Ok(slot < buffer::header_nterms(&guard)?
                            && buffer::slot_tid(&guard, slot)? == tid)
                    })
                    .unwrap_or(false);
                if !ok {
                    warn!("tid {}: dangling locator to segment {} slot {}", tid, seg, slot);
                    locator_errors += 1;
                }
            }
        })?;
        Ok(errors + locator_errors)
    }

    pub fn stat(&self) -> Result<EngineStat> {
        let mut stat = EngineStat {
            chunk_bytes_used: self.heap.used()?,
            buffer_segments: self.segments_with_role(SegRole::Buffer)?.len() as u32,
            ..EngineStat::default()
        };
        self.locators.for_each(&self.arena, |_tid, loc| match loc {
            Locator::Immediate { .. } => stat.terms_immediate += 1,
            Locator::Indirect { .. } => stat.terms_buffered += 1,
            Locator::Empty => {}
        })?;
        Ok(stat)
    }

    /// Pushes all dirty state to disk: mappings, heap extents and the
    /// persisted heap watermark.
    pub fn sync(&self) -> Result<()> {
        if self.arena.format().is_writable() {
            let _write = self.write_lock.lock()?;
            let control = self.arena.acquire(CONTROL_SEGMENT)?;
            locator::set_heap_used(&control, self.heap.used()?)?;
        }
        self.arena.sync_all()?;
        self.heap.sync_all()
    }
}
