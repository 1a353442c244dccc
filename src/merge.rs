//! Two-way merge of a term's chunk run with its buffered records.
//!
//! Both inputs are ascending docid streams. The merged output is the live
//! view of the term: buffered records shadow chunk entries with the same
//! docid, deletion markers (`tf == 0`) consume their chunk counterpart and
//! are never emitted, and a whole-document marker (`sid == 0`) swallows
//! every chunk entry of that `rid`.
//!
//! Each input is verified to be strictly ascending while it drains. The
//! chunk side is immutable shared data, so a violation there is a
//! `DataCorruption` error; the merge never papers over it.

use crate::codec::RunDecoder;
use crate::doc::Posting;
use crate::error::DataCorruption;
use crate::segment::SegmentGuard;
use crate::{buffer, Result};

/// An ascending stream of raw postings, tombstones and markers included.
pub(crate) trait RawStream {
    fn next_raw(&mut self) -> Result<Option<Posting>>;
}

/// Chunk-run side of a merge.
pub(crate) struct ChunkStream {
    decoder: RunDecoder,
}

impl ChunkStream {
    pub(crate) fn new(data: Vec<u8>, tf_cap: u32) -> ChunkStream {
        ChunkStream {
            decoder: RunDecoder::new(data, tf_cap),
        }
    }

    pub(crate) fn empty() -> ChunkStream {
        ChunkStream::new(Vec::new(), 1)
    }
}

impl RawStream for ChunkStream {
    fn next_raw(&mut self) -> Result<Option<Posting>> {
        self.decoder.next_posting()
    }
}

/// An owned, pre-collected stream. Cursors snapshot a term's buffered
/// chain into one of these at open time, so a later flush rewriting the
/// segment in place cannot invalidate an open reader.
pub(crate) struct SnapshotStream {
    postings: std::vec::IntoIter<Posting>,
}

impl SnapshotStream {
    pub(crate) fn new(postings: Vec<Posting>) -> SnapshotStream {
        SnapshotStream {
            postings: postings.into_iter(),
        }
    }
}

impl RawStream for SnapshotStream {
    fn next_raw(&mut self) -> Result<Option<Posting>> {
        Ok(self.postings.next())
    }
}

/// Buffered-record side of a flush merge. Owns its segment checkout so
/// the segment stays referenced for as long as the stream lives. Only
/// the flush path (which holds the writer lock) reads a live chain.
pub(crate) struct BufferStream<'a> {
    guard: SegmentGuard<'a>,
    next_off: u32,
}

impl<'a> BufferStream<'a> {
    pub(crate) fn new(guard: SegmentGuard<'a>, head: u32) -> BufferStream<'a> {
        BufferStream {
            guard,
            next_off: head,
        }
    }
}

impl<'a> RawStream for BufferStream<'a> {
    fn next_raw(&mut self) -> Result<Option<Posting>> {
        if self.next_off == buffer::NIL_OFF {
            return Ok(None);
        }
        let (posting, step) = buffer::record_posting(&self.guard, self.next_off)?;
        self.next_off = step;
        Ok(Some(posting))
    }
}

/// The merged, live-postings-only view over a chunk stream and a buffer
/// stream. Used by both the read cursor and the flush engine.
pub(crate) struct MergedStream<C, B> {
    chunk: C,
    buf: B,
    chunk_head: Option<Posting>,
    buf_head: Option<Posting>,
    chunk_last: Option<u64>,
    buf_last: Option<u64>,
    primed: bool,
}

impl<C: RawStream, B: RawStream> MergedStream<C, B> {
    pub(crate) fn new(chunk: C, buf: B) -> MergedStream<C, B> {
        MergedStream {
            chunk,
            buf,
            chunk_head: None,
            buf_head: None,
            chunk_last: None,
            buf_last: None,
            primed: false,
        }
    }

    fn refill_chunk(&mut self) -> Result<()> {
        self.chunk_head = self.chunk.next_raw()?;
        if let Some(ref posting) = self.chunk_head {
            let packed = posting.doc.pack();
            if self.chunk_last.map(|last| packed <= last).unwrap_or(false) {
                return Err(DataCorruption::comment_only(format!(
                    "chunk run not ascending at docid ({}, {})",
                    posting.doc.rid, posting.doc.sid
                ))
                .into());
            }
            self.chunk_last = Some(packed);
        }
        Ok(())
    }

    fn refill_buf(&mut self) -> Result<()> {
        self.buf_head = self.buf.next_raw()?;
        if let Some(ref posting) = self.buf_head {
            let packed = posting.doc.pack();
            if self.buf_last.map(|last| packed <= last).unwrap_or(false) {
                return Err(DataCorruption::comment_only(format!(
                    "buffered chain not ascending at docid ({}, {})",
                    posting.doc.rid, posting.doc.sid
                ))
                .into());
            }
            self.buf_last = Some(packed);
        }
        Ok(())
    }

    /// Next live posting, or `None` when both sides are drained.
    pub(crate) fn next_live(&mut self) -> Result<Option<Posting>> {
        if !self.primed {
            self.refill_chunk()?;
            self.refill_buf()?;
            self.primed = true;
        }
        loop {
            let buf_doc = self.buf_head.as_ref().map(|posting| posting.doc);
            let chunk_doc = self.chunk_head.as_ref().map(|posting| posting.doc);
            match (chunk_doc, buf_doc) {
                (None, None) => return Ok(None),
                (Some(_), None) => {
                    let posting = self.chunk_head.take();
                    self.refill_chunk()?;
                    return Ok(posting);
                }
                (None, Some(_)) => {
                    let posting = self.buf_head.take();
                    self.refill_buf()?;
                    match posting {
                        Some(posting) if posting.tf > 0 && !posting.doc.is_whole_doc() => {
                            return Ok(Some(posting));
                        }
                        _ => continue,
                    }
                }
                (Some(chunk_doc), Some(buf_doc)) => {
                    if buf_doc.is_whole_doc() {
                        if chunk_doc.rid == buf_doc.rid {
                            // Swallowed by the whole-document marker.
                            self.refill_chunk()?;
                            continue;
                        }
                        if chunk_doc.rid < buf_doc.rid {
                            let posting = self.chunk_head.take();
                            self.refill_chunk()?;
                            return Ok(posting);
                        }
                        // Marker's reach is exhausted.
                        self.refill_buf()?;
                        continue;
                    }
                    if chunk_doc < buf_doc {
                        let posting = self.chunk_head.take();
                        self.refill_chunk()?;
                        return Ok(posting);
                    }
                    if chunk_doc == buf_doc {
                        // Buffer shadows the chunk entry.
                        self.refill_chunk()?;
                    }
                    let posting = self.buf_head.take();
                    self.refill_buf()?;
                    match posting {
                        Some(posting) if posting.tf > 0 => return Ok(Some(posting)),
                        _ => continue,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_run;
    use crate::doc::DocAddr;

    fn drain<C: RawStream, B: RawStream>(mut merged: MergedStream<C, B>) -> Vec<Posting> {
        let mut out = Vec::new();
        while let Some(posting) = merged.next_live().unwrap() {
            out.push(posting);
        }
        out
    }

    fn plain(rid: u32, sid: u32) -> Posting {
        Posting::new(DocAddr::new(rid, sid), 1, 0, &[])
    }

    #[test]
    fn test_interleaves_in_docid_order() {
        let chunk = SnapshotStream::new(vec![plain(1, 1), plain(5, 1)]);
        let buf = SnapshotStream::new(vec![plain(2, 1), plain(5, 2), plain(9, 1)]);
        let docs: Vec<(u32, u32)> = drain(MergedStream::new(chunk, buf))
            .iter()
            .map(|posting| (posting.doc.rid, posting.doc.sid))
            .collect();
        assert_eq!(docs, vec![(1, 1), (2, 1), (5, 1), (5, 2), (9, 1)]);
    }

    #[test]
    fn test_buffer_shadows_equal_docid() {
        let chunk = SnapshotStream::new(vec![plain(3, 1)]);
        let newer = Posting::new(DocAddr::new(3, 1), 4, 9, &[]);
        let buf = SnapshotStream::new(vec![newer.clone()]);
        assert_eq!(drain(MergedStream::new(chunk, buf)), vec![newer]);
    }

    #[test]
    fn test_tombstone_consumes_chunk_entry() {
        let chunk = SnapshotStream::new(vec![plain(3, 1), plain(4, 1)]);
        let buf = SnapshotStream::new(vec![Posting::delete_marker(DocAddr::new(3, 1))]);
        let docs: Vec<u32> = drain(MergedStream::new(chunk, buf))
            .iter()
            .map(|posting| posting.doc.rid)
            .collect();
        assert_eq!(docs, vec![4]);
    }

    #[test]
    fn test_whole_doc_marker_swallows_all_sections() {
        let chunk = SnapshotStream::new(vec![plain(2, 1), plain(3, 1), plain(3, 2), plain(4, 1)]);
        let buf = SnapshotStream::new(vec![Posting::delete_marker(DocAddr::whole_doc(3))]);
        let docs: Vec<u32> = drain(MergedStream::new(chunk, buf))
            .iter()
            .map(|posting| posting.doc.rid)
            .collect();
        assert_eq!(docs, vec![2, 4]);
    }

    #[test]
    fn test_whole_doc_marker_then_reinsert() {
        // Delete all of rid 3, then add a fresh section 1 in the buffer.
        let chunk = SnapshotStream::new(vec![plain(3, 1), plain(3, 2)]);
        let buf = SnapshotStream::new(vec![
            Posting::delete_marker(DocAddr::whole_doc(3)),
            Posting::new(DocAddr::new(3, 1), 2, 0, &[]),
        ]);
        let merged = drain(MergedStream::new(chunk, buf));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].doc, DocAddr::new(3, 1));
        assert_eq!(merged[0].tf, 2);
    }

    #[test]
    fn test_chunk_stream_round_trips_encoded_run() {
        let postings = vec![plain(1, 1), plain(2, 1), plain(2, 3)];
        let mut encoded = Vec::new();
        encode_run(&postings, &mut encoded);
        let merged = MergedStream::new(
            ChunkStream::new(encoded, 8),
            SnapshotStream::new(Vec::new()),
        );
        assert_eq!(drain(merged), postings);
    }

    #[test]
    fn test_non_ascending_chunk_is_corruption() {
        let chunk = SnapshotStream::new(vec![plain(5, 1), plain(2, 1)]);
        let mut merged = MergedStream::new(chunk, SnapshotStream::new(Vec::new()));
        assert!(merged.next_live().unwrap().is_some());
        assert!(merged.next_live().is_err());
    }
}
