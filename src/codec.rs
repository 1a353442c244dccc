//! Variable-length codes for compressed chunk runs.
//!
//! Two independent codes live here.
//!
//! The *general varint* stores a `u32` in 1 to 5 bytes, partitioned by the
//! leading-byte prefix bits (`0`, `10`, `110`, `1110`, `0xF0`). It is used
//! for section ids, scores and intra-document position gaps.
//!
//! The *gap/tf code* packs a (docid gap, term frequency) pair into one of
//! six size classes, chosen so that the common case (small gap, tf <= 2)
//! costs a single byte. Three single-byte markers interleaved in the stream
//! carry record-shape changes (score constant / score inline / positions
//! present) with run-length suppression: a marker is only emitted when the
//! shape differs from the previous record.

use smallvec::SmallVec;

use crate::error::DataCorruption;
use crate::{DocAddr, Posting, Result};

/// Shape marker: a constant score follows as a varint and applies to all
/// subsequent records until changed. Value zero turns scoring off.
pub(crate) const MARK_SCORE_CONST: u8 = 0xFD;
/// Shape marker: the next record carries its own inline varint score.
pub(crate) const MARK_SCORE_INLINE: u8 = 0xFE;
/// Shape marker: toggles "position gaps present" for subsequent records.
pub(crate) const MARK_POSITIONS: u8 = 0xFF;

/// Escape lead byte of gap/tf size class 6.
const GAP_TF_ESCAPE: u8 = 0xF8;

fn corrupt(comment: String) -> crate::GristError {
    DataCorruption::comment_only(comment).into()
}

/// Appends `v` to `out` using the general varint code.
pub fn write_varint(v: u32, out: &mut Vec<u8>) {
    if v < 1 << 7 {
        out.push(v as u8);
    } else if v < 1 << 14 {
        out.push(0x80 | (v >> 8) as u8);
        out.push(v as u8);
    } else if v < 1 << 21 {
        out.push(0xC0 | (v >> 16) as u8);
        out.push((v >> 8) as u8);
        out.push(v as u8);
    } else if v < 1 << 28 {
        out.push(0xE0 | (v >> 24) as u8);
        out.push((v >> 16) as u8);
        out.push((v >> 8) as u8);
        out.push(v as u8);
    } else {
        out.push(0xF0);
        out.push((v >> 24) as u8);
        out.push((v >> 16) as u8);
        out.push((v >> 8) as u8);
        out.push(v as u8);
    }
}

#[inline]
fn take_byte(data: &[u8], pos: &mut usize) -> Result<u8> {
    if *pos >= data.len() {
        return Err(corrupt(format!(
            "truncated encoded run: read past end at offset {}",
            *pos
        )));
    }
    let byte = data[*pos];
    *pos += 1;
    Ok(byte)
}

/// Reads one general varint from `data` at `*pos`.
pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<u32> {
    let lead = take_byte(data, pos)?;
    let value = if lead < 0x80 {
        u32::from(lead)
    } else if lead < 0xC0 {
        (u32::from(lead & 0x3F) << 8) | u32::from(take_byte(data, pos)?)
    } else if lead < 0xE0 {
        (u32::from(lead & 0x1F) << 16)
            | (u32::from(take_byte(data, pos)?) << 8)
            | u32::from(take_byte(data, pos)?)
    } else if lead < 0xF0 {
        (u32::from(lead & 0x0F) << 24)
            | (u32::from(take_byte(data, pos)?) << 16)
            | (u32::from(take_byte(data, pos)?) << 8)
            | u32::from(take_byte(data, pos)?)
    } else if lead == 0xF0 {
        (u32::from(take_byte(data, pos)?) << 24)
            | (u32::from(take_byte(data, pos)?) << 16)
            | (u32::from(take_byte(data, pos)?) << 8)
            | u32::from(take_byte(data, pos)?)
    } else {
        return Err(corrupt(format!("invalid varint lead byte {:#04x}", lead)));
    };
    Ok(value)
}

/// Appends the gap/tf pair to `out`. `tf` must be >= 1.
pub fn write_gap_tf(gap: u32, tf: u32, out: &mut Vec<u8>) {
    debug_assert!(tf >= 1);
    let t = tf - 1;
    if gap < 1 << 6 && t < 1 << 1 {
        out.push(((gap << 1) | t) as u8);
    } else if gap < 1 << 10 && t < 1 << 4 {
        let payload = (gap << 4) | t;
        out.push(0x80 | (payload >> 8) as u8);
        out.push(payload as u8);
    } else if gap < 1 << 15 && t < 1 << 6 {
        let payload = (gap << 6) | t;
        out.push(0xC0 | (payload >> 16) as u8);
        out.push((payload >> 8) as u8);
        out.push(payload as u8);
    } else if gap < 1 << 20 && t < 1 << 8 {
        let payload = (gap << 8) | t;
        out.push(0xE0 | (payload >> 24) as u8);
        out.push((payload >> 16) as u8);
        out.push((payload >> 8) as u8);
        out.push(payload as u8);
    } else if gap < 1 << 25 && t < 1 << 10 {
        let payload = (u64::from(gap) << 10) | u64::from(t);
        out.push(0xF0 | (payload >> 32) as u8);
        out.push((payload >> 24) as u8);
        out.push((payload >> 16) as u8);
        out.push((payload >> 8) as u8);
        out.push(payload as u8);
    } else {
        out.push(GAP_TF_ESCAPE);
        write_varint(gap, out);
        write_varint(t, out);
    }
}

/// Decodes a gap/tf pair whose lead byte has already been consumed.
fn read_gap_tf_body(lead: u8, data: &[u8], pos: &mut usize) -> Result<(u32, u32)> {
    if lead < 0x80 {
        return Ok((u32::from(lead >> 1), u32::from(lead & 1) + 1));
    }
    if lead < 0xC0 {
        let payload = (u32::from(lead & 0x3F) << 8) | u32::from(take_byte(data, pos)?);
        return Ok((payload >> 4, (payload & 0xF) + 1));
    }
    if lead < 0xE0 {
        let payload = (u32::from(lead & 0x1F) << 16)
            | (u32::from(take_byte(data, pos)?) << 8)
            | u32::from(take_byte(data, pos)?);
        return Ok((payload >> 6, (payload & 0x3F) + 1));
    }
    if lead < 0xF0 {
        let payload = (u32::from(lead & 0x0F) << 24)
            | (u32::from(take_byte(data, pos)?) << 16)
            | (u32::from(take_byte(data, pos)?) << 8)
            | u32::from(take_byte(data, pos)?);
        return Ok((payload >> 8, (payload & 0xFF) + 1));
    }
    if lead < GAP_TF_ESCAPE {
        let payload = (u64::from(lead & 0x07) << 32)
            | (u64::from(take_byte(data, pos)?) << 24)
            | (u64::from(take_byte(data, pos)?) << 16)
            | (u64::from(take_byte(data, pos)?) << 8)
            | u64::from(take_byte(data, pos)?);
        return Ok(((payload >> 10) as u32, (payload & 0x3FF) as u32 + 1));
    }
    if lead == GAP_TF_ESCAPE {
        let gap = read_varint(data, pos)?;
        let t = read_varint(data, pos)?;
        return Ok((gap, t + 1));
    }
    Err(corrupt(format!("invalid gap/tf lead byte {:#04x}", lead)))
}

/// Reads a gap/tf pair, lead byte included. Test/diagnostic entry point;
/// the run decoder reads the lead itself to dispatch markers.
pub fn read_gap_tf(data: &[u8], pos: &mut usize) -> Result<(u32, u32)> {
    let lead = take_byte(data, pos)?;
    read_gap_tf_body(lead, data, pos)
}

/// Encodes a sorted slice of live postings into one chunk run.
///
/// Requirements, enforced by the callers (flush engine and immediate
/// materialization): docids strictly ascending, every `sid >= 1`, every
/// `tf >= 1`, and positions (when present) ascending with
/// `positions.len() == tf`.
pub fn encode_run(postings: &[Posting], out: &mut Vec<u8>) {
    let mut last_rid = 0u32;
    let mut last_sid = 0u32;
    let mut const_score = 0u32;
    let mut positioned = false;
    for (idx, posting) in postings.iter().enumerate() {
        debug_assert!(posting.tf >= 1);
        debug_assert!(posting.doc.sid >= 1);
        let has_pos = !posting.positions.is_empty();
        if has_pos != positioned {
            out.push(MARK_POSITIONS);
            positioned = has_pos;
        }
        let mut inline_score = false;
        if posting.score != const_score {
            let next_has_same_score = postings
                .get(idx + 1)
                .map(|next| next.score == posting.score)
                .unwrap_or(false);
            if next_has_same_score {
                out.push(MARK_SCORE_CONST);
                write_varint(posting.score, out);
                const_score = posting.score;
            } else {
                out.push(MARK_SCORE_INLINE);
                inline_score = true;
            }
        }
        let rid_gap = posting.doc.rid - last_rid;
        write_gap_tf(rid_gap, posting.tf, out);
        let sid_field = if rid_gap == 0 {
            debug_assert!(posting.doc.sid > last_sid);
            posting.doc.sid - last_sid - 1
        } else {
            posting.doc.sid - 1
        };
        write_varint(sid_field, out);
        if inline_score {
            write_varint(posting.score, out);
        }
        if positioned {
            debug_assert_eq!(posting.positions.len(), posting.tf as usize);
            let mut prev = 0u32;
            for (pos_idx, &position) in posting.positions.iter().enumerate() {
                let delta = if pos_idx == 0 { position } else { position - prev };
                write_varint(delta, out);
                prev = position;
            }
        }
        last_rid = posting.doc.rid;
        last_sid = posting.doc.sid;
    }
}

/// Streaming decoder over one term's chunk run.
///
/// Owns the run bytes (chunk reads are copy-on-read windows already).
/// Yields postings in strictly ascending docid order. Never reads past the
/// end of the run it was constructed over; a truncated or malformed run
/// surfaces as a `DataCorruption` error.
pub struct RunDecoder {
    data: Vec<u8>,
    pos: usize,
    last_rid: u32,
    last_sid: u32,
    const_score: u32,
    positioned: bool,
    tf_cap: u32,
}

impl RunDecoder {
    pub fn new(data: Vec<u8>, tf_cap: u32) -> RunDecoder {
        RunDecoder {
            data,
            pos: 0,
            last_rid: 0,
            last_sid: 0,
            const_score: 0,
            positioned: false,
            tf_cap,
        }
    }

    pub fn next_posting(&mut self) -> Result<Option<Posting>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let mut inline_score = false;
        let lead = loop {
            let byte = take_byte(&self.data, &mut self.pos)?;
            match byte {
                MARK_POSITIONS => self.positioned = !self.positioned,
                MARK_SCORE_CONST => {
                    self.const_score = read_varint(&self.data, &mut self.pos)?;
                }
                MARK_SCORE_INLINE => inline_score = true,
                other => break other,
            }
        };
        let (rid_gap, tf) = read_gap_tf_body(lead, &self.data, &mut self.pos)?;
        if tf > self.tf_cap {
            return Err(corrupt(format!(
                "decoded tf {} exceeds cap {}",
                tf, self.tf_cap
            )));
        }
        let sid_field = read_varint(&self.data, &mut self.pos)?;
        let rid = self
            .last_rid
            .checked_add(rid_gap)
            .ok_or_else(|| corrupt("rid gap overflow in chunk run".to_string()))?;
        let sid = if rid_gap == 0 {
            self.last_sid
                .checked_add(sid_field)
                .and_then(|v| v.checked_add(1))
                .ok_or_else(|| corrupt("sid gap overflow in chunk run".to_string()))?
        } else {
            sid_field
                .checked_add(1)
                .ok_or_else(|| corrupt("sid overflow in chunk run".to_string()))?
        };
        let score = if inline_score {
            read_varint(&self.data, &mut self.pos)?
        } else {
            self.const_score
        };
        let mut positions: SmallVec<[u32; 4]> = SmallVec::new();
        if self.positioned {
            let mut absolute = 0u32;
            for pos_idx in 0..tf {
                let delta = read_varint(&self.data, &mut self.pos)?;
                absolute = if pos_idx == 0 {
                    delta
                } else {
                    absolute
                        .checked_add(delta)
                        .ok_or_else(|| corrupt("position gap overflow".to_string()))?
                };
                positions.push(absolute);
            }
        }
        self.last_rid = rid;
        self.last_sid = sid;
        Ok(Some(Posting {
            doc: DocAddr::new(rid, sid),
            tf,
            score,
            positions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::config::DEFAULT_TF_CAP;

    fn roundtrip_gap_tf(gap: u32, tf: u32) -> (usize, u32, u32) {
        let mut buf = Vec::new();
        write_gap_tf(gap, tf, &mut buf);
        let mut pos = 0;
        let decoded = read_gap_tf(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
        (buf.len(), decoded.0, decoded.1)
    }

    #[test]
    fn test_gap_tf_size_classes() {
        // (gap, tf, expected encoded length)
        let cases = [
            (0, 1, 1),
            (63, 2, 1),
            (64, 1, 2),
            (1023, 16, 2),
            (1024, 1, 3),
            ((1 << 15) - 1, 64, 3),
            (1 << 15, 1, 4),
            ((1 << 20) - 1, 256, 4),
            (1 << 20, 1, 5),
            ((1 << 25) - 1, 1024, 5),
        ];
        for &(gap, tf, expected_len) in &cases {
            let (len, got_gap, got_tf) = roundtrip_gap_tf(gap, tf);
            assert_eq!(len, expected_len, "gap={} tf={}", gap, tf);
            assert_eq!((got_gap, got_tf), (gap, tf));
        }
    }

    #[test]
    fn test_gap_tf_escape_class() {
        for &(gap, tf) in &[
            (1 << 25, 1),
            (u32::MAX, 1),
            (0, 1025),
            (0, DEFAULT_TF_CAP),
            (u32::MAX, DEFAULT_TF_CAP),
        ] {
            let (_, got_gap, got_tf) = roundtrip_gap_tf(gap, tf);
            assert_eq!((got_gap, got_tf), (gap, tf));
        }
    }

    #[test]
    fn test_varint_boundaries() {
        for &v in &[
            0,
            1,
            127,
            128,
            (1 << 14) - 1,
            1 << 14,
            (1 << 21) - 1,
            1 << 21,
            (1 << 28) - 1,
            1 << 28,
            u32::MAX,
        ] {
            let mut buf = Vec::new();
            write_varint(v, &mut buf);
            assert!(buf.len() <= 5);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_truncated_varint_is_an_error() {
        let mut buf = Vec::new();
        write_varint(1 << 20, &mut buf);
        buf.pop();
        let mut pos = 0;
        assert!(read_varint(&buf, &mut pos).is_err());
    }

    #[test]
    fn test_invalid_lead_byte_is_an_error() {
        for lead in 0xF9u8..=0xFC {
            let buf = [lead, 0, 0];
            let mut pos = 0;
            assert!(read_gap_tf(&buf, &mut pos).is_err());
        }
    }

    fn decode_all(data: &[u8]) -> Vec<Posting> {
        let mut decoder = RunDecoder::new(data.to_vec(), DEFAULT_TF_CAP);
        let mut postings = Vec::new();
        while let Some(posting) = decoder.next_posting().unwrap() {
            postings.push(posting);
        }
        postings
    }

    #[test]
    fn test_run_roundtrip_plain() {
        let postings = vec![
            Posting::new(DocAddr::new(1, 1), 1, 0, &[]),
            Posting::new(DocAddr::new(1, 2), 2, 0, &[]),
            Posting::new(DocAddr::new(7, 1), 1, 0, &[]),
        ];
        let mut buf = Vec::new();
        encode_run(&postings, &mut buf);
        assert_eq!(decode_all(&buf), postings);
    }

    #[test]
    fn test_run_roundtrip_with_positions_and_scores() {
        let postings = vec![
            Posting {
                doc: DocAddr::new(5, 1),
                tf: 3,
                score: 0,
                positions: smallvec![2, 9, 40],
            },
            Posting {
                doc: DocAddr::new(5, 2),
                tf: 1,
                score: 7,
                positions: smallvec![0],
            },
            Posting {
                doc: DocAddr::new(6, 1),
                tf: 1,
                score: 7,
                positions: smallvec![11],
            },
            // Positions switch off, score changes once.
            Posting::new(DocAddr::new(9, 1), 4, 3, &[]),
        ];
        let mut buf = Vec::new();
        encode_run(&postings, &mut buf);
        assert_eq!(decode_all(&buf), postings);
    }

    #[test]
    fn test_run_score_marker_suppression() {
        // Three identical-score postings should pay the score marker once.
        let scored: Vec<Posting> = (1..=3)
            .map(|rid| Posting::new(DocAddr::new(rid, 1), 1, 42, &[]))
            .collect();
        let mut buf_scored = Vec::new();
        encode_run(&scored, &mut buf_scored);

        let unscored: Vec<Posting> = (1..=3)
            .map(|rid| Posting::new(DocAddr::new(rid, 1), 1, 0, &[]))
            .collect();
        let mut buf_unscored = Vec::new();
        encode_run(&unscored, &mut buf_unscored);

        // One MARK_SCORE_CONST byte plus one varint(42).
        assert_eq!(buf_scored.len(), buf_unscored.len() + 2);
        assert_eq!(decode_all(&buf_scored), scored);
    }

    #[test]
    fn test_empty_run() {
        let mut buf = Vec::new();
        encode_run(&[], &mut buf);
        assert!(buf.is_empty());
        assert!(decode_all(&buf).is_empty());
    }
}
