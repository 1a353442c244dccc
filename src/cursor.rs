//! Read cursor over one term's live postings.
//!
//! A cursor yields postings in strictly ascending docid order, merged on
//! the fly from the term's chunk run and its buffered records. Both sides
//! are copied out of shared storage when the cursor is opened, so the
//! cursor owns everything it reads: a flush or cache eviction running
//! after the open cannot invalidate it.

use crate::doc::Posting;
use crate::merge::{ChunkStream, MergedStream, SnapshotStream};
use crate::{GristError, Result};

enum CursorState {
    Exhausted,
    Immediate(Option<Posting>),
    Merged(MergedStream<ChunkStream, SnapshotStream>),
}

pub struct Cursor {
    state: CursorState,
    want_positions: bool,
    current: Option<Posting>,
    positions_read: u32,
}

impl Cursor {
    fn with_state(state: CursorState, want_positions: bool) -> Cursor {
        Cursor {
            state,
            want_positions,
            current: None,
            positions_read: 0,
        }
    }

    pub(crate) fn exhausted(want_positions: bool) -> Cursor {
        Cursor::with_state(CursorState::Exhausted, want_positions)
    }

    pub(crate) fn immediate(posting: Posting, want_positions: bool) -> Cursor {
        Cursor::with_state(CursorState::Immediate(Some(posting)), want_positions)
    }

    pub(crate) fn merged(
        stream: MergedStream<ChunkStream, SnapshotStream>,
        want_positions: bool,
    ) -> Cursor {
        Cursor::with_state(CursorState::Merged(stream), want_positions)
    }

    /// Advances to the next live posting. Returns `None` once drained.
    pub fn next(&mut self) -> Result<Option<&Posting>> {
        let mut next = match self.state {
            CursorState::Exhausted => None,
            CursorState::Immediate(ref mut posting) => posting.take(),
            CursorState::Merged(ref mut stream) => stream.next_live()?,
        };
        if let Some(ref mut posting) = next {
            if !self.want_positions {
                posting.positions.clear();
            }
        }
        self.positions_read = 0;
        self.current = next;
        Ok(self.current.as_ref())
    }

    /// The posting `next` last returned, if any.
    pub fn current(&self) -> Option<&Posting> {
        self.current.as_ref()
    }

    /// Next stored position of the current posting. May be called at most
    /// `tf` times per posting; overrunning is an error, not a wraparound.
    pub fn next_position(&mut self) -> Result<u32> {
        if !self.want_positions {
            return Err(GristError::InvalidArgument(
                "cursor was opened without positions".to_string(),
            ));
        }
        let posting = self.current.as_ref().ok_or_else(|| {
            GristError::InvalidArgument("no current posting to read positions from".to_string())
        })?;
        if self.positions_read >= posting.tf {
            return Err(GristError::InvalidArgument(format!(
                "position read overruns tf {} of docid ({}, {})",
                posting.tf, posting.doc.rid, posting.doc.sid
            )));
        }
        let value = posting
            .positions
            .get(self.positions_read as usize)
            .copied()
            .ok_or_else(|| {
                GristError::InvalidArgument(
                    "current posting carries no stored positions".to_string(),
                )
            })?;
        self.positions_read += 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::DocAddr;

    #[test]
    fn test_exhausted_cursor() {
        let mut cursor = Cursor::exhausted(false);
        assert!(cursor.next().unwrap().is_none());
        assert!(cursor.next().unwrap().is_none());
        assert!(cursor.current().is_none());
    }

    #[test]
    fn test_immediate_cursor_yields_once() {
        let posting = Posting::new(DocAddr::new(7, 1), 1, 0, &[3]);
        let mut cursor = Cursor::immediate(posting.clone(), true);
        assert_eq!(cursor.next().unwrap(), Some(&posting));
        assert_eq!(cursor.next_position().unwrap(), 3);
        assert!(cursor.next_position().is_err());
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn test_positions_stripped_when_not_wanted() {
        let posting = Posting::new(DocAddr::new(7, 1), 1, 0, &[3]);
        let mut cursor = Cursor::immediate(posting, false);
        let yielded = cursor.next().unwrap().unwrap();
        assert!(yielded.positions.is_empty());
        assert!(cursor.next_position().is_err());
    }

    #[test]
    fn test_position_read_requires_current() {
        let posting = Posting::new(DocAddr::new(7, 1), 1, 0, &[3]);
        let mut cursor = Cursor::immediate(posting, true);
        assert!(cursor.next_position().is_err());
    }
}
