//! Core data types: document addresses and postings.

use smallvec::SmallVec;

/// Dense integer identifier handed out by the term dictionary.
pub type TermId = u32;

/// Relevance score attached to a posting. Zero means "omitted".
pub type Score = u32;

/// Section id reserved for "the whole document". Never a valid endpoint
/// of a stored posting; used as a delete-all-sections marker.
pub const SID_WHOLE_DOC: u32 = 0;

/// Address of a posting: document id (`rid`) and section id (`sid`).
///
/// Total order is `(rid, sid)`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DocAddr {
    pub rid: u32,
    pub sid: u32,
}

impl DocAddr {
    pub fn new(rid: u32, sid: u32) -> DocAddr {
        DocAddr { rid, sid }
    }

    /// Address of "all sections of `rid`": the delete-whole-document marker.
    pub fn whole_doc(rid: u32) -> DocAddr {
        DocAddr {
            rid,
            sid: SID_WHOLE_DOC,
        }
    }

    pub fn is_whole_doc(&self) -> bool {
        self.sid == SID_WHOLE_DOC
    }

    /// Packs the address into a single comparable u64.
    #[inline]
    pub fn pack(&self) -> u64 {
        (u64::from(self.rid) << 32) | u64::from(self.sid)
    }
}

/// One occurrence record of a term in a document section.
///
/// `tf` and `score` may be zero to mean "omitted". A `tf` of zero on an
/// incoming update is a deletion marker and is never emitted by cursors.
/// Positions, when present, are intra-document token positions in
/// ascending order, and their count equals `tf`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Posting {
    pub doc: DocAddr,
    pub tf: u32,
    pub score: Score,
    pub positions: SmallVec<[u32; 4]>,
}

impl Posting {
    pub fn new(doc: DocAddr, tf: u32, score: Score, positions: &[u32]) -> Posting {
        Posting {
            doc,
            tf,
            score,
            positions: SmallVec::from_slice(positions),
        }
    }

    /// A deletion marker for `doc`.
    pub fn delete_marker(doc: DocAddr) -> Posting {
        Posting {
            doc,
            tf: 0,
            score: 0,
            positions: SmallVec::new(),
        }
    }

    pub fn is_delete_marker(&self) -> bool {
        self.tf == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_addr_order() {
        assert!(DocAddr::new(1, 2) < DocAddr::new(1, 3));
        assert!(DocAddr::new(1, u32::MAX) < DocAddr::new(2, 0));
        assert!(DocAddr::whole_doc(5) < DocAddr::new(5, 1));
        assert_eq!(
            DocAddr::new(1, 2) < DocAddr::new(1, 3),
            DocAddr::new(1, 2).pack() < DocAddr::new(1, 3).pack()
        );
    }

    #[test]
    fn test_whole_doc_marker() {
        let marker = Posting::delete_marker(DocAddr::whole_doc(42));
        assert!(marker.is_delete_marker());
        assert!(marker.doc.is_whole_doc());
    }
}
