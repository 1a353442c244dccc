//! # `grist`
//!
//! Grist is a disk-resident posting-list storage and merge engine: the
//! lower half of a full-text index. It stores, for each term id handed
//! out by an external dictionary, an updatable list of postings
//! (document/section address, term frequency, optional score and token
//! positions) and serves them back in ascending docid order.
//!
//! Recent updates live in mutable, memory-mapped buffer segments whose
//! per-term record chains stay sorted via an embedded skip list. A full
//! buffer is flushed: each term's buffered records are merged with its
//! existing compressed run and re-encoded into a fresh run in the chunk
//! heap. Readers merge the two tiers on the fly, so a cursor never sees
//! a stale or duplicated posting.
//!
//! ```rust
//! use grist::{DocAddr, EngineConfig, Posting, PostingEngine};
//!
//! # fn main() -> grist::Result<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let engine = PostingEngine::create(&dir.path().join("index"), EngineConfig::default())?;
//!
//! // Term 1 occurs twice in section 1 of document 4.
//! engine.update(1, Posting::new(DocAddr::new(4, 1), 2, 0, &[10, 25]))?;
//!
//! let mut cursor = engine.open_cursor(1, true)?;
//! let posting = cursor.next()?.unwrap();
//! assert_eq!(posting.doc, DocAddr::new(4, 1));
//! assert_eq!(cursor.next_position()?, 10);
//! # Ok(())
//! # }
//! ```

mod buffer;
mod chunk;
mod codec;
mod config;
mod cursor;
mod doc;
mod engine;
mod error;
mod flush;
mod locator;
mod merge;
mod segment;

pub use crate::config::{EngineConfig, DEFAULT_MAX_JUMP_DEPTH, DEFAULT_TF_CAP};
pub use crate::cursor::Cursor;
pub use crate::doc::{DocAddr, Posting, Score, TermId, SID_WHOLE_DOC};
pub use crate::engine::{EngineStat, PostingEngine, TermLexicon};
pub use crate::error::{DataCorruption, GristError};
pub use crate::segment::SegmentFormat;

/// `Result` alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GristError>;
