//! Definition of grist's error and result types.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::PoisonError;

use thiserror::Error;

/// Error payload describing on-disk or in-segment corruption.
///
/// Corruption contained to a single term's list is logged and recovered
/// from in place; a `DataCorruption` error is only returned when a shared
/// structure (header, slot table, chunk run framing) is affected.
pub struct DataCorruption {
    filepath: Option<PathBuf>,
    comment: String,
}

impl DataCorruption {
    pub fn new(filepath: PathBuf, comment: String) -> DataCorruption {
        DataCorruption {
            filepath: Some(filepath),
            comment,
        }
    }

    pub fn comment_only<S: Into<String>>(comment: S) -> DataCorruption {
        DataCorruption {
            filepath: None,
            comment: comment.into(),
        }
    }
}

impl fmt::Debug for DataCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "Data corruption")?;
        if let Some(ref filepath) = &self.filepath {
            write!(f, " (in file `{:?}`)", filepath)?;
        }
        write!(f, ": {}.", self.comment)?;
        Ok(())
    }
}

/// The library's error enum.
#[derive(Debug, Error)]
pub enum GristError {
    /// Path does not exist.
    #[error("Path does not exist: '{0:?}'")]
    PathDoesNotExist(PathBuf),
    /// File already exists, this is a problem when we try to create a new index.
    #[error("File already exists: '{0:?}'")]
    FileAlreadyExists(PathBuf),
    /// IO error.
    #[error("An IO error occurred: '{0}'")]
    Io(#[from] io::Error),
    /// Data corruption in a shared structure.
    #[error("{0:?}")]
    DataCorruption(DataCorruption),
    /// A segment, buffer or the chunk heap is full.
    ///
    /// Recoverable: the caller may retry after reconfiguring the engine
    /// geometry. The engine never retries on its own.
    #[error("Resource exhausted: '{0}'")]
    ResourceExhausted(String),
    /// Invalid argument was passed by the user.
    #[error("An invalid argument was passed: '{0}'")]
    InvalidArgument(String),
    /// Internal/abnormal error: skip-list cycle, segment reference deadlock.
    #[error("Abnormal internal state: '{0}'")]
    Abnormal(String),
    /// Stored format tag is not one this build can handle.
    #[error("Incompatible index format: '{0}'")]
    IncompatibleFormat(String),
    /// A thread holding a lock panicked and poisoned the lock.
    #[error("A thread holding a lock panicked and poisoned the lock")]
    Poisoned,
}

impl From<DataCorruption> for GristError {
    fn from(data_corruption: DataCorruption) -> GristError {
        GristError::DataCorruption(data_corruption)
    }
}

impl<Guard> From<PoisonError<Guard>> for GristError {
    fn from(_: PoisonError<Guard>) -> GristError {
        GristError::Poisoned
    }
}

impl From<serde_json::Error> for GristError {
    fn from(error: serde_json::Error) -> GristError {
        let io_err = io::Error::from(error);
        GristError::Io(io_err)
    }
}
