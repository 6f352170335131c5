//! Error types shared by the storage engine and the TTL layer.
//!
//! "Not found" is not an error: lookups return `Ok(None)` for keys that are
//! absent, expired or orphaned.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A physical key or value could not be decoded.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Underlying storage failure, surfaced verbatim.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The source could not provide a consistent view in time.
    #[error("Busy: {0}")]
    Busy(String),

    /// Materializing a checkpoint failed; the partial directory was removed.
    #[error("Checkpoint at {path:?} failed: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}
