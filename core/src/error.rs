use std::io;
use thiserror::Error;

/// Everything that can go wrong between a client call and the writer.
///
/// The engine never aborts: failures surface here and leave the previous
/// state visible, as if the failing operation had not happened.
#[derive(Debug, Error)]
pub enum Error {
    /// The string is not a valid path, key or dir.
    #[error("invalid path {0:?}")]
    InvalidPath(String),

    /// A write targeted a key shadowed by a lock in a lower layer.
    #[error("{0:?} is not writable")]
    NotWritable(String),

    /// The transport failed or the peer replied with an error.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A database file's header or archive failed validation.
    #[error("{path}: invalid database file: {reason}")]
    FileFormat { path: String, reason: String },

    /// The writer service could not persist a transaction.
    #[error("writer backend failure: {0}")]
    WriterBackend(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn file_format(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::FileFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
