//! Crate-wide error types.
//!
//! `MercuryError` is the sum type every public operation returns through;
//! it wraps the finer-grained kinds (`ParseError`, `CorruptionError`) the
//! same way `oxigraph::store::StorageError` wraps `CorruptionError`.

use std::error::Error;
use std::io;

/// A structured SPARQL parse error: line, column, message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{line}:{column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// An error raised when on-disk content fails a consistency check.
#[derive(Debug, thiserror::Error)]
pub enum CorruptionError {
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Other(#[source] Box<dyn Error + Send + Sync + 'static>),
}

impl CorruptionError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Msg(message.into())
    }

    pub fn new(error: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        Self::Other(error.into())
    }
}

impl From<CorruptionError> for io::Error {
    fn from(error: CorruptionError) -> Self {
        Self::new(io::ErrorKind::InvalidData, error)
    }
}

/// The top-level error type returned by every fallible Mercury operation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MercuryError {
    /// Failure from the OS I/O layer or a detected on-disk corruption.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Data corruption detected in an atom store, WAL, or index file.
    #[error(transparent)]
    Corruption(#[from] CorruptionError),
    /// A SPARQL query or update failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// A store operation was requested that is not valid in the current
    /// state (e.g. `append_batch` without `begin_batch`, an operation on a
    /// disposed store).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// A second `begin_batch` was attempted while one was already active.
    #[error("a write batch is already active")]
    ConcurrentWrite,
    /// A `SERVICE` clause failed and was not marked `SILENT`.
    #[error("SERVICE <{iri}> failed: {message}")]
    ServiceFailure { iri: String, message: String },
    /// The query's cancellation token was triggered.
    #[error("query was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, MercuryError>;
