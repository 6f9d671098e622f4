//! Error taxonomy shared by the cache store, the sorter and the synchronization engine.

use std::io;

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use thiserror::Error;

pub use crate::fetch::FetchError;

/// A specialized `Result` type for cache synchronization.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The remote service returned no rows and there is no prior cache to serve.
    #[error("no data available for this key")]
    NoData,

    /// Newly fetched rows do not share the column set of the existing cache.
    ///
    /// The fetch is discarded and the cache is left untouched.
    #[error("fetched columns {fetched:?} do not match cached columns {cached:?}")]
    SchemaMismatch { cached: Vec<String>, fetched: Vec<String> },

    /// A row carries a missing or unparsable `block_number`.
    #[error("malformed record at row {row}: {reason}")]
    MalformedRecord { row: u64, reason: String },

    #[error("remote fetch failed: {0}")]
    RemoteFetch(#[from] FetchError),

    /// Writing or renaming the cache file failed.
    #[error("cache write failed: {0}")]
    CacheWrite(#[source] io::Error),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Parquet(#[from] ParquetError),

    #[error(transparent)]
    Arrow(#[from] ArrowError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether a sync hitting this error may still serve a prior cache.
    ///
    /// Everything but a failed cache write and an invalid key degrades to the existing cache when there is one.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::CacheWrite(_) | Self::InvalidKey(_))
    }

    pub(crate) fn malformed(row: u64, reason: impl Into<String>) -> Self {
        Self::MalformedRecord { row, reason: reason.into() }
    }
}
