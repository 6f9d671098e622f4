//! Incremental local cache of block-ordered blockchain records.
//!
//! This crate keeps, per `(network, record type, address)` key, a local Parquet file holding every event (log) or transaction
//! record a remote indexing service knows for that address, ordered by `block_number`. Every sync:
//! - resumes right after the last cached block, so history is never fetched twice,
//! - fetches the missing range into a scoped temporary directory,
//! - checks that the fetched columns match the cached ones,
//! - sorts the new rows with a chunked external sort and merges them with the cache in a single ordered pass,
//! - atomically replaces the cache file, so readers only ever see a complete old or complete new version.
//!
//! When a refresh fails and a cache exists, the cache is served anyway and the report is flagged as
//! [`Freshness::Degraded`]. Only failures without any fallback are returned as errors.
//!
//! As a **strong hypothesis**, we can assume that the remote service never re-emits already fetched blocks: records are not
//! deduplicated beyond resuming at `max(block_number) + 1`.
//!
//! Here is the local cache layout:
//!
//! ```text
//!     - cache root
//!       L {network}_{address}_{events|transactions}
//!         L log.parquet | transaction.parquet
//!         L .tmpXXXXXX.parquet        (cache write in progress)
//!       L .fetch-XXXXXX               (fetch in progress)
//! ```
//!
//! Leftover temporary entries from interrupted processes are cleaned when a [`SyncEngine`] is created, once they have been
//! idle for [`SyncConfig::stale_after`].

mod error;
pub use error::*;

mod config;
pub use config::*;

mod key;
pub use key::*;

pub mod fetch;
pub use fetch::{FetchClient, HttpFetchClient, Query};

pub mod store;
pub use store::{Bounds, CacheStore, BLOCK_NUMBER};

pub mod sort;
pub use sort::ExternalSorter;

mod sync;
pub use sync::*;

pub mod stats;
