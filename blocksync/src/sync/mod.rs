//! Incremental synchronization engine.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use arrow::datatypes::SchemaRef;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;
use tokio::sync::OwnedMutexGuard;
use url::Url;

use crate::fetch::{FetchClient, FetchError, HttpFetchClient, Query};
use crate::sort::ExternalSorter;
use crate::store::{columns, Bounds, CacheStore};
use crate::{CacheKey, Error, Result, SyncConfig};

mod lock;
use lock::KeyLocks;

const RUNS_DIR: &str = "runs";

/// How current the served cache is.
#[derive(Debug)]
pub enum Freshness {
    /// New rows were fetched and merged into the cache.
    Updated,
    /// The remote service had nothing new, the cache was kept as is.
    UpToDate,
    /// The refresh failed and the previous cache is served instead.
    Degraded(Error),
}

/// Outcome of a sync, handed back to the caller.
#[derive(Debug)]
pub struct SyncReport {
    pub cache_path: PathBuf,
    /// Blocks spanned by the cache, both ends included.
    pub total_blocks: u64,
    pub total_records: u64,
    /// Rows fetched by this sync.
    pub fetched_records: u64,
    pub elapsed: Duration,
    /// First block requested from the remote service.
    pub resume_block: u64,
    /// Whether a usable cache existed before this sync.
    pub was_cached: bool,
    pub freshness: Freshness,
}

impl SyncReport {
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        matches!(self.freshness, Freshness::Degraded(_))
    }
}

/// Cache state read before fetching.
#[derive(Debug)]
struct Cached {
    bounds: Bounds,
    schema: SchemaRef,
}

/// Outcome of the fetch-sort-merge part of a sync.
enum Refresh {
    Updated { bounds: Bounds, fetched: u64 },
    Empty,
}

/// Synchronization engine.
///
/// Each call to [`SyncEngine::sync`] extends the cache of one key with the blocks the remote service has beyond the cached ones.
/// Syncs of the same key are serialized, syncs of distinct keys run independently.
///
/// # Example
/// ```no_run
/// # tokio_test::block_on(async {
/// use blocksync::{CacheKey, Networks, RecordType, SyncConfig, SyncEngine};
///
/// let engine = SyncEngine::new(SyncConfig::new("cache"));
/// let networks = Networks::default();
///
/// let key = CacheKey::new("eth", RecordType::Event, "0xdAC17F958D2ee523a2206206994597C13D831ec7")?;
/// let report = engine.sync(&key, &networks.resolve_or_default("eth")).await?;
///
/// println!(
///     "{} records over {} blocks in {:.2}s (cached: {}, degraded: {})",
///     report.total_records,
///     report.total_blocks,
///     report.elapsed_secs(),
///     report.was_cached,
///     report.is_degraded(),
/// );
/// # Ok::<_, blocksync::Error>(())
/// # }).unwrap();
/// ```
#[derive(Debug)]
pub struct SyncEngine<F = HttpFetchClient> {
    config: SyncConfig,
    store: CacheStore,
    client: F,
    locks: KeyLocks,
}

impl SyncEngine<HttpFetchClient> {
    /// Create an engine fetching over HTTP.
    pub fn new(config: SyncConfig) -> Self {
        Self::with_client(config, HttpFetchClient::default())
    }
}

impl<F: FetchClient> SyncEngine<F> {
    /// Create an engine with a given fetch client.
    ///
    /// Leftovers of interrupted syncs under the cache root are cleaned up, once idle for [`SyncConfig::stale_after`].
    pub fn with_client(config: SyncConfig, client: F) -> Self {
        let store = CacheStore::new(config.cache_root());

        match store.clean_stale(config.stale_after()) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!("Cleaned {removed} stale entries from `{}`", store.root().display()),
            Err(err) => tracing::warn!("Cannot clean stale entries from `{}`: {err}", store.root().display()),
        }

        Self {
            config,
            store,
            client,
            locks: KeyLocks::default(),
        }
    }

    #[inline]
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    #[inline]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Bring the cache of `key` up to date with the remote service at `remote`.
    ///
    /// Refresh failures are served from the existing cache when there is one, flagged as [`Freshness::Degraded`]. Only failures
    /// without any cache to fall back on, and cache write failures, are returned as errors.
    ///
    /// Dropping the returned future cancels the fetch, and the temporary fetch directory is removed all the same.
    pub async fn sync(&self, key: &CacheKey, remote: &Url) -> Result<SyncReport> {
        let started = Instant::now();

        let guard = self.locks.acquire(key).await;

        let cache_path = self.store.cache_path(key);
        let cached = self.load_cached(&cache_path).await;
        let resume_block = cached.as_ref().map_or(0, |cached| cached.bounds.max.saturating_add(1));

        tracing::debug!("Syncing {key} from block {resume_block}");

        let refresh = self.refresh(key, remote, &cache_path, resume_block, cached.as_ref(), guard).await;

        let (bounds, fetched, freshness) = match (refresh, &cached) {
            (Ok(Refresh::Updated { bounds, fetched }), _) => (bounds, fetched, Freshness::Updated),
            (Ok(Refresh::Empty), Some(cached)) => (cached.bounds, 0, Freshness::UpToDate),
            (Ok(Refresh::Empty), None) => {
                tracing::debug!("No data for {key}");
                return Err(Error::NoData);
            }
            (Err(err), Some(cached)) if err.is_recoverable() => {
                tracing::warn!("Serving stale cache for {key}: {err}");
                (cached.bounds, 0, Freshness::Degraded(err))
            }
            (Err(err), _) => return Err(err),
        };

        let report = SyncReport {
            cache_path,
            total_blocks: bounds.total_blocks(),
            total_records: bounds.rows,
            fetched_records: fetched,
            elapsed: started.elapsed(),
            resume_block,
            was_cached: cached.is_some(),
            freshness,
        };

        tracing::debug!(
            "Synced {key}: {} records over {} blocks ({} new) in {:.3}s",
            report.total_records,
            report.total_blocks,
            report.fetched_records,
            report.elapsed_secs()
        );

        Ok(report)
    }

    /// Sync many keys, at most [`SyncConfig::concurrent_syncs`] at once.
    ///
    /// Results come back in completion order.
    pub async fn sync_many<I>(&self, requests: I) -> Vec<(CacheKey, Result<SyncReport>)>
    where
        I: IntoIterator<Item = (CacheKey, Url)>,
    {
        stream::iter(requests)
            .map(|(key, remote)| async move {
                let res = self.sync(&key, &remote).await;
                (key, res)
            })
            .buffer_unordered(self.config.concurrent_syncs())
            .collect()
            .await
    }

    /// Read the bounds and schema of the current cache file.
    ///
    /// Missing, empty or unreadable files all count as no cache.
    async fn load_cached(&self, path: &Path) -> Option<Cached> {
        if !CacheStore::exists(path) {
            return None;
        }

        let path = path.to_path_buf();
        let res = tokio::task::spawn_blocking(move || {
            let bounds = CacheStore::read_bounds(&path)?;
            let schema = CacheStore::read_schema(&path)?;
            Ok::<_, Error>(bounds.map(|bounds| Cached { bounds, schema }))
        })
        .await
        .map_err(Error::from)
        .and_then(|res| res);

        match res {
            Ok(Some(cached)) => Some(cached),
            Ok(None) => {
                tracing::debug!("Ignoring empty cache file");
                None
            }
            Err(err) => {
                tracing::warn!("Ignoring unreadable cache file: {err}");
                None
            }
        }
    }

    /// Fetch blocks from `resume_block` onwards and merge them into the cache.
    ///
    /// The fetch directory and the key lock move into the blocking merge task, so they are released once the merge is done
    /// even if this future has been dropped in the meantime.
    async fn refresh(
        &self,
        key: &CacheKey,
        remote: &Url,
        cache_path: &Path,
        resume_block: u64,
        cached: Option<&Cached>,
        guard: OwnedMutexGuard<()>,
    ) -> Result<Refresh> {
        let fetch_dir = self.store.fetch_dir()?;
        let fetched_path = fetch_dir.path().join(key.kind().file_name());

        let query = Query::new(key, resume_block);
        let fetch = self.client.fetch(remote, &query, &fetched_path);

        let bytes = match self.config.fetch_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, fetch)
                .await
                .map_err(|_| FetchError::Timeout(timeout))??,
            None => fetch.await?,
        };

        tracing::debug!("Fetched {bytes} bytes for {key} from block {resume_block}");

        if !fetched_path.is_file() || bytes == 0 {
            return Ok(Refresh::Empty);
        }

        let sorter = ExternalSorter::new(self.config.chunk_rows(), self.config.merge_batch_rows());
        let cache_path = cache_path.to_path_buf();
        let cached_schema = cached.map(|cached| cached.schema.clone());

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let res = merge_fetched(&sorter, &fetch_dir, &fetched_path, &cache_path, cached_schema);

            if let Err(err) = fetch_dir.close() {
                tracing::warn!("Cannot remove fetch directory: {err}");
            }

            res
        })
        .await?
    }
}

/// Sort fetched rows and merge them with the current cache, if any, into a new cache file.
fn merge_fetched(
    sorter: &ExternalSorter,
    fetch_dir: &TempDir,
    fetched_path: &Path,
    cache_path: &Path,
    cached_schema: Option<SchemaRef>,
) -> Result<Refresh> {
    let runs = sorter.split(fetched_path, &fetch_dir.path().join(RUNS_DIR))?;

    if runs.rows == 0 {
        return Ok(Refresh::Empty);
    }

    tracing::trace!("Sorted {} fetched rows into {} runs", runs.rows, runs.paths.len());

    let mut sources = Vec::with_capacity(runs.paths.len() + 1);

    let schema = match cached_schema {
        Some(schema) => {
            columns::ensure_compatible(&schema, &runs.schema)?;
            sources.push(cache_path.to_path_buf());
            schema
        }
        None => runs.schema.clone(),
    };

    sources.extend(runs.paths);

    let mut merged = sorter.merge(&sources, schema.clone())?;
    CacheStore::write_atomic(cache_path, schema, &mut merged)?;

    let bounds = merged.bounds().ok_or(Error::NoData)?;

    Ok(Refresh::Updated {
        bounds,
        fetched: runs.rows,
    })
}

#[cfg(test)]
mod tests;
