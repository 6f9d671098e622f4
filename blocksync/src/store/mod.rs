//! On-disk columnar cache: one Parquet file per cache key.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use tempfile::TempDir;

use crate::{CacheKey, Error, Result};

pub mod columns;
pub use columns::BLOCK_NUMBER;

const FETCH_PREFIX: &str = ".fetch-";
/// Prefix of every temporary entry created inside a key directory.
pub(crate) const TEMP_PREFIX: &str = ".tmp";
const SCAN_BATCH_ROWS: usize = 64 * 1_024;

/// Block range and row count of a cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: u64,
    pub max: u64,
    pub rows: u64,
}

impl Bounds {
    /// Number of blocks spanned, both ends included.
    #[inline]
    pub fn total_blocks(&self) -> u64 {
        self.max - self.min + 1
    }

    /// Fold the bounds of `rows` more rows into `bounds`.
    pub(crate) fn extend(bounds: Option<Self>, min: u64, max: u64, rows: u64) -> Option<Self> {
        if rows == 0 {
            return bounds;
        }

        Some(match bounds {
            Some(b) => Self {
                min: b.min.min(min),
                max: b.max.max(max),
                rows: b.rows + rows,
            },
            None => Self { min, max, rows },
        })
    }
}

/// Cache file store rooted at a local directory.
///
/// ```text
///     - cache root
///       L {network}_{address}_events
///         L log.parquet
///       L {network}_{address}_transactions
///         L transaction.parquet
///       L .fetch-XXXXXX            (in-flight fetch, removed on every exit path)
///         L log.parquet | transaction.parquet
///         L runs/run-N.parquet
/// ```
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Directory holding the cache file of `key`.
    #[inline]
    pub fn cache_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    /// Path of the cache file of `key`.
    #[inline]
    pub fn cache_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir(key).join(key.kind().file_name())
    }

    #[inline]
    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    /// Scan the `block_number` column of a cache file for its bounds.
    ///
    /// Returns `None` for a file without any row.
    pub fn read_bounds(path: &Path) -> Result<Option<Bounds>> {
        let mut bounds = None;
        let mut offset = 0;

        for batch in open_block_numbers(path, SCAN_BATCH_ROWS)? {
            let batch = batch?;
            let numbers = columns::block_numbers(&batch, offset)?;

            if let (Some(min), Some(max)) = (arrow::compute::min(&numbers), arrow::compute::max(&numbers)) {
                bounds = Bounds::extend(bounds, min, max, numbers.len() as u64);
            }

            offset += batch.num_rows() as u64;
        }

        Ok(bounds)
    }

    /// Read the Arrow schema of a cache file.
    pub fn read_schema(path: &Path) -> Result<SchemaRef> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        Ok(builder.schema().clone())
    }

    /// Read a whole file in batches of `batch_rows`.
    pub fn open(path: &Path, batch_rows: usize) -> Result<ParquetRecordBatchReader> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        Ok(builder.with_batch_size(batch_rows).build()?)
    }

    /// Write `batches` to `path` through a temporary sibling file renamed into place.
    ///
    /// Readers see either the previous file or the complete new one. Any error, whether raised by the batches or by the write
    /// itself, leaves `path` untouched and removes the temporary file. Returns the number of rows written.
    pub fn write_atomic<I>(path: &Path, schema: SchemaRef, batches: I) -> Result<u64>
    where
        I: IntoIterator<Item = Result<RecordBatch>>,
    {
        let dir = path.parent().ok_or_else(|| Error::CacheWrite(io::ErrorKind::InvalidInput.into()))?;

        std::fs::create_dir_all(dir).map_err(Error::CacheWrite)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".parquet")
            .tempfile_in(dir)
            .map_err(Error::CacheWrite)?;

        let rows = write_batches(tmp.as_file_mut(), schema, batches)?;

        tmp.as_file().sync_all().map_err(Error::CacheWrite)?;
        tmp.persist(path).map_err(|err| Error::CacheWrite(err.error))?;

        tracing::trace!("Replaced cache file with {rows} rows: `{}`", path.display());

        Ok(rows)
    }

    /// Create a scoped temporary fetch directory under the cache root.
    ///
    /// The directory and everything in it is removed when the returned guard is dropped.
    pub fn fetch_dir(&self) -> io::Result<TempDir> {
        std::fs::create_dir_all(&self.root)?;
        tempfile::Builder::new().prefix(FETCH_PREFIX).tempdir_in(&self.root)
    }

    /// Remove fetch directories and temporary cache entries left behind by interrupted processes.
    ///
    /// Only entries with nothing modified for at least `stale_after` are removed, so a fetch or a write still running in
    /// another engine over the same root is left alone. Returns the number of removed entries.
    pub fn clean_stale(&self, stale_after: Duration) -> io::Result<usize> {
        if !self.root.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;

        for entry in self.root.read_dir()? {
            let entry = entry?;
            let path = entry.path();

            if !entry.file_type()?.is_dir() {
                continue;
            }

            if is_prefixed(&path, FETCH_PREFIX) {
                if remove_stale(&path, stale_after)? {
                    tracing::trace!("Clean incomplete fetch from local storage: `{}`", path.display());
                    removed += 1;
                }
                continue;
            }

            for entry in path.read_dir()? {
                let path = entry?.path();

                if is_prefixed(&path, TEMP_PREFIX) && remove_stale(&path, stale_after)? {
                    tracing::trace!("Clean incomplete cache write from local storage: `{}`", path.display());
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

/// Latest modification time of `path` and, for a directory, of everything below it.
fn last_modified(path: &Path) -> io::Result<SystemTime> {
    let meta = std::fs::symlink_metadata(path)?;
    let mut modified = meta.modified()?;

    if meta.is_dir() {
        for entry in path.read_dir()? {
            modified = modified.max(last_modified(&entry?.path())?);
        }
    }

    Ok(modified)
}

/// Remove `path` if nothing in it changed for `stale_after`.
///
/// Entries vanishing in the meantime, removed by their owner, count as not removed.
fn remove_stale(path: &Path, stale_after: Duration) -> io::Result<bool> {
    let modified = match last_modified(path) {
        Ok(modified) => modified,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    // modification times in the future are never stale
    if !modified.elapsed().is_ok_and(|age| age >= stale_after) {
        return Ok(false);
    }

    let res = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match res {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn is_prefixed(path: &Path, prefix: &str) -> bool {
    path.file_name().and_then(|name| name.to_str()).is_some_and(|name| name.starts_with(prefix))
}

/// Stream only the `block_number` column of a file.
pub(crate) fn open_block_numbers(path: &Path, batch_rows: usize) -> Result<ParquetRecordBatchReader> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;

    let leaf = builder
        .parquet_schema()
        .columns()
        .iter()
        .position(|column| column.name() == BLOCK_NUMBER)
        .ok_or_else(|| Error::malformed(0, format!("missing `{BLOCK_NUMBER}` column")))?;

    let mask = ProjectionMask::leaves(builder.parquet_schema(), [leaf]);

    Ok(builder.with_projection(mask).with_batch_size(batch_rows).build()?)
}

/// Encode `batches` into `out`.
///
/// Errors of the batches themselves are returned as is, while every failure of the encoder or of `out` is a cache write
/// failure.
fn write_batches<W, I>(out: W, schema: SchemaRef, batches: I) -> Result<u64>
where
    W: Write + Send,
    I: IntoIterator<Item = Result<RecordBatch>>,
{
    let props = WriterProperties::builder().set_compression(Compression::SNAPPY).build();
    let mut writer = ArrowWriter::try_new(out, schema, Some(props)).map_err(write_error)?;
    let mut rows = 0;

    for batch in batches {
        let batch = batch?;
        rows += batch.num_rows() as u64;
        writer.write(&batch).map_err(write_error)?;
    }

    writer.close().map_err(write_error)?;

    Ok(rows)
}

fn write_error(err: ParquetError) -> Error {
    let err = match err {
        ParquetError::External(err) => match err.downcast::<io::Error>() {
            Ok(err) => *err,
            Err(err) => io::Error::other(err),
        },
        err => io::Error::other(err),
    };

    Error::CacheWrite(err)
}
