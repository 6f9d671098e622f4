//! Chunked external sort by `block_number`.
//!
//! Input is read in windows of `chunk_rows` rows. Each window is validated, sorted in memory and spilled to its own run file.
//! Runs are then merged with a k-way merge holding a single batch per run, so peak memory only depends on the window size,
//! the merge batch size and the number of runs, never on the total input size.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use arrow::array::{Array, UInt64Array};
use arrow::compute;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use parquet::arrow::arrow_reader::ParquetRecordBatchReader;
use parquet::arrow::ArrowWriter;

use crate::store::{columns, Bounds, CacheStore, TEMP_PREFIX};
use crate::Result;

const RUN_PREFIX: &str = "run-";

/// Sorted runs spilled to scratch space.
#[derive(Debug)]
pub struct SortedRuns {
    /// Schema captured from the first chunk.
    pub schema: SchemaRef,
    /// One file per input window, each sorted by `block_number`.
    pub paths: Vec<PathBuf>,
    /// Total rows across runs.
    pub rows: u64,
}

/// External sorter bounded to `chunk_rows` rows in memory.
#[derive(Debug, Clone, Copy)]
pub struct ExternalSorter {
    chunk_rows: NonZeroUsize,
    merge_batch_rows: NonZeroUsize,
}

impl ExternalSorter {
    pub fn new(chunk_rows: NonZeroUsize, merge_batch_rows: NonZeroUsize) -> Self {
        Self {
            chunk_rows,
            merge_batch_rows,
        }
    }

    /// Sort `input` by `block_number` into `output`, replacing it atomically.
    ///
    /// Scratch runs are spilled next to `output`, where stale cleanup finds them after a crash, and removed before returning. Returns `None` when `input` has no row,
    /// in which case `output` is not written.
    pub fn sort_by_block_number(&self, input: &Path, output: &Path) -> Result<Option<Bounds>> {
        let dir = output.parent().unwrap_or(Path::new("."));
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{TEMP_PREFIX}-sort-"))
            .tempdir_in(dir)?;

        let runs = self.split(input, scratch.path())?;

        if runs.rows == 0 {
            return Ok(None);
        }

        let mut merged = self.merge(&runs.paths, runs.schema.clone())?;
        CacheStore::write_atomic(output, runs.schema, &mut merged)?;

        Ok(merged.bounds())
    }

    /// Split `input` into sorted runs written under `scratch`.
    ///
    /// Every `block_number` is validated before anything is written outside of `scratch`, so a malformed row aborts the whole
    /// input.
    pub fn split(&self, input: &Path, scratch: &Path) -> Result<SortedRuns> {
        std::fs::create_dir_all(scratch)?;

        let reader = CacheStore::open(input, self.chunk_rows.get())?;
        let schema = reader.schema();

        let mut paths = vec![];
        let mut rows = 0;

        for batch in reader {
            let batch = batch?;

            if batch.num_rows() == 0 {
                continue;
            }

            let numbers = columns::block_numbers(&batch, rows)?;
            let sorted = sort_batch(&batch, &numbers)?;

            let path = scratch.join(format!("{RUN_PREFIX}{}.parquet", paths.len()));
            let mut writer = ArrowWriter::try_new(File::create(&path)?, schema.clone(), None)?;
            writer.write(&sorted)?;
            writer.close()?;

            tracing::trace!("Spilled sorted run of {} rows: `{}`", sorted.num_rows(), path.display());

            rows += batch.num_rows() as u64;
            paths.push(path);
        }

        Ok(SortedRuns { schema, paths, rows })
    }

    /// Merge sorted run files into a single ordered stream of batches following `schema`.
    ///
    /// Rows with equal block numbers keep the order of the runs they come from.
    pub fn merge(&self, runs: &[PathBuf], schema: SchemaRef) -> Result<MergedRuns> {
        let mut heap = BinaryHeap::with_capacity(runs.len());
        let mut cursors = Vec::with_capacity(runs.len());

        for path in runs {
            let mut cursor = Cursor::open(path, schema.clone(), self.merge_batch_rows.get())?;

            if cursor.advance()? {
                heap.push(Reverse((cursor.key(), cursors.len())));
            }

            cursors.push(cursor);
        }

        Ok(MergedRuns {
            schema,
            cursors,
            heap,
            stalled: None,
            batch_rows: self.merge_batch_rows.get(),
            bounds: None,
            failed: false,
        })
    }
}

fn sort_batch(batch: &RecordBatch, numbers: &UInt64Array) -> Result<RecordBatch> {
    let indices = compute::sort_to_indices(numbers, None, None)?;

    let columns = batch
        .columns()
        .iter()
        .map(|column| compute::take(column.as_ref(), &indices, None))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RecordBatch::try_new(batch.schema(), columns)?)
}

/// Read position within one sorted run.
struct Cursor {
    reader: ParquetRecordBatchReader,
    schema: SchemaRef,
    batch: RecordBatch,
    numbers: UInt64Array,
    pos: usize,
    offset: u64,
}

impl Cursor {
    fn open(path: &Path, schema: SchemaRef, batch_rows: usize) -> Result<Self> {
        let reader = CacheStore::open(path, batch_rows)?;
        let batch = RecordBatch::new_empty(schema.clone());

        Ok(Self {
            reader,
            schema,
            batch,
            numbers: UInt64Array::from(Vec::<u64>::new()),
            pos: 0,
            offset: 0,
        })
    }

    /// Load the next non-empty batch. Returns `false` once the run is exhausted.
    fn advance(&mut self) -> Result<bool> {
        self.offset += self.batch.num_rows() as u64;

        for batch in self.reader.by_ref() {
            let batch = batch?;

            if batch.num_rows() == 0 {
                continue;
            }

            self.numbers = columns::block_numbers(&batch, self.offset)?;
            self.batch = columns::conform(&batch, &self.schema)?;
            self.pos = 0;

            return Ok(true);
        }

        Ok(false)
    }

    #[inline]
    fn key(&self) -> u64 {
        self.numbers.value(self.pos)
    }

    #[inline]
    fn is_drained(&self) -> bool {
        self.pos == self.batch.num_rows()
    }
}

/// Globally ordered batches produced by a k-way merge of sorted runs.
pub struct MergedRuns {
    schema: SchemaRef,
    cursors: Vec<Cursor>,
    /// Smallest pending key of each live run, ties broken by run index.
    heap: BinaryHeap<Reverse<(u64, usize)>>,
    /// Run whose batch is drained but still referenced by rows not yet emitted.
    stalled: Option<usize>,
    batch_rows: usize,
    bounds: Option<Bounds>,
    failed: bool,
}

impl MergedRuns {
    /// Bounds of the rows emitted so far.
    #[inline]
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        if let Some(idx) = self.stalled.take() {
            let cursor = &mut self.cursors[idx];

            if cursor.advance()? {
                self.heap.push(Reverse((cursor.key(), idx)));
            }
        }

        let mut picks = Vec::with_capacity(self.batch_rows);

        while picks.len() < self.batch_rows {
            let Some(Reverse((_, idx))) = self.heap.pop() else {
                break;
            };

            let cursor = &mut self.cursors[idx];
            picks.push((idx, cursor.pos));
            cursor.pos += 1;

            if cursor.is_drained() {
                // refilling would drop rows still referenced by `picks`
                self.stalled = Some(idx);
                break;
            }

            self.heap.push(Reverse((cursor.key(), idx)));
        }

        if picks.is_empty() {
            return Ok(None);
        }

        self.emit(&picks).map(Some)
    }

    fn emit(&mut self, picks: &[(usize, usize)]) -> Result<RecordBatch> {
        let columns = (0..self.schema.fields().len())
            .map(|i| {
                let arrays = self.cursors.iter().map(|cursor| cursor.batch.column(i).as_ref()).collect::<Vec<&dyn Array>>();
                compute::interleave(&arrays, picks)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let batch = RecordBatch::try_new(self.schema.clone(), columns)?;

        let first = picks[0];
        let last = picks[picks.len() - 1];
        let min = self.cursors[first.0].numbers.value(first.1);
        let max = self.cursors[last.0].numbers.value(last.1);
        self.bounds = Bounds::extend(self.bounds, min, max, picks.len() as u64);

        Ok(batch)
    }
}

impl Iterator for MergedRuns {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        match self.next_batch() {
            Ok(batch) => batch.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl std::fmt::Debug for MergedRuns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedRuns")
            .field("runs", &self.cursors.len())
            .field("live", &self.heap.len())
            .field("bounds", &self.bounds)
            .finish()
    }
}
