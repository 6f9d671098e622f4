//! Block-interval histograms over a cache file.

use std::num::NonZeroU64;
use std::path::Path;

use crate::store::{self, columns, CacheStore};
use crate::Result;

/// Interval size used by default, in blocks.
pub const DEFAULT_INTERVAL: NonZeroU64 = match NonZeroU64::new(100_000) {
    Some(n) => n,
    None => unreachable!(),
};

const SCAN_BATCH_ROWS: usize = 64 * 1_024;

/// Record count of one block interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBin {
    pub start: u64,
    pub end: u64,
    pub count: u64,
    /// Records in this bin and every bin before it.
    pub cumulative: u64,
}

/// Count the records of a cache file per interval of `interval` blocks.
///
/// Bins are aligned on multiples of `interval`, from the one holding the smallest block number up to the one holding the
/// largest, empty bins included. The file is streamed, so this works on caches of any size.
pub fn block_histogram(path: &Path, interval: NonZeroU64) -> Result<Vec<BlockBin>> {
    let Some(bounds) = CacheStore::read_bounds(path)? else {
        return Ok(vec![]);
    };

    let interval = interval.get();
    let first = bounds.min - bounds.min % interval;
    let len = (bounds.max - first) / interval + 1;

    let mut counts = vec![0u64; len as usize];
    let mut offset = 0;

    for batch in store::open_block_numbers(path, SCAN_BATCH_ROWS)? {
        let batch = batch?;
        let numbers = columns::block_numbers(&batch, offset)?;

        for &block in numbers.values().iter() {
            // the file may have been replaced since its bounds were read
            let bin = block.checked_sub(first).and_then(|delta| counts.get_mut((delta / interval) as usize));

            if let Some(count) = bin {
                *count += 1;
            }
        }

        offset += batch.num_rows() as u64;
    }

    let mut cumulative = 0;

    let bins = counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| {
            let start = first + i as u64 * interval;
            cumulative += count;

            BlockBin {
                start,
                end: start.saturating_add(interval),
                count,
                cumulative,
            }
        })
        .collect();

    Ok(bins)
}
