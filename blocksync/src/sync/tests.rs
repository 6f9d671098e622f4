use std::collections::VecDeque;
use std::io;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::*;
use crate::store::testing::*;
use crate::RecordType;

const ADDRESS: &str = "0xDAC17F958D2ee523a2206206994597C13D831ec7";

#[derive(Debug)]
enum Response {
    Rows(SchemaRef, Vec<u64>),
    /// Rows written once the gate is opened.
    Gated(Arc<Notify>, SchemaRef, Vec<u64>),
    Nothing,
    Garbage,
    Fail,
    Hang,
}

/// Fetch client replaying scripted responses and recording queries.
#[derive(Debug, Default, Clone)]
struct MockClient {
    responses: Arc<Mutex<VecDeque<Response>>>,
    queries: Arc<Mutex<Vec<Query>>>,
}

impl MockClient {
    fn with(responses: impl IntoIterator<Item = Response>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            ..Default::default()
        }
    }

    fn from_blocks(&self) -> Vec<u64> {
        self.queries.lock().unwrap().iter().map(|query| query.from_block).collect()
    }
}

impl FetchClient for MockClient {
    async fn fetch(&self, _base: &Url, query: &Query, dest: &Path) -> Result<u64, FetchError> {
        self.queries.lock().unwrap().push(query.clone());

        let response = self.responses.lock().unwrap().pop_front().unwrap_or(Response::Nothing);

        match response {
            Response::Rows(schema, blocks) => {
                write_file(dest, &schema, &[blocks.as_slice()]);
                Ok(std::fs::metadata(dest)?.len())
            }
            Response::Gated(gate, schema, blocks) => {
                gate.notified().await;
                write_file(dest, &schema, &[blocks.as_slice()]);
                Ok(std::fs::metadata(dest)?.len())
            }
            Response::Nothing => Ok(0),
            Response::Garbage => {
                std::fs::write(dest, b"PAR1\x15\x04")?;
                Ok(6)
            }
            Response::Fail => Err(FetchError::Io(io::ErrorKind::ConnectionReset.into())),
            Response::Hang => std::future::pending().await,
        }
    }
}

fn remote() -> Url {
    Url::parse("http://remote.invalid/").unwrap()
}

fn event_key() -> CacheKey {
    CacheKey::new("eth", RecordType::Event, ADDRESS).unwrap()
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig::new(root)
        .with_chunk_rows(NonZeroUsize::new(64).unwrap())
        .with_merge_batch_rows(NonZeroUsize::new(16).unwrap())
}

fn engine(root: &Path, client: MockClient) -> SyncEngine<MockClient> {
    SyncEngine::with_client(config(root), client)
}

/// Temporary entries (fetch directories, partial writes) left under the cache root.
fn leftovers(root: &Path) -> Vec<PathBuf> {
    let mut found = vec![];

    for entry in std::fs::read_dir(root).unwrap() {
        let path = entry.unwrap().path();

        if path.file_name().unwrap().to_string_lossy().starts_with('.') {
            found.push(path.clone());
        }

        if path.is_dir() {
            found.extend(
                std::fs::read_dir(&path)
                    .unwrap()
                    .map(|entry| entry.unwrap().path())
                    .filter(|path| path.file_name().unwrap().to_string_lossy().starts_with('.')),
            );
        }
    }

    found
}

fn seed_cache(engine: &SyncEngine<MockClient>, key: &CacheKey, schema: &SchemaRef, blocks: &[u64]) -> PathBuf {
    let path = engine.store().cache_path(key);
    write_file(&path, schema, &[blocks]);
    path
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_first_sync() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema(&["log_index"]);
    let client = MockClient::with([Response::Rows(schema, vec![9, 3, 5, 3])]);
    let engine = engine(dir.path(), client.clone());

    let report = engine.sync(&event_key(), &remote()).await.unwrap();

    assert!(matches!(report.freshness, Freshness::Updated));
    assert!(!report.was_cached);
    assert_eq!(report.resume_block, 0);
    assert_eq!(report.total_records, 4);
    assert_eq!(report.fetched_records, 4);
    assert_eq!(report.total_blocks, 7);
    assert_eq!(report.cache_path, engine.store().cache_path(&event_key()));
    assert!(report.elapsed_secs() >= 0.0);

    assert_eq!(read_blocks(&report.cache_path), vec![3, 3, 5, 9]);
    assert_eq!(client.from_blocks(), vec![0]);
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_resume_extends_cache() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema(&["log_index"]);

    // fetched rows come back out of order
    let mut new_blocks = (1_001..=1_500).rev().collect::<Vec<u64>>();
    new_blocks.rotate_left(123);

    let client = MockClient::with([Response::Rows(schema.clone(), new_blocks)]);
    let engine = engine(dir.path(), client.clone());
    let old_blocks = (0..=1_000).collect::<Vec<u64>>();
    let path = seed_cache(&engine, &event_key(), &schema, &old_blocks);

    let report = engine.sync(&event_key(), &remote()).await.unwrap();

    assert!(matches!(report.freshness, Freshness::Updated));
    assert!(report.was_cached);
    assert_eq!(report.resume_block, 1_001);
    assert_eq!(client.from_blocks(), vec![1_001]);
    assert_eq!(report.total_records, 1_001 + 500);
    assert_eq!(report.fetched_records, 500);
    assert_eq!(report.total_blocks, 1_501);

    assert_eq!(read_blocks(&path), (0..=1_500).collect::<Vec<u64>>());
    assert_eq!(CacheStore::read_schema(&path).unwrap().fields(), schema.fields());
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_sync_without_new_rows_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema(&[]);
    let client = MockClient::with([Response::Nothing, Response::Rows(schema.clone(), vec![])]);
    let engine = engine(dir.path(), client.clone());
    let path = seed_cache(&engine, &event_key(), &schema, &[4, 7, 7, 12]);
    let before = std::fs::read(&path).unwrap();

    for _ in 0..2 {
        let report = engine.sync(&event_key(), &remote()).await.unwrap();

        assert!(matches!(report.freshness, Freshness::UpToDate));
        assert!(report.was_cached);
        assert_eq!(report.resume_block, 13);
        assert_eq!(report.total_records, 4);
        assert_eq!(report.total_blocks, 9);
        assert_eq!(report.fetched_records, 0);
    }

    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(client.from_blocks(), vec![13, 13]);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_schema_mismatch_keeps_cache() {
    let dir = tempfile::tempdir().unwrap();
    let client = MockClient::with([Response::Rows(schema(&["log_index", "transaction_index"]), vec![20, 21])]);
    let engine = engine(dir.path(), client);
    let path = seed_cache(&engine, &event_key(), &schema(&["log_index"]), &[1, 2, 3]);
    let before = std::fs::read(&path).unwrap();

    let report = engine.sync(&event_key(), &remote()).await.unwrap();

    assert!(report.is_degraded());
    assert!(matches!(report.freshness, Freshness::Degraded(Error::SchemaMismatch { .. })));
    assert_eq!(report.total_records, 3);
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert!(leftovers(dir.path()).is_empty());
    assert!(logs_contain("Serving stale cache"));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_remote_failure_serves_cache() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), MockClient::with([Response::Fail]));
    let blocks = (100..142).collect::<Vec<u64>>();
    let path = seed_cache(&engine, &event_key(), &schema(&[]), &blocks);
    let before = std::fs::read(&path).unwrap();

    let report = engine.sync(&event_key(), &remote()).await.unwrap();

    assert!(matches!(report.freshness, Freshness::Degraded(Error::RemoteFetch(FetchError::Io(_)))));
    assert_eq!(report.total_records, 42);
    assert_eq!(report.total_blocks, 42);
    assert_eq!(report.resume_block, 142);
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_truncated_fetch_serves_cache() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), MockClient::with([Response::Garbage]));
    let path = seed_cache(&engine, &event_key(), &schema(&[]), &[1, 2]);
    let before = std::fs::read(&path).unwrap();

    let report = engine.sync(&event_key(), &remote()).await.unwrap();

    assert!(report.is_degraded());
    assert_eq!(report.total_records, 2);
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_malformed_fetch_serves_cache() {
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    struct Malformed;

    impl FetchClient for Malformed {
        async fn fetch(&self, _base: &Url, _query: &Query, dest: &Path) -> Result<u64, FetchError> {
            let schema = Arc::new(Schema::new(vec![Field::new(crate::BLOCK_NUMBER, DataType::Int64, true)]));
            let column = Arc::new(Int64Array::from(vec![Some(50), None]));
            let batch = arrow::record_batch::RecordBatch::try_new(schema.clone(), vec![column]).unwrap();
            CacheStore::write_atomic(dest, schema, [Ok(batch)]).unwrap();

            Ok(std::fs::metadata(dest)?.len())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let engine = SyncEngine::with_client(config(dir.path()), Malformed);
    let path = engine.store().cache_path(&event_key());
    write_file(&path, &schema(&[]), &[&[10, 20]]);
    let before = std::fs::read(&path).unwrap();

    let report = engine.sync(&event_key(), &remote()).await.unwrap();

    assert!(matches!(report.freshness, Freshness::Degraded(Error::MalformedRecord { row: 1, .. })));
    assert_eq!(report.total_records, 2);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn test_fresh_key_without_rows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), MockClient::with([Response::Nothing, Response::Rows(schema(&[]), vec![])]));

    for _ in 0..2 {
        let res = engine.sync(&event_key(), &remote()).await;

        assert!(matches!(res, Err(Error::NoData)), "{res:?}");
        assert!(!engine.store().cache_dir(&event_key()).exists());
    }

    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_fresh_key_remote_failure() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), MockClient::with([Response::Fail]));

    let res = engine.sync(&event_key(), &remote()).await;

    assert!(matches!(res, Err(Error::RemoteFetch(_))), "{res:?}");
    assert!(!CacheStore::exists(&engine.store().cache_path(&event_key())));
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_unreadable_cache_triggers_full_resync() {
    let dir = tempfile::tempdir().unwrap();
    let client = MockClient::with([Response::Rows(schema(&[]), vec![2, 1])]);
    let engine = engine(dir.path(), client.clone());
    let path = engine.store().cache_path(&event_key());

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"not a parquet file").unwrap();

    let report = engine.sync(&event_key(), &remote()).await.unwrap();

    assert!(!report.was_cached);
    assert_eq!(report.resume_block, 0);
    assert_eq!(read_blocks(&path), vec![1, 2]);
    assert!(logs_contain("Ignoring unreadable cache file"));
}

#[tokio::test]
async fn test_fetch_timeout_serves_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path()).with_fetch_timeout(Duration::from_millis(20));
    let engine = SyncEngine::with_client(config, MockClient::with([Response::Hang]));
    seed_cache(&engine, &event_key(), &schema(&[]), &[1]);

    let report = engine.sync(&event_key(), &remote()).await.unwrap();

    assert!(matches!(report.freshness, Freshness::Degraded(Error::RemoteFetch(FetchError::Timeout(_)))));
    assert_eq!(report.total_records, 1);
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_cancelled_sync_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), MockClient::with([Response::Hang, Response::Nothing]));
    let path = seed_cache(&engine, &event_key(), &schema(&[]), &[1, 2, 3]);
    let before = std::fs::read(&path).unwrap();

    let res = tokio::time::timeout(Duration::from_millis(20), engine.sync(&event_key(), &remote())).await;

    assert!(res.is_err());
    assert!(leftovers(dir.path()).is_empty());
    assert_eq!(std::fs::read(&path).unwrap(), before);

    // the key lock has been released as well
    let report = engine.sync(&event_key(), &remote()).await.unwrap();
    assert!(matches!(report.freshness, Freshness::UpToDate));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_large_fetch_is_globally_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema(&["log_index"]);

    // each 64-row window spans the full range of fetched blocks
    let new_blocks = (0..5_000u64).map(|i| 10_000 + (i * 7_919) % 3_000).collect::<Vec<_>>();
    let engine = engine(dir.path(), MockClient::with([Response::Rows(schema.clone(), new_blocks.clone())]));
    let path = seed_cache(&engine, &event_key(), &schema, &(0..10_000).step_by(10).collect::<Vec<u64>>());

    let report = engine.sync(&event_key(), &remote()).await.unwrap();

    let blocks = read_blocks(&path);
    assert!(blocks.windows(2).all(|w| w[0] <= w[1]), "cache is not globally sorted");
    assert_eq!(blocks.len() as u64, report.total_records);
    assert_eq!(report.total_records, 1_000 + 5_000);
    assert_eq!(report.total_blocks, 12_999 + 1);
}

#[tokio::test]
async fn test_concurrent_syncs_of_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let client = MockClient::with([Response::Rows(schema(&[]), (10..20).collect()), Response::Nothing]);
    let engine = engine(dir.path(), client.clone());

    let (key, url) = (event_key(), remote());
    let (first, second) = tokio::join!(engine.sync(&key, &url), engine.sync(&key, &url));

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.total_records, 10);
    assert_eq!(second.total_records, 10);
    assert!(matches!(second.freshness, Freshness::UpToDate));

    // the second sync only starts once the first one has written the cache
    assert_eq!(client.from_blocks(), vec![0, 20]);
    assert_eq!(read_blocks(&first.cache_path), (10..20).collect::<Vec<u64>>());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_new_engine_keeps_fetch_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());
    let client = MockClient::with([Response::Gated(gate.clone(), schema(&[]), vec![5, 1, 3])]);
    let first = engine(dir.path(), client.clone());
    let (key, url) = (event_key(), remote());

    let (report, ()) = tokio::join!(first.sync(&key, &url), async {
        while client.from_blocks().is_empty() {
            tokio::task::yield_now().await;
        }

        // a second engine over the same root starts while the first one is fetching
        let _second = engine(dir.path(), MockClient::default());
        gate.notify_one();
    });

    let report = report.unwrap();
    assert!(matches!(report.freshness, Freshness::Updated));
    assert_eq!(report.total_records, 3);
    assert_eq!(read_blocks(&report.cache_path), vec![1, 3, 5]);
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_sync_many() {
    let dir = tempfile::tempdir().unwrap();
    let client = MockClient::with([Response::Rows(schema(&[]), vec![3, 1]), Response::Rows(schema(&[]), vec![2])]);
    let engine = engine(dir.path(), client.clone());

    let events = event_key();
    let transactions = CacheKey::new("eth", RecordType::Transaction, ADDRESS).unwrap();

    let results = engine
        .sync_many([(events.clone(), remote()), (transactions.clone(), remote())])
        .await;

    assert_eq!(results.len(), 2);

    let total = results
        .into_iter()
        .map(|(key, res)| {
            let report = res.unwrap();
            assert_eq!(report.cache_path, engine.store().cache_path(&key));
            report.total_records
        })
        .sum::<u64>();

    assert_eq!(total, 3);
    assert!(CacheStore::exists(&engine.store().cache_path(&events)));
    assert!(CacheStore::exists(&engine.store().cache_path(&transactions)));
    assert!(engine.store().cache_path(&transactions).ends_with("transaction.parquet"));
}
