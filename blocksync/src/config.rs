//! Request-scoped configuration values.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

const DEFAULT_CHUNK_ROWS: NonZeroUsize = match NonZeroUsize::new(1_000_000) {
    Some(n) => n,
    None => unreachable!(),
};
const DEFAULT_MERGE_BATCH_ROWS: NonZeroUsize = match NonZeroUsize::new(8_192) {
    Some(n) => n,
    None => unreachable!(),
};
const DEFAULT_CONCURRENT_SYNCS: usize = 4;
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

const DEFAULT_NETWORK: &str = "eth";
const HYPERSYNC_NETWORKS: &[(&str, &str)] = &[
    ("arbitrum", "https://arbitrum.hypersync.xyz"),
    ("base", "https://base.hypersync.xyz"),
    ("bsc", "https://bsc.hypersync.xyz"),
    ("eth", "https://eth.hypersync.xyz"),
    ("gnosis", "https://gnosis.hypersync.xyz"),
    ("goerli", "https://goerli.hypersync.xyz"),
    ("linea", "https://linea.hypersync.xyz"),
    ("optimism", "https://optimism.hypersync.xyz"),
    ("polygon", "https://polygon.hypersync.xyz"),
    ("scroll", "https://scroll.hypersync.xyz"),
    ("sepolia", "https://sepolia.hypersync.xyz"),
    ("taiko_jolnr", "https://taiko-jolnr.hypersync.xyz"),
    ("manta", "https://manta.hypersync.xyz"),
    ("polygon_zkevm", "https://polygon-zkevm.hypersync.xyz"),
    ("metis", "https://metis.hypersync.xyz"),
    ("kroma", "https://kroma.hypersync.xyz"),
    ("celo", "https://celo.hypersync.xyz"),
    ("zksync", "https://zksync.hypersync.xyz"),
    ("okbc_testnet", "https://okbc-testnet.hypersync.xyz"),
];

/// Synchronization engine settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root directory holding one sub-directory per cache key.
    cache_root: PathBuf,
    /// Rows sorted in memory at once.
    chunk_rows: NonZeroUsize,
    /// Rows per batch when merging sorted runs.
    merge_batch_rows: NonZeroUsize,
    /// Upper bound on a single remote fetch.
    fetch_timeout: Option<Duration>,
    /// Syncs running at once in [`SyncEngine::sync_many`](crate::SyncEngine::sync_many).
    concurrent_syncs: usize,
    /// Idle time after which a temporary entry left under the root is considered abandoned.
    stale_after: Duration,
}

impl SyncConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            chunk_rows: DEFAULT_CHUNK_ROWS,
            merge_batch_rows: DEFAULT_MERGE_BATCH_ROWS,
            fetch_timeout: None,
            concurrent_syncs: DEFAULT_CONCURRENT_SYNCS,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    #[inline]
    pub fn with_chunk_rows(self, chunk_rows: NonZeroUsize) -> Self {
        Self { chunk_rows, ..self }
    }

    #[inline]
    pub fn with_merge_batch_rows(self, merge_batch_rows: NonZeroUsize) -> Self {
        Self { merge_batch_rows, ..self }
    }

    #[inline]
    pub fn with_fetch_timeout(self, fetch_timeout: Duration) -> Self {
        Self {
            fetch_timeout: Some(fetch_timeout),
            ..self
        }
    }

    #[inline]
    pub fn with_concurrent_syncs(self, concurrent_syncs: usize) -> Self {
        Self {
            concurrent_syncs: concurrent_syncs.max(1),
            ..self
        }
    }

    #[inline]
    pub fn with_stale_after(self, stale_after: Duration) -> Self {
        Self { stale_after, ..self }
    }

    #[inline]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    #[inline]
    pub fn chunk_rows(&self) -> NonZeroUsize {
        self.chunk_rows
    }

    #[inline]
    pub fn merge_batch_rows(&self) -> NonZeroUsize {
        self.merge_batch_rows
    }

    #[inline]
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout
    }

    #[inline]
    pub fn concurrent_syncs(&self) -> usize {
        self.concurrent_syncs
    }

    #[inline]
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

/// Network name to remote base URL table.
///
/// Built explicitly and handed to whoever resolves request parameters; the engine itself only ever sees a [`Url`].
///
/// ```
/// # use blocksync::Networks;
/// let networks = Networks::default();
///
/// assert_eq!(networks.resolve("base").unwrap().as_str(), "https://base.hypersync.xyz/");
/// assert_eq!(networks.resolve_or_default("unknown").as_str(), "https://eth.hypersync.xyz/");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Networks {
    urls: HashMap<String, Url>,
}

impl Networks {
    /// Parse a JSON object mapping network names to base URLs.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    #[inline]
    pub fn resolve(&self, network: &str) -> Option<&Url> {
        self.urls.get(network)
    }

    /// Resolve `network`, falling back to the `eth` endpoint for unknown names.
    pub fn resolve_or_default(&self, network: &str) -> Url {
        match self.resolve(network).or_else(|| self.resolve(DEFAULT_NETWORK)) {
            Some(url) => url.clone(),
            None => Self::default().urls[DEFAULT_NETWORK].clone(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.urls.keys().map(String::as_str)
    }
}

impl Default for Networks {
    fn default() -> Self {
        let urls = HYPERSYNC_NETWORKS
            .iter()
            .filter_map(|&(name, url)| Some((name.to_owned(), Url::parse(url).ok()?)))
            .collect();

        Self { urls }
    }
}
