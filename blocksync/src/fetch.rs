//! Remote fetch client: retrieves raw columnar rows for a block-range query.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures::future::TryFutureExt;
use futures::stream::{Stream, TryStreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::{fs, io, sync::Semaphore};

pub use reqwest::Client;
pub use url::Url;

use crate::{CacheKey, RecordType};

static MAX_HTTP_REQUESTS: Semaphore = Semaphore::const_new(50);

const QUERY_PATH: &str = "query/parquet";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("remote fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Block-range query sent to the remote indexing service.
///
/// Only the columns needed to order and count records are requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Query {
    pub from_block: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogSelection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<TransactionSelection>,
    pub field_selection: FieldSelection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSelection {
    pub address: Vec<String>,
}

/// Transaction predicate. Selections are OR-ed, so one selection per role covers both sender and receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionSelection {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldSelection {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transaction: Vec<&'static str>,
}

impl Query {
    /// Build the query fetching every record of `key` from `from_block` onwards.
    pub fn new(key: &CacheKey, from_block: u64) -> Self {
        let address = key.address().to_owned();

        match key.kind() {
            RecordType::Event => Self {
                from_block,
                logs: vec![LogSelection { address: vec![address] }],
                transactions: vec![],
                field_selection: FieldSelection {
                    log: vec!["block_number", "log_index", "transaction_index"],
                    ..Default::default()
                },
            },
            RecordType::Transaction => Self {
                from_block,
                logs: vec![],
                transactions: vec![
                    TransactionSelection {
                        from: vec![address.clone()],
                        ..Default::default()
                    },
                    TransactionSelection {
                        to: vec![address],
                        ..Default::default()
                    },
                ],
                field_selection: FieldSelection {
                    transaction: vec!["block_number", "transaction_index"],
                    ..Default::default()
                },
            },
        }
    }
}

/// Remote fetch capability.
///
/// Implementors write the raw columnar result of `query` to the file at `dest` and return the number of bytes written.
/// Writing nothing at all, or an empty file, stands for a zero-row result.
pub trait FetchClient: Send + Sync {
    fn fetch(&self, base: &Url, query: &Query, dest: &Path) -> impl Future<Output = Result<u64, FetchError>> + Send;
}

/// HTTP fetch client streaming a Parquet response body to disk.
#[derive(Debug, Clone, Default)]
pub struct HttpFetchClient {
    client: Client,
    bearer_token: Option<String>,
}

impl HttpFetchClient {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    #[inline]
    pub fn with_bearer_token(self, token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            ..self
        }
    }

    fn stream(&self, url: Url, query: &Query) -> impl Stream<Item = Result<bytes::Bytes, FetchError>> {
        let mut request = self.client.post(url).json(query);

        if let Some(ref token) = self.bearer_token {
            request = request.bearer_auth(token);
        }

        request
            .send()
            .and_then(|resp| futures::future::ready(resp.error_for_status()))
            .map_ok(|resp| resp.bytes_stream())
            .try_flatten_stream()
            .err_into()
    }
}

impl FetchClient for HttpFetchClient {
    async fn fetch(&self, base: &Url, query: &Query, dest: &Path) -> Result<u64, FetchError> {
        use io::AsyncWriteExt;

        let _permit = MAX_HTTP_REQUESTS.acquire().await.map_err(io::Error::other)?;

        let url = base.join(QUERY_PATH)?;

        tracing::debug!("Fetching from block {} at `{url}`", query.from_block);

        let file = fs::File::options().write(true).create_new(true).open(dest).await?;
        let mut writer = io::BufWriter::new(file);

        let mut stream = std::pin::pin!(self.stream(url, query));
        let mut written = 0;

        while let Some(chunk) = stream.try_next().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        writer.shutdown().await?;
        writer.into_inner().sync_all().await?;

        tracing::debug!("Fetched {written} bytes to `{}`", dest.display());

        Ok(written)
    }
}
