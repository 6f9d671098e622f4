use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Kind of records cached for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// Logs emitted by a contract address.
    Event,
    /// Transactions sent from or received by an address.
    Transaction,
}

impl RecordType {
    /// Name of the cache file holding this record type.
    #[inline]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Event => "log.parquet",
            Self::Transaction => "transaction.parquet",
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "events",
            Self::Transaction => "transactions",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" | "events" | "log" | "logs" => Ok(Self::Event),
            "transaction" | "transactions" | "tx" | "txs" => Ok(Self::Transaction),
            other => Err(Error::InvalidKey(format!("unknown record type `{other}`"))),
        }
    }
}

/// Identifies one cache file: `(network, record type, address)`.
///
/// Both the network and the address end up in a directory name, so they are restricted to ASCII alphanumerics, `_` and `-`.
/// The address is lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    network: String,
    kind: RecordType,
    address: String,
}

impl CacheKey {
    pub fn new(network: impl AsRef<str>, kind: RecordType, address: impl AsRef<str>) -> Result<Self, Error> {
        let network = validate("network", network.as_ref().trim())?.to_owned();
        let address = validate("address", address.as_ref().trim())?.to_ascii_lowercase();

        Ok(Self { network, kind, address })
    }

    #[inline]
    pub fn network(&self) -> &str {
        &self.network
    }

    #[inline]
    pub fn kind(&self) -> RecordType {
        self.kind
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Directory name of this key in the cache root.
    pub(crate) fn dir_name(&self) -> String {
        format!("{}_{}_{}", self.network, self.address, self.kind)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.network, self.kind, self.address)
    }
}

fn validate<'a>(what: &str, value: &'a str) -> Result<&'a str, Error> {
    if value.is_empty() {
        return Err(Error::InvalidKey(format!("empty {what}")));
    }

    if !value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        return Err(Error::InvalidKey(format!("{what} `{value}` contains unsupported characters")));
    }

    Ok(value)
}
