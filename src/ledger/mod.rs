//! The shared ledger the registry appends to.
//!
//! The ledger is an external, linearizable key-append service. The registry
//! only relies on three properties of it:
//! - an append either lands with an acknowledged [`TxRef`] or fails, never half-applied
//! - appends under one key are totally ordered and none is lost
//! - a read returns a prefix of that order, never shrinking between reads
//!
//! [`LedgerService`] captures that contract. [`memory::MemoryLedger`] and
//! (with the `sqlite` feature) [`sqlite::SqliteLedger`] implement it.

pub mod chain;
pub mod memory;
pub mod retry;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::config::{BackendKind, LedgerConfig};
use crate::digest::{Digest, ParseDigestError};
use crate::identity::PatientIdentifier;

/// Logically separate key spaces on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySpace {
    Records,
    Access,
}

impl KeySpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySpace::Records => "records",
            KeySpace::Access => "access",
        }
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger key: `<space>:<patient identifier>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub space: KeySpace,
    pub patient: PatientIdentifier,
}

impl LedgerKey {
    pub fn records(patient: PatientIdentifier) -> Self {
        Self {
            space: KeySpace::Records,
            patient,
        }
    }

    pub fn access(patient: PatientIdentifier) -> Self {
        Self {
            space: KeySpace::Access,
            patient,
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.patient)
    }
}

/// Acknowledgement reference of an appended item: the item's link in its key's hash chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxRef(pub Digest);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Debug for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxRef({})", self)
    }
}

impl FromStr for TxRef {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(TxRef)
    }
}

impl Serialize for TxRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// An item as stored under a ledger key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerItem {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub prev_hash: Digest,
    pub tx_ref: TxRef,
}

/// Failures reported by a ledger backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Transport or infrastructure failure. Nothing was written.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// The service refused the write. Retrying unchanged will fail again.
    #[error("ledger rejected write: {0}")]
    Rejected(String),
    /// Stored data could not be decoded.
    #[error("ledger data corrupt: {0}")]
    Corrupt(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Append-only, totally-ordered-per-key ledger.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Append `payload` under `key`, returning the stored item once acknowledged.
    async fn append(&self, key: &LedgerKey, payload: Vec<u8>) -> Result<LedgerItem, LedgerError>;

    /// Every item under `key`, in append order. Unknown keys yield an empty list.
    async fn read_all(&self, key: &LedgerKey) -> Result<Vec<LedgerItem>, LedgerError>;
}

/// Open the backend described by `config`.
pub async fn open(
    config: &LedgerConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn LedgerService>, LedgerError> {
    match config.backend {
        BackendKind::Memory => {
            info!("Using in-memory ledger");
            Ok(Arc::new(memory::MemoryLedger::new(
                clock,
                config.max_entry_bytes,
            )))
        }
        #[cfg(feature = "sqlite")]
        BackendKind::Sqlite => {
            let ledger = sqlite::SqliteLedger::connect(config, clock).await?;
            Ok(Arc::new(ledger))
        }
        #[cfg(not(feature = "sqlite"))]
        BackendKind::Sqlite => Err(LedgerError::Unavailable(
            "sqlite backend not compiled in; rebuild with the `sqlite` feature".to_string(),
        )),
    }
}

/// Next timestamp for a key whose last item was stamped `last`.
///
/// Ledger timestamps strictly increase per key even if the wall clock stalls or steps back.
pub(crate) fn next_timestamp(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match last {
        Some(last) if now <= last => last + chrono::Duration::nanoseconds(1),
        _ => now,
    }
}
