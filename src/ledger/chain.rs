//! Per-key hash chain over ledger items.
//!
//! Each item's [`TxRef`] commits to the previous item's reference, its key,
//! position, timestamp and payload. Rewriting, reordering or dropping any item
//! breaks every later link, which makes a key's log tamper-evident.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest as _, Sha256};

use super::{LedgerItem, LedgerKey, TxRef};
use crate::digest::Digest;

/// Compute the reference of the item at `sequence` under `key`.
pub fn link(
    prev_hash: &Digest,
    key: &LedgerKey,
    sequence: u64,
    timestamp: DateTime<Utc>,
    payload: &[u8],
) -> TxRef {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(key.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(sequence.to_be_bytes());
    hasher.update(timestamp.timestamp().to_be_bytes());
    hasher.update(timestamp.timestamp_subsec_nanos().to_be_bytes());
    hasher.update((payload.len() as u64).to_be_bytes());
    hasher.update(payload);
    TxRef(Digest::from_bytes(hasher.finalize().into()))
}

/// Build the item that follows `last` under `key`.
pub fn next_item(
    key: &LedgerKey,
    last: Option<&LedgerItem>,
    timestamp: DateTime<Utc>,
    payload: Vec<u8>,
) -> LedgerItem {
    let sequence = last.map_or(0, |item| item.sequence + 1);
    let prev_hash = last.map_or(Digest::ZERO, |item| item.tx_ref.0);
    let tx_ref = link(&prev_hash, key, sequence, timestamp, &payload);
    LedgerItem {
        sequence,
        timestamp,
        payload,
        prev_hash,
        tx_ref,
    }
}

/// What went wrong at the first broken link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFault {
    /// The item's position does not follow its predecessor.
    SequenceGap,
    /// The item does not point at its predecessor's reference.
    PrevHashMismatch,
    /// The item's contents do not hash to its reference.
    DigestMismatch,
    /// The item's timestamp does not advance past its predecessor's.
    TimestampRegression,
}

/// Result of walking a key's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChainStatus {
    Intact { entries: usize },
    Broken { position: usize, fault: ChainFault },
}

impl ChainStatus {
    pub fn is_intact(&self) -> bool {
        matches!(self, ChainStatus::Intact { .. })
    }
}

/// Walk `items` (as read from `key`) and report the first broken link.
pub fn verify(key: &LedgerKey, items: &[LedgerItem]) -> ChainStatus {
    let mut prev: Option<&LedgerItem> = None;
    for (position, item) in items.iter().enumerate() {
        let broken = |fault| ChainStatus::Broken { position, fault };

        if item.sequence != position as u64 {
            return broken(ChainFault::SequenceGap);
        }
        let expected_prev = prev.map_or(Digest::ZERO, |p| p.tx_ref.0);
        if item.prev_hash != expected_prev {
            return broken(ChainFault::PrevHashMismatch);
        }
        if let Some(p) = prev {
            if item.timestamp <= p.timestamp {
                return broken(ChainFault::TimestampRegression);
            }
        }
        let recomputed = link(&item.prev_hash, key, item.sequence, item.timestamp, &item.payload);
        if recomputed != item.tx_ref {
            return broken(ChainFault::DigestMismatch);
        }
        prev = Some(item);
    }
    ChainStatus::Intact {
        entries: items.len(),
    }
}
