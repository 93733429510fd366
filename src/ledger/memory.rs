//! In-memory ledger.
//!
//! Each key's log lives in a [`DashMap`] shard; an append holds that shard's
//! write lock for the whole read-link-push step, so appends to one key are
//! serialized while different keys proceed independently. Nothing awaits while
//! the lock is held, so a dropped caller future cannot leave a partial item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};

use super::{chain, next_timestamp, LedgerError, LedgerItem, LedgerKey, LedgerService};
use crate::clock::Clock;

pub struct MemoryLedger {
    logs: DashMap<LedgerKey, Vec<LedgerItem>>,
    clock: Arc<dyn Clock>,
    max_entry_bytes: usize,
    outage: AtomicBool,
}

impl MemoryLedger {
    pub fn new(clock: Arc<dyn Clock>, max_entry_bytes: usize) -> Self {
        Self {
            logs: DashMap::new(),
            clock,
            max_entry_bytes,
            outage: AtomicBool::new(false),
        }
    }

    /// Simulate a transport outage: while set, every call fails with [`LedgerError::Unavailable`].
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Number of keys with at least one item.
    pub fn key_count(&self) -> usize {
        self.logs.len()
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable(
                "in-memory ledger is in simulated outage".to_string(),
            ));
        }
        Ok(())
    }

    fn append_now(&self, key: &LedgerKey, payload: Vec<u8>) -> Result<LedgerItem, LedgerError> {
        self.check_available()?;
        if payload.is_empty() {
            return Err(LedgerError::Rejected("empty payload".to_string()));
        }
        if payload.len() > self.max_entry_bytes {
            return Err(LedgerError::Rejected(format!(
                "payload is {} bytes, limit is {}",
                payload.len(),
                self.max_entry_bytes
            )));
        }

        let mut log = self.logs.entry(*key).or_default();
        let last = log.last();
        let timestamp = next_timestamp(self.clock.now(), last.map(|item| item.timestamp));
        let item = chain::next_item(key, last, timestamp, payload);
        log.push(item.clone());
        Ok(item)
    }

    fn read_now(&self, key: &LedgerKey) -> Result<Vec<LedgerItem>, LedgerError> {
        self.check_available()?;
        Ok(self
            .logs
            .get(key)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl LedgerService for MemoryLedger {
    #[instrument(skip(self, payload), fields(key = %key.space, bytes = payload.len()))]
    async fn append(&self, key: &LedgerKey, payload: Vec<u8>) -> Result<LedgerItem, LedgerError> {
        let item = self.append_now(key, payload)?;
        debug!(sequence = item.sequence, tx = %item.tx_ref, "Appended ledger item");
        Ok(item)
    }

    #[instrument(skip(self), fields(key = %key.space))]
    async fn read_all(&self, key: &LedgerKey) -> Result<Vec<LedgerItem>, LedgerError> {
        self.read_now(key)
    }
}
