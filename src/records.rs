//! Record ledger client: the `records:` key space.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::RetryConfig;
use crate::content::RecordPointer;
use crate::error::RegistryError;
use crate::identity::PatientIdentifier;
use crate::ledger::chain::{self, ChainStatus};
use crate::ledger::retry::read_all_with_retry;
use crate::ledger::{KeySpace, LedgerError, LedgerItem, LedgerKey, LedgerService};
use crate::models::{ActorId, RecordEntry};

/// Body of a record entry as written to the ledger.
#[derive(Debug, Serialize, Deserialize)]
struct RecordPayload {
    pointer: RecordPointer,
    author: ActorId,
}

pub struct RecordLedger {
    ledger: Arc<dyn LedgerService>,
    retry: RetryConfig,
}

impl RecordLedger {
    pub fn new(ledger: Arc<dyn LedgerService>, retry: RetryConfig) -> Self {
        Self { ledger, retry }
    }

    /// Append a pointer to the patient's record log.
    #[instrument(skip_all, fields(patient = %id.short(), author = %author))]
    pub async fn append(
        &self,
        id: &PatientIdentifier,
        pointer: RecordPointer,
        author: &ActorId,
    ) -> Result<RecordEntry, RegistryError> {
        let payload = RecordPayload {
            pointer,
            author: author.clone(),
        };
        let bytes = serde_json::to_vec(&payload).map_err(|e| RegistryError::LedgerRejected {
            reason: format!("could not encode entry: {}", e),
        })?;

        let item = self
            .ledger
            .append(&LedgerKey::records(*id), bytes)
            .await
            .map_err(ledger_error)?;
        debug!(sequence = item.sequence, tx = %item.tx_ref, "Record appended");

        Ok(RecordEntry {
            pointer: payload.pointer,
            author: payload.author,
            timestamp: item.timestamp,
            sequence: item.sequence,
            tx_ref: item.tx_ref,
        })
    }

    /// The patient's full record history in append order.
    #[instrument(skip_all, fields(patient = %id.short()))]
    pub async fn read_all(&self, id: &PatientIdentifier) -> Result<Vec<RecordEntry>, RegistryError> {
        self.read_items(id)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Recompute the hash chain over the patient's record log.
    #[instrument(skip_all, fields(patient = %id.short()))]
    pub async fn verify(&self, id: &PatientIdentifier) -> Result<ChainStatus, RegistryError> {
        let items = self.read_items(id).await?;
        Ok(chain::verify(&LedgerKey::records(*id), &items))
    }

    async fn read_items(&self, id: &PatientIdentifier) -> Result<Vec<LedgerItem>, RegistryError> {
        read_all_with_retry(self.ledger.as_ref(), &LedgerKey::records(*id), &self.retry)
            .await
            .map_err(ledger_error)
    }
}

fn decode(item: LedgerItem) -> Result<RecordEntry, RegistryError> {
    let payload: RecordPayload =
        serde_json::from_slice(&item.payload).map_err(|e| RegistryError::MalformedEntry {
            space: KeySpace::Records,
            reason: format!("entry #{}: {}", item.sequence, e),
        })?;
    Ok(RecordEntry {
        pointer: payload.pointer,
        author: payload.author,
        timestamp: item.timestamp,
        sequence: item.sequence,
        tx_ref: item.tx_ref,
    })
}

fn ledger_error(err: LedgerError) -> RegistryError {
    match err {
        LedgerError::Unavailable(reason) => RegistryError::LedgerUnavailable { reason },
        LedgerError::Rejected(reason) => RegistryError::LedgerRejected { reason },
        LedgerError::Corrupt(reason) => RegistryError::MalformedEntry {
            space: KeySpace::Records,
            reason,
        },
    }
}
