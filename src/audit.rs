//! Access audit log: the `access:` key space.
//!
//! Every read of a patient's records leaves one [`AccessLogEntry`]. The log can
//! sit on its own ledger service so audit traffic never contends with record
//! appends.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::RetryConfig;
use crate::error::RegistryError;
use crate::identity::PatientIdentifier;
use crate::ledger::chain::{self, ChainStatus};
use crate::ledger::retry::read_all_with_retry;
use crate::ledger::{KeySpace, LedgerError, LedgerItem, LedgerKey, LedgerService};
use crate::models::{AccessLogEntry, ActorId};

#[derive(Debug, Serialize, Deserialize)]
struct AccessPayload {
    author: ActorId,
}

pub struct AccessAuditLog {
    ledger: Arc<dyn LedgerService>,
    retry: RetryConfig,
}

impl AccessAuditLog {
    pub fn new(ledger: Arc<dyn LedgerService>, retry: RetryConfig) -> Self {
        Self { ledger, retry }
    }

    #[instrument(skip_all, fields(patient = %id.short(), author = %author))]
    pub async fn record(
        &self,
        id: &PatientIdentifier,
        author: &ActorId,
    ) -> Result<AccessLogEntry, RegistryError> {
        let payload = AccessPayload {
            author: author.clone(),
        };
        let bytes = serde_json::to_vec(&payload).map_err(|e| RegistryError::AuditRejected {
            reason: format!("could not encode entry: {}", e),
        })?;

        let item = self
            .ledger
            .append(&LedgerKey::access(*id), bytes)
            .await
            .map_err(audit_error)?;
        debug!(sequence = item.sequence, tx = %item.tx_ref, "Access recorded");

        Ok(AccessLogEntry {
            author: payload.author,
            timestamp: item.timestamp,
            sequence: item.sequence,
            tx_ref: item.tx_ref,
        })
    }

    #[instrument(skip_all, fields(patient = %id.short()))]
    pub async fn read_all(&self, id: &PatientIdentifier) -> Result<Vec<AccessLogEntry>, RegistryError> {
        self.read_items(id)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    #[instrument(skip_all, fields(patient = %id.short()))]
    pub async fn verify(&self, id: &PatientIdentifier) -> Result<ChainStatus, RegistryError> {
        let items = self.read_items(id).await?;
        Ok(chain::verify(&LedgerKey::access(*id), &items))
    }

    async fn read_items(&self, id: &PatientIdentifier) -> Result<Vec<LedgerItem>, RegistryError> {
        read_all_with_retry(self.ledger.as_ref(), &LedgerKey::access(*id), &self.retry)
            .await
            .map_err(audit_error)
    }
}

fn decode(item: LedgerItem) -> Result<AccessLogEntry, RegistryError> {
    let payload: AccessPayload =
        serde_json::from_slice(&item.payload).map_err(|e| RegistryError::MalformedEntry {
            space: KeySpace::Access,
            reason: format!("entry #{}: {}", item.sequence, e),
        })?;
    Ok(AccessLogEntry {
        author: payload.author,
        timestamp: item.timestamp,
        sequence: item.sequence,
        tx_ref: item.tx_ref,
    })
}

fn audit_error(err: LedgerError) -> RegistryError {
    match err {
        LedgerError::Unavailable(reason) => RegistryError::AuditUnavailable { reason },
        LedgerError::Rejected(reason) => RegistryError::AuditRejected { reason },
        LedgerError::Corrupt(reason) => RegistryError::MalformedEntry {
            space: KeySpace::Access,
            reason,
        },
    }
}
