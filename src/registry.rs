//! Registry facade.
//!
//! The operations the dashboard calls. Each derives the patient identifier
//! once, then talks to the record ledger and the access audit log.
//!
//! A fetch whose read succeeded is never failed by the audit append that
//! follows it. The audit error travels back in [`FetchOutcome::audit`] and is
//! logged at WARN.

use std::sync::Arc;

use serde::Serialize;
use tracing::{field, info, instrument, warn, Span};

use crate::audit::AccessAuditLog;
use crate::clock::Clock;
use crate::config::{Config, RetryConfig};
use crate::content::{self, RecordPointer};
use crate::error::RegistryError;
use crate::identity::{self, PatientIdentifier};
use crate::ledger::chain::ChainStatus;
use crate::ledger::{self, LedgerError, LedgerService};
use crate::models::{AccessLogEntry, ActorId, RecordEntry};
use crate::records::RecordLedger;

/// Result of a successful record read.
#[derive(Debug)]
pub struct FetchOutcome {
    pub records: Vec<RecordEntry>,
    /// The access entry this read produced, or why it could not be written.
    pub audit: Result<AccessLogEntry, RegistryError>,
}

impl FetchOutcome {
    pub fn is_audited(&self) -> bool {
        self.audit.is_ok()
    }
}

/// Hash-chain status of both of a patient's logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub records: ChainStatus,
    pub access: ChainStatus,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.records.is_intact() && self.access.is_intact()
    }
}

pub struct Registry {
    records: RecordLedger,
    audit: AccessAuditLog,
}

impl Registry {
    /// Build a registry over a record ledger and an audit ledger, which may be the same service.
    pub fn new(
        records: Arc<dyn LedgerService>,
        audit: Arc<dyn LedgerService>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            records: RecordLedger::new(records, retry.clone()),
            audit: AccessAuditLog::new(audit, retry),
        }
    }

    /// Open the ledgers named in `config`.
    pub async fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let records = ledger::open(&config.records, clock.clone()).await?;
        let audit = ledger::open(&config.audit, clock).await?;
        Ok(Self::new(records, audit, config.retry.clone()))
    }

    /// Content-address `blob` and append it to the patient's record log.
    ///
    /// Uploading identical bytes again appends a second entry with the same pointer.
    #[instrument(skip_all, fields(author = %author, patient = field::Empty, bytes = blob.len()))]
    pub async fn upload(
        &self,
        template: &str,
        blob: &[u8],
        author: &ActorId,
    ) -> Result<RecordEntry, RegistryError> {
        let id = self.patient(template)?;
        let pointer = content::address(blob);
        let entry = self.records.append(&id, pointer, author).await?;
        info!(sequence = entry.sequence, tx = %entry.tx_ref, "Record uploaded");
        Ok(entry)
    }

    /// Append a pointer produced elsewhere, such as an IPFS CID.
    #[instrument(skip_all, fields(author = %author, patient = field::Empty))]
    pub async fn upload_pointer(
        &self,
        template: &str,
        pointer: &str,
        author: &ActorId,
    ) -> Result<RecordEntry, RegistryError> {
        let id = self.patient(template)?;
        let pointer = RecordPointer::parse(pointer)?;
        let entry = self.records.append(&id, pointer, author).await?;
        info!(sequence = entry.sequence, tx = %entry.tx_ref, "Record pointer uploaded");
        Ok(entry)
    }

    /// Read the patient's records, then record the access.
    #[instrument(skip_all, fields(author = %author, patient = field::Empty))]
    pub async fn fetch(&self, template: &str, author: &ActorId) -> Result<FetchOutcome, RegistryError> {
        let id = self.patient(template)?;
        let records = self.records.read_all(&id).await?;

        let audit = self.audit.record(&id, author).await;
        match &audit {
            Ok(entry) => info!(
                records = records.len(),
                access_tx = %entry.tx_ref,
                "Records fetched"
            ),
            Err(err) => warn!(
                records = records.len(),
                error = %err,
                retryable = err.is_retryable(),
                "Records fetched but access was NOT audited"
            ),
        }

        Ok(FetchOutcome { records, audit })
    }

    /// Every recorded read of the patient's records. Reading the audit trail is not itself audited.
    #[instrument(skip_all, fields(patient = field::Empty))]
    pub async fn access_history(&self, template: &str) -> Result<Vec<AccessLogEntry>, RegistryError> {
        let id = self.patient(template)?;
        self.audit.read_all(&id).await
    }

    /// Walk the hash chains of both of the patient's logs.
    #[instrument(skip_all, fields(patient = field::Empty))]
    pub async fn verify_integrity(&self, template: &str) -> Result<IntegrityReport, RegistryError> {
        let id = self.patient(template)?;
        let report = IntegrityReport {
            records: self.records.verify(&id).await?,
            access: self.audit.verify(&id).await?,
        };
        if !report.is_intact() {
            warn!(?report, "Ledger hash chain is broken");
        }
        Ok(report)
    }

    fn patient(&self, template: &str) -> Result<PatientIdentifier, RegistryError> {
        let id = identity::derive(template)?;
        Span::current().record("patient", field::display(id.short()));
        Ok(id)
    }
}
