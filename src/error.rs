//! Error taxonomy for the registry core.

use thiserror::Error;

use crate::ledger::KeySpace;

/// Errors surfaced by the registry facade and its clients.
///
/// Every variant tells the caller whether retrying is safe; see [`RegistryError::is_retryable`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid biometric template: {reason}")]
    InvalidTemplate { reason: &'static str },

    #[error("invalid record pointer: {reason}")]
    InvalidPointer { reason: String },

    #[error("invalid actor id: {reason}")]
    InvalidActor { reason: &'static str },

    #[error("record ledger unavailable: {reason}")]
    LedgerUnavailable { reason: String },

    #[error("record ledger rejected the write: {reason}")]
    LedgerRejected { reason: String },

    #[error("access audit log unavailable: {reason}")]
    AuditUnavailable { reason: String },

    #[error("access audit log rejected the write: {reason}")]
    AuditRejected { reason: String },

    #[error("malformed {space} entry: {reason}")]
    MalformedEntry { space: KeySpace, reason: String },
}

impl RegistryError {
    /// Whether the failed operation may be retried unchanged.
    ///
    /// Transient ledger and audit outages are safe to retry. Input errors and
    /// permanent refusals must be corrected first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::LedgerUnavailable { .. } | RegistryError::AuditUnavailable { .. }
        )
    }
}
