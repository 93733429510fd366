use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::RecordPointer;
use crate::ledger::TxRef;
use crate::models::ActorId;

/// One upload event in a patient's record log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub pointer: RecordPointer,
    pub author: ActorId,
    pub timestamp: DateTime<Utc>,
    /// Zero-based position in the patient's log.
    pub sequence: u64,
    pub tx_ref: TxRef,
}

/// One read of a patient's record list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub author: ActorId,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub tx_ref: TxRef,
}
