//! Bounded retries for ledger reads.
//!
//! Reads have no side effects, so a transient failure is retried with jittered
//! exponential backoff. Appends are never retried here: an append that timed
//! out may still land, and the caller decides whether a duplicate is acceptable.

use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

use super::{LedgerError, LedgerItem, LedgerKey, LedgerService};
use crate::config::RetryConfig;

/// Read every item under `key`, retrying transient failures per `policy`.
pub async fn read_all_with_retry(
    ledger: &dyn LedgerService,
    key: &LedgerKey,
    policy: &RetryConfig,
) -> Result<Vec<LedgerItem>, LedgerError> {
    // from_millis(2) doubles each step; factor scales the first delay to base_delay_ms.
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(policy.base_delay_ms / 2)
        .max_delay(Duration::from_millis(policy.max_delay_ms))
        .map(jitter)
        .take(policy.attempts.saturating_sub(1));

    RetryIf::spawn(
        strategy,
        || ledger.read_all(key),
        |err: &LedgerError| {
            let transient = err.is_transient();
            if transient {
                warn!(key = %key.space, error = %err, "Ledger read failed, retrying");
            }
            transient
        },
    )
    .await
}
