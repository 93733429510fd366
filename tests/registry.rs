use std::sync::Arc;

use chrono::{TimeZone, Utc};
use futures::future::join_all;

use healthchain::clock::{FixedClock, SystemClock};
use healthchain::config::{BackendKind, Config, LedgerConfig, RetryConfig};
use healthchain::content;
use healthchain::identity;
use healthchain::ledger::memory::MemoryLedger;
use healthchain::models::ActorId;
use healthchain::{Registry, RegistryError};

fn actor(name: &str) -> ActorId {
    ActorId::new(name).unwrap()
}

fn retry() -> RetryConfig {
    RetryConfig {
        attempts: 2,
        base_delay_ms: 0,
        max_delay_ms: 0,
    }
}

fn memory_registry() -> (Arc<MemoryLedger>, Arc<MemoryLedger>, Registry) {
    let records = Arc::new(MemoryLedger::new(Arc::new(SystemClock), 4096));
    let audit = Arc::new(MemoryLedger::new(Arc::new(SystemClock), 4096));
    let registry = Registry::new(records.clone(), audit.clone(), retry());
    (records, audit, registry)
}

#[tokio::test]
async fn upload_then_fetch_by_another_doctor() {
    let (_, _, registry) = memory_registry();

    let uploaded = registry
        .upload("tmpl-A", &[1, 2, 3], &actor("dr-smith"))
        .await
        .unwrap();
    let outcome = registry.fetch("tmpl-A", &actor("dr-jones")).await.unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0], uploaded);
    assert_eq!(outcome.records[0].pointer, content::address(&[1, 2, 3]));
    assert_eq!(outcome.records[0].author.as_str(), "dr-smith");

    let access = outcome.audit.unwrap();
    assert_eq!(access.author.as_str(), "dr-jones");
    assert_eq!(access.sequence, 0);
}

#[tokio::test]
async fn fetching_an_unseen_patient_is_empty_but_audited() {
    let (_, _, registry) = memory_registry();

    let outcome = registry.fetch("never-enrolled", &actor("dr-jones")).await.unwrap();
    assert!(outcome.records.is_empty());
    assert!(outcome.is_audited());

    let history = registry.access_history("never-enrolled").await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn duplicate_content_is_kept_as_separate_history() {
    // A frozen clock proves distinct timestamps come from the ledger, not wall-clock luck.
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
    let clock = Arc::new(FixedClock(t0));
    let registry = Registry::new(
        Arc::new(MemoryLedger::new(clock.clone(), 4096)),
        Arc::new(MemoryLedger::new(clock, 4096)),
        retry(),
    );

    let first = registry.upload("tmpl-A", b"same bytes", &actor("dr-smith")).await.unwrap();
    let second = registry.upload("tmpl-A", b"same bytes", &actor("dr-smith")).await.unwrap();

    assert_eq!(first.pointer, second.pointer);
    assert_ne!(first, second);
    assert!(second.timestamp > first.timestamp);
    assert_ne!(first.tx_ref, second.tx_ref);

    let outcome = registry.fetch("tmpl-A", &actor("dr-smith")).await.unwrap();
    assert_eq!(outcome.records, vec![first, second]);
}

#[tokio::test]
async fn sequential_uploads_read_back_in_call_order() {
    let (_, _, registry) = memory_registry();
    let blobs: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 4]).collect();

    for blob in &blobs {
        registry.upload("tmpl-A", blob, &actor("dr-smith")).await.unwrap();
    }

    let outcome = registry.fetch("tmpl-A", &actor("dr-smith")).await.unwrap();
    let pointers: Vec<_> = outcome.records.iter().map(|e| e.pointer.clone()).collect();
    let expected: Vec<_> = blobs.iter().map(|b| content::address(b)).collect();
    assert_eq!(pointers, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_by_many_doctors_are_all_kept() {
    let (_, _, registry) = memory_registry();
    let registry = Arc::new(registry);

    let uploads = (0..32u32).map(|i| {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let author = actor(&format!("dr-{}", i % 4));
            registry
                .upload("tmpl-A", &i.to_be_bytes(), &author)
                .await
        })
    });
    let uploaded: Vec<_> = join_all(uploads)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let outcome = registry.fetch("tmpl-A", &actor("dr-audit")).await.unwrap();
    assert_eq!(outcome.records.len(), 32);
    for entry in &uploaded {
        assert!(outcome.records.contains(entry));
    }
    let sequences: Vec<u64> = outcome.records.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (0..32).collect::<Vec<u64>>());
    assert!(registry.verify_integrity("tmpl-A").await.unwrap().is_intact());
}

#[tokio::test]
async fn audit_outage_returns_records_with_secondary_error() {
    let (_, audit, registry) = memory_registry();
    registry.upload("tmpl-A", b"x-ray", &actor("dr-smith")).await.unwrap();

    audit.set_outage(true);
    let outcome = registry.fetch("tmpl-A", &actor("dr-jones")).await.unwrap();
    assert_eq!(outcome.records.len(), 1);
    match outcome.audit {
        Err(err @ RegistryError::AuditUnavailable { .. }) => assert!(err.is_retryable()),
        other => panic!("expected audit outage, got {:?}", other),
    }

    audit.set_outage(false);
    assert!(registry.access_history("tmpl-A").await.unwrap().is_empty());
}

#[tokio::test]
async fn record_ledger_outage_fails_fetch_and_writes_no_audit() {
    let (records, _, registry) = memory_registry();
    records.set_outage(true);

    let err = registry.fetch("tmpl-A", &actor("dr-jones")).await.unwrap_err();
    assert!(matches!(err, RegistryError::LedgerUnavailable { .. }));
    assert!(registry.access_history("tmpl-A").await.unwrap().is_empty());

    let err = registry
        .upload("tmpl-A", b"x-ray", &actor("dr-smith"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    records.set_outage(false);
    let outcome = registry.fetch("tmpl-A", &actor("dr-jones")).await.unwrap();
    assert!(outcome.records.is_empty());
}

#[tokio::test]
async fn patients_do_not_see_each_others_records() {
    let (_, _, registry) = memory_registry();
    registry.upload("tmpl-A", b"a", &actor("dr-smith")).await.unwrap();
    registry.upload("tmpl-B", b"b", &actor("dr-smith")).await.unwrap();

    let a = registry.fetch("tmpl-A", &actor("dr-jones")).await.unwrap();
    let b = registry.fetch("tmpl-B", &actor("dr-jones")).await.unwrap();
    assert_eq!(a.records.len(), 1);
    assert_eq!(b.records.len(), 1);
    assert_ne!(a.records[0].pointer, b.records[0].pointer);
}

#[tokio::test]
async fn reads_never_shrink() {
    let (_, _, registry) = memory_registry();
    let mut seen = 0;
    for i in 0..5u8 {
        registry.upload("tmpl-A", &[i], &actor("dr-smith")).await.unwrap();
        let outcome = registry.fetch("tmpl-A", &actor("dr-jones")).await.unwrap();
        assert!(outcome.records.len() > seen);
        seen = outcome.records.len();
    }
}

#[test]
fn identifiers_are_deterministic_and_distinct() {
    assert_eq!(
        identity::derive("tmpl-A").unwrap(),
        identity::derive("tmpl-A").unwrap()
    );
    assert_ne!(
        identity::derive("tmpl-A").unwrap(),
        identity::derive("tmpl-B").unwrap()
    );
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn registry_over_sqlite_ledgers() {
    fn sqlite() -> LedgerConfig {
        LedgerConfig {
            backend: BackendKind::Sqlite,
            url: "sqlite::memory:".to_string(),
            ..LedgerConfig::default()
        }
    }
    let config = Config {
        records: sqlite(),
        audit: sqlite(),
        retry: retry(),
        ..Config::default()
    };
    let registry = Registry::from_config(&config, Arc::new(SystemClock))
        .await
        .unwrap();

    registry.upload("tmpl-A", &[1, 2, 3], &actor("dr-smith")).await.unwrap();
    let outcome = registry.fetch("tmpl-A", &actor("dr-jones")).await.unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].pointer, content::address(&[1, 2, 3]));
    assert_eq!(outcome.audit.unwrap().author.as_str(), "dr-jones");
    assert!(registry.verify_integrity("tmpl-A").await.unwrap().is_intact());
}

#[tokio::test]
async fn registry_from_memory_config() {
    let config = Config {
        records: LedgerConfig {
            backend: BackendKind::Memory,
            ..LedgerConfig::default()
        },
        audit: LedgerConfig {
            backend: BackendKind::Memory,
            ..LedgerConfig::default()
        },
        retry: retry(),
        ..Config::default()
    };
    let registry = Registry::from_config(&config, Arc::new(SystemClock))
        .await
        .unwrap();

    let entry = registry.upload("tmpl-A", b"note", &actor("dr-smith")).await.unwrap();
    assert_eq!(entry.sequence, 0);
}
