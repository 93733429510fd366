//! Durable ledger backed by SQLite.
//!
//! All keys share one `ledger_entries` table. The `(entry_key, sequence)`
//! primary key makes a lost update impossible: two writers racing for the same
//! position cannot both commit. UPDATE and DELETE are refused by triggers.
//!
//! Appends open with `BEGIN IMMEDIATE`, so several registry instances can
//! share one database file: a writer waits for the write lock up front
//! instead of failing to upgrade a read snapshot.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;
use tokio::sync::Mutex;
use tokio_retry::strategy::{jitter, FixedInterval};
use tokio_retry::RetryIf;
use tracing::{debug, info, instrument, warn, Instrument};

use super::{chain, next_timestamp, LedgerError, LedgerItem, LedgerKey, LedgerService};
use crate::clock::Clock;
use crate::config::LedgerConfig;

const IMMUTABLE_MESSAGE: &str = "ledger entries are append-only";

/// Extra attempts for a write that lost a lock or sequence race with another instance.
const CONTENTION_RETRIES: usize = 5;
const CONTENTION_BACKOFF_MS: u64 = 20;

pub struct SqliteLedger {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    max_entry_bytes: usize,
    // Serializes appends from this instance; other instances wait on the database write lock.
    write_lock: Arc<Mutex<()>>,
}

impl SqliteLedger {
    /// Connect to the database at `config.url`, creating it and its schema if needed.
    pub async fn connect(config: &LedgerConfig, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| LedgerError::Unavailable(format!("invalid sqlite url: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(classify)?;

        Self::init_schema(&pool).await?;
        info!(url = %config.url, "Connected to SQLite ledger");

        Ok(Self {
            pool,
            clock,
            max_entry_bytes: config.max_entry_bytes,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), LedgerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ledger_entries (
                entry_key TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp_ns INTEGER NOT NULL,
                payload BLOB NOT NULL,
                prev_hash TEXT NOT NULL,
                tx_ref TEXT NOT NULL,
                PRIMARY KEY (entry_key, sequence)
            )",
        )
        .execute(pool)
        .await
        .map_err(classify)?;

        for (name, event) in [
            ("ledger_entries_no_update", "UPDATE"),
            ("ledger_entries_no_delete", "DELETE"),
        ] {
            sqlx::query(&format!(
                "CREATE TRIGGER IF NOT EXISTS {name} BEFORE {event} ON ledger_entries
                 BEGIN SELECT RAISE(ABORT, '{IMMUTABLE_MESSAGE}'); END"
            ))
            .execute(pool)
            .await
            .map_err(classify)?;
        }

        Ok(())
    }
}

#[async_trait]
impl LedgerService for SqliteLedger {
    #[instrument(skip(self, payload), fields(key = %key.space, bytes = payload.len()))]
    async fn append(&self, key: &LedgerKey, payload: Vec<u8>) -> Result<LedgerItem, LedgerError> {
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

        let lock = Arc::clone(&self.write_lock);
        let writer = Writer {
            pool: self.pool.clone(),
            clock: Arc::clone(&self.clock),
            key: *key,
            payload,
        };
        // The write finishes on its own task, so a cancelled caller never strands an open transaction.
        let item = tokio::spawn(
            async move {
                let _guard = lock.lock_owned().await;
                writer.run().await
            }
            .in_current_span(),
        )
        .await
        .map_err(|e| LedgerError::Unavailable(format!("ledger write task failed: {}", e)))??;

        debug!(sequence = item.sequence, tx = %item.tx_ref, "Persisted ledger item");
        Ok(item)
    }

    #[instrument(skip(self), fields(key = %key.space))]
    async fn read_all(&self, key: &LedgerKey) -> Result<Vec<LedgerItem>, LedgerError> {
        let rows = sqlx::query(
            "SELECT sequence, timestamp_ns, payload, prev_hash, tx_ref
             FROM ledger_entries WHERE entry_key = ?
             ORDER BY sequence ASC",
        )
        .bind(key.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter().map(decode_row).collect()
    }
}

/// One append, owned so it can run detached from the caller.
struct Writer {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    key: LedgerKey,
    payload: Vec<u8>,
}

impl Writer {
    async fn run(&self) -> Result<LedgerItem, WriteError> {
        let strategy = FixedInterval::from_millis(CONTENTION_BACKOFF_MS)
            .map(jitter)
            .take(CONTENTION_RETRIES);

        RetryIf::spawn(
            strategy,
            || self.attempt(),
            |err: &WriteError| {
                let contended = err.is_contention();
                if contended {
                    warn!(key = %self.key.space, error = %err, "Ledger write contended, retrying");
                }
                contended
            },
        )
        .await
    }

    async fn attempt(&self) -> Result<LedgerItem, WriteError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match self.insert_next(&mut conn).await {
            Ok(item) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => Ok(item),
                Err(err) => {
                    rollback(&mut conn).await;
                    Err(err.into())
                }
            },
            Err(err) => {
                rollback(&mut conn).await;
                Err(err)
            }
        }
    }

    async fn insert_next(&self, conn: &mut SqliteConnection) -> Result<LedgerItem, WriteError> {
        let entry_key = self.key.to_string();

        let last = sqlx::query(
            "SELECT sequence, timestamp_ns, payload, prev_hash, tx_ref
             FROM ledger_entries WHERE entry_key = ?
             ORDER BY sequence DESC LIMIT 1",
        )
        .bind(&entry_key)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| decode_row(&row))
        .transpose()?;

        let timestamp = next_timestamp(self.clock.now(), last.as_ref().map(|item| item.timestamp));
        let item = chain::next_item(&self.key, last.as_ref(), timestamp, self.payload.clone());

        let timestamp_ns = item
            .timestamp
            .timestamp_nanos_opt()
            .ok_or_else(|| LedgerError::Rejected("timestamp out of range".to_string()))?;
        let sequence = i64::try_from(item.sequence)
            .map_err(|_| LedgerError::Rejected("ledger key is full".to_string()))?;

        sqlx::query(
            "INSERT INTO ledger_entries (entry_key, sequence, timestamp_ns, payload, prev_hash, tx_ref)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry_key)
        .bind(sequence)
        .bind(timestamp_ns)
        .bind(&item.payload)
        .bind(item.prev_hash.to_hex())
        .bind(item.tx_ref.to_string())
        .execute(&mut *conn)
        .await?;

        Ok(item)
    }
}

async fn rollback(conn: &mut SqliteConnection) {
    if let Err(err) = sqlx::query("ROLLBACK").execute(conn).await {
        warn!(error = %err, "Failed to roll back ledger write");
    }
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl WriteError {
    /// Busy or locked database, or a sequence already taken. Nothing was written.
    fn is_contention(&self) -> bool {
        match self {
            WriteError::Database(sqlx::Error::Database(db)) => {
                db.is_unique_violation()
                    || matches!(db.code().as_deref(), Some("5" | "6" | "261" | "517"))
            }
            _ => false,
        }
    }
}

impl From<WriteError> for LedgerError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::Database(err) => classify(err),
            WriteError::Ledger(err) => err,
        }
    }
}

fn decode_row(row: &SqliteRow) -> Result<LedgerItem, LedgerError> {
    let corrupt = |e: sqlx::Error| LedgerError::Corrupt(e.to_string());

    let sequence: i64 = row.try_get("sequence").map_err(corrupt)?;
    let timestamp_ns: i64 = row.try_get("timestamp_ns").map_err(corrupt)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(corrupt)?;
    let prev_hash: String = row.try_get("prev_hash").map_err(corrupt)?;
    let tx_ref: String = row.try_get("tx_ref").map_err(corrupt)?;

    Ok(LedgerItem {
        sequence: u64::try_from(sequence)
            .map_err(|_| LedgerError::Corrupt(format!("negative sequence {}", sequence)))?,
        timestamp: Utc.timestamp_nanos(timestamp_ns),
        payload,
        prev_hash: prev_hash
            .parse()
            .map_err(|e| LedgerError::Corrupt(format!("prev_hash: {}", e)))?,
        tx_ref: tx_ref
            .parse()
            .map_err(|e| LedgerError::Corrupt(format!("tx_ref: {}", e)))?,
    })
}

fn classify(err: sqlx::Error) -> LedgerError {
    match &err {
        sqlx::Error::Database(db) if db.message().contains(IMMUTABLE_MESSAGE) => {
            LedgerError::Rejected(db.message().to_string())
        }
        _ => LedgerError::Unavailable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SystemClock};
    use crate::config::BackendKind;
    use crate::identity;
    use crate::ledger::chain::ChainStatus;

    fn memory_config() -> LedgerConfig {
        LedgerConfig {
            backend: BackendKind::Sqlite,
            url: "sqlite::memory:".to_string(),
            ..LedgerConfig::default()
        }
    }

    fn key(template: &str) -> LedgerKey {
        LedgerKey::records(identity::derive(template).unwrap())
    }

    fn file_config(name: &str) -> (std::path::PathBuf, LedgerConfig) {
        let path = std::env::temp_dir().join(format!(
            "healthchain-{}-{}-{}.db",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let config = LedgerConfig {
            backend: BackendKind::Sqlite,
            url: format!("sqlite://{}", path.display()),
            ..LedgerConfig::default()
        };
        (path, config)
    }

    fn remove_db(path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    #[tokio::test]
    async fn appends_read_back_in_order_with_intact_chain() {
        let ledger = SqliteLedger::connect(&memory_config(), Arc::new(SystemClock))
            .await
            .unwrap();
        let key = key("tmpl-A");

        for payload in [b"one".as_slice(), b"two", b"three"] {
            ledger.append(&key, payload.to_vec()).await.unwrap();
        }

        let items = ledger.read_all(&key).await.unwrap();
        let payloads: Vec<&[u8]> = items.iter().map(|item| item.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"one".as_slice(), b"two", b"three"]);
        assert_eq!(chain::verify(&key, &items), ChainStatus::Intact { entries: 3 });
    }

    #[tokio::test]
    async fn unknown_key_reads_empty() {
        let ledger = SqliteLedger::connect(&memory_config(), Arc::new(SystemClock))
            .await
            .unwrap();
        assert!(ledger.read_all(&key("nobody")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stored_timestamps_round_trip_exactly() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ledger = SqliteLedger::connect(&memory_config(), Arc::new(FixedClock(t0)))
            .await
            .unwrap();
        let key = key("tmpl-A");

        let first = ledger.append(&key, b"x".to_vec()).await.unwrap();
        let second = ledger.append(&key, b"x".to_vec()).await.unwrap();
        let items = ledger.read_all(&key).await.unwrap();

        assert_eq!(items, vec![first, second]);
        assert!(items[1].timestamp > items[0].timestamp);
    }

    #[tokio::test]
    async fn rows_cannot_be_rewritten_or_removed() {
        let ledger = SqliteLedger::connect(&memory_config(), Arc::new(SystemClock))
            .await
            .unwrap();
        let key = key("tmpl-A");
        ledger.append(&key, b"original".to_vec()).await.unwrap();

        let update = sqlx::query("UPDATE ledger_entries SET payload = x'00'")
            .execute(ledger.pool())
            .await
            .unwrap_err();
        assert!(matches!(classify(update), LedgerError::Rejected(_)));

        let delete = sqlx::query("DELETE FROM ledger_entries")
            .execute(ledger.pool())
            .await
            .unwrap_err();
        assert!(matches!(classify(delete), LedgerError::Rejected(_)));

        let items = ledger.read_all(&key).await.unwrap();
        assert_eq!(items[0].payload, b"original");
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let config = LedgerConfig {
            max_entry_bytes: 8,
            ..memory_config()
        };
        let ledger = SqliteLedger::connect(&config, Arc::new(SystemClock)).await.unwrap();
        let key = key("tmpl-A");

        assert!(matches!(
            ledger.append(&key, vec![1; 9]).await,
            Err(LedgerError::Rejected(_))
        ));
        assert!(ledger.read_all(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entries_survive_reconnect() {
        let (path, config) = file_config("reconnect");
        let key = key("tmpl-A");

        {
            let ledger = SqliteLedger::connect(&config, Arc::new(SystemClock)).await.unwrap();
            ledger.append(&key, b"kept".to_vec()).await.unwrap();
            ledger.pool().close().await;
        }

        let reopened = SqliteLedger::connect(&config, Arc::new(SystemClock)).await.unwrap();
        let items = reopened.read_all(&key).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload, b"kept");
        reopened.pool().close().await;
        remove_db(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_instances_share_one_file_without_losing_appends() {
        let (path, config) = file_config("shared");
        let first = Arc::new(SqliteLedger::connect(&config, Arc::new(SystemClock)).await.unwrap());
        let second = Arc::new(SqliteLedger::connect(&config, Arc::new(SystemClock)).await.unwrap());
        let key = key("tmpl-A");

        let tasks: Vec<_> = (0..32u32)
            .map(|i| {
                let ledger = if i % 2 == 0 {
                    Arc::clone(&first)
                } else {
                    Arc::clone(&second)
                };
                tokio::spawn(async move { ledger.append(&key, i.to_be_bytes().to_vec()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let items = first.read_all(&key).await.unwrap();
        let sequences: Vec<u64> = items.iter().map(|item| item.sequence).collect();
        assert_eq!(sequences, (0..32).collect::<Vec<u64>>());
        assert!(chain::verify(&key, &items).is_intact());
        assert_eq!(second.read_all(&key).await.unwrap(), items);

        first.pool().close().await;
        second.pool().close().await;
        remove_db(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_all_kept() {
        let ledger = Arc::new(
            SqliteLedger::connect(&memory_config(), Arc::new(SystemClock))
                .await
                .unwrap(),
        );
        let key = key("tmpl-A");

        let tasks: Vec<_> = (0..16u32)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move { ledger.append(&key, i.to_be_bytes().to_vec()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let items = ledger.read_all(&key).await.unwrap();
        assert_eq!(items.len(), 16);
        assert!(chain::verify(&key, &items).is_intact());
    }
}
