//! Durable recency store
//!
//! Append-only SQLite log of sources, batches, provider instances, their
//! terminal stats and accepted insertions, plus the cache layer's stored
//! batch. All statements go through a single-connection pool, so writes
//! never race each other; long reads are abortable via [`RecencyStore::interrupt`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A read was aborted by a superseding request.
    #[error("store query interrupted")]
    Interrupted,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Per-source aggregate report over the full stat log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub source: String,
    pub interrupted: i64,
    pub inserted: i64,
    pub avg_duration: f64,
    pub q0_duration: f64,
    pub q50_duration: f64,
    pub q95_duration: f64,
    pub q100_duration: f64,
    pub avg_items: f64,
    pub q50_items: i64,
    pub q100_items: i64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS source (
    name TEXT NOT NULL PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS batch (
    id BLOB NOT NULL PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS instance (
    id BLOB NOT NULL PRIMARY KEY,
    source TEXT NOT NULL REFERENCES source (name),
    batch_id BLOB NOT NULL REFERENCES batch (id)
);
CREATE TABLE IF NOT EXISTS instance_stat (
    instance_id BLOB NOT NULL PRIMARY KEY REFERENCES instance (id),
    interrupted INTEGER NOT NULL,
    duration REAL NOT NULL,
    items INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS insertion (
    instance_id BLOB NOT NULL REFERENCES instance (id),
    sort_by TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS insertion_sort_by ON insertion (sort_by);
CREATE TABLE IF NOT EXISTS cache_row (
    key BLOB NOT NULL,
    word TEXT NOT NULL
);
";

pub struct RecencyStore {
    pool: SqlitePool,
    reads: std::sync::Mutex<CancellationToken>,
}

impl RecencyStore {
    pub async fn connect(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        Self::with_options(options).await
    }

    pub async fn in_memory() -> StoreResult<Self> {
        Self::with_options(SqliteConnectOptions::new().in_memory(true)).await
    }

    async fn with_options(options: SqliteConnectOptions) -> StoreResult<Self> {
        // one connection: every statement is strictly serialized
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            reads: std::sync::Mutex::new(CancellationToken::new()),
        })
    }

    /// Abort in-flight read queries. Subsequent reads run normally.
    pub fn interrupt(&self) {
        let mut token = self.reads.lock().expect("poisoned");
        token.cancel();
        *token = CancellationToken::new();
    }

    fn read_token(&self) -> CancellationToken {
        self.reads.lock().expect("poisoned").clone()
    }

    pub async fn new_source(&self, name: &str) -> StoreResult<()> {
        sqlx::query("INSERT OR IGNORE INTO source (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn new_batch(&self, batch: Uuid) -> StoreResult<()> {
        sqlx::query("INSERT INTO batch (id) VALUES (?)")
            .bind(batch.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn new_instance(&self, instance: Uuid, source: &str, batch: Uuid) -> StoreResult<()> {
        sqlx::query("INSERT INTO instance (id, source, batch_id) VALUES (?, ?, ?)")
            .bind(instance.as_bytes().to_vec())
            .bind(source)
            .bind(batch.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal outcome of one instance. Written exactly once, after the
    /// provider's stream ends or is cancelled.
    pub async fn new_stat(
        &self,
        instance: Uuid,
        interrupted: bool,
        duration: Duration,
        items: usize,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO instance_stat (instance_id, interrupted, duration, items) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(instance.as_bytes().to_vec())
        .bind(interrupted)
        .bind(duration.as_secs_f64())
        .bind(items as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record that the user accepted a suggestion produced by `instance`.
    pub async fn inserted(&self, instance: Uuid, sort_by: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO insertion (instance_id, sort_by) VALUES (?, ?)")
            .bind(instance.as_bytes().to_vec())
            .bind(sort_by)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The `n_rows` most recent accepted sort keys, mapped to their
    /// recency rank (1 = most recent). Duplicate keys keep their most
    /// recent rank.
    pub async fn insertion_order(&self, n_rows: usize) -> StoreResult<HashMap<String, u32>> {
        let token = self.read_token();
        let query = sqlx::query(
            "SELECT sort_by, MIN(insert_order) AS insert_order \
             FROM (SELECT sort_by, ROW_NUMBER() OVER (ORDER BY rowid DESC) AS insert_order \
                   FROM insertion ORDER BY rowid DESC LIMIT ?) \
             GROUP BY sort_by",
        )
        .bind(n_rows as i64)
        .fetch_all(&self.pool);

        tokio::select! {
            _ = token.cancelled() => Err(StoreError::Interrupted),
            rows = query => {
                let rows = rows?;
                Ok(rows
                    .iter()
                    .map(|row| {
                        (
                            row.get::<String, _>("sort_by"),
                            row.get::<i64, _>("insert_order") as u32,
                        )
                    })
                    .collect())
            }
        }
    }

    /// Replace the cache layer's stored batch.
    pub async fn cache_replace(&self, rows: &[(Uuid, String)]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache_row").execute(&mut *tx).await?;
        for (key, word) in rows {
            sqlx::query("INSERT INTO cache_row (key, word) VALUES (?, ?)")
                .bind(key.as_bytes().to_vec())
                .bind(word)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn cache_clear(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM cache_row").execute(&self.pool).await?;
        Ok(())
    }

    /// Stored cache keys with their ordered words, most recent first.
    /// `None` lifts the row cap (manual requests).
    pub async fn cache_select(&self, limit: Option<usize>) -> StoreResult<Vec<(Uuid, String)>> {
        let token = self.read_token();
        // SQLite treats a negative LIMIT as unlimited
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let query = sqlx::query("SELECT key, word FROM cache_row ORDER BY rowid DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool);

        tokio::select! {
            _ = token.cancelled() => Err(StoreError::Interrupted),
            rows = query => {
                let rows = rows?;
                Ok(rows
                    .iter()
                    .filter_map(|row| {
                        let key = Uuid::from_slice(&row.get::<Vec<u8>, _>("key")).ok()?;
                        Some((key, row.get::<String, _>("word")))
                    })
                    .collect())
            }
        }
    }

    /// Per-source aggregate statistics, computed at query time over the
    /// full stat log.
    pub async fn stats(&self) -> StoreResult<Vec<Statistics>> {
        let stat_rows = sqlx::query(
            "SELECT i.source AS source, s.interrupted AS interrupted, \
                    s.duration AS duration, s.items AS items \
             FROM instance_stat s JOIN instance i ON i.id = s.instance_id \
             ORDER BY s.rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        let insert_rows = sqlx::query(
            "SELECT i.source AS source, COUNT(*) AS inserted \
             FROM insertion n JOIN instance i ON i.id = n.instance_id \
             GROUP BY i.source",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut durations: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut items: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        let mut interrupted: BTreeMap<String, i64> = BTreeMap::new();
        for row in &stat_rows {
            let source: String = row.get("source");
            durations
                .entry(source.clone())
                .or_default()
                .push(row.get::<f64, _>("duration"));
            items
                .entry(source.clone())
                .or_default()
                .push(row.get::<i64, _>("items"));
            *interrupted.entry(source).or_default() += row.get::<i64, _>("interrupted");
        }
        let mut inserted: BTreeMap<String, i64> = BTreeMap::new();
        for row in &insert_rows {
            inserted.insert(row.get("source"), row.get("inserted"));
        }

        let sources: BTreeSet<String> = durations
            .keys()
            .chain(inserted.keys())
            .cloned()
            .collect();
        let stats = sources
            .into_iter()
            .map(|source| {
                let mut d = durations.remove(&source).unwrap_or_default();
                d.sort_by(f64::total_cmp);
                let mut n = items.remove(&source).unwrap_or_default();
                n.sort_unstable();
                Statistics {
                    avg_duration: mean(&d),
                    q0_duration: percentile_f64(&d, 0.0),
                    q50_duration: percentile_f64(&d, 0.5),
                    q95_duration: percentile_f64(&d, 0.95),
                    q100_duration: percentile_f64(&d, 1.0),
                    avg_items: mean_i64(&n),
                    q50_items: percentile_i64(&n, 0.5),
                    q100_items: percentile_i64(&n, 1.0),
                    interrupted: interrupted.remove(&source).unwrap_or(0),
                    inserted: inserted.remove(&source).unwrap_or(0),
                    source,
                }
            })
            .collect();
        Ok(stats)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn mean_i64(values: &[i64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<i64>() as f64 / values.len() as f64
    }
}

// nearest-rank over an ascending-sorted slice
fn percentile_f64(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx]
}

fn percentile_i64(sorted: &[i64], q: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx]
}
