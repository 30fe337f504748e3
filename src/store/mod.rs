// Ordered key-value store holding a tar index
//
// A store directory contains a single SQLite database (`index.db`) with one
// table mapping normalized entry path to its JSON IndexRecord. Keys compare
// bytewise, so range scans over `[prefix/, prefix0)` return a directory's
// descendants in order.

mod record;

pub use record::{IndexRecord, RecordHeader};

use crate::index::{IndexError, IndexResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Database file name inside a store directory
pub const DB_FILE: &str = "index.db";

#[derive(Clone, Debug)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    /// Create (or reopen for writing) the store in `dir`, creating the directory if needed
    pub async fn create(dir: impl AsRef<Path>) -> IndexResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let options = SqliteConnectOptions::new()
            .filename(db_path(dir))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;

        tracing::info!("Index store created at {}", dir.display());
        Ok(store)
    }

    /// Open an existing store read-only
    pub async fn open(dir: impl AsRef<Path>) -> IndexResult<Self> {
        let dir = dir.as_ref();
        let path = db_path(dir);
        if !tokio::fs::try_exists(&path).await? {
            return Err(IndexError::NotFound(path.display().to_string()));
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        tracing::info!("Index store opened at {}", dir.display());
        Ok(Self { pool })
    }

    /// Private store living in memory for the lifetime of this handle
    pub async fn in_memory() -> IndexResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // One connection that never idles out: each connection gets its own memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> IndexResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::debug!("Index store migrations completed");
        Ok(())
    }

    /// Insert or replace one record in its own transaction
    pub async fn put(&self, key: &str, record: &IndexRecord) -> IndexResult<()> {
        let value = record.to_bytes()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR REPLACE INTO entries (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert `record` unless `key` already holds one; returns whether it was written
    pub async fn put_if_absent(&self, key: &str, record: &IndexRecord) -> IndexResult<bool> {
        let value = record.to_bytes()?;

        let result = sqlx::query("INSERT OR IGNORE INTO entries (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, key: &str) -> IndexResult<Option<IndexRecord>> {
        let value: Option<Vec<u8>> = sqlx::query_scalar("SELECT value FROM entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        value.map(|v| IndexRecord::from_bytes(&v)).transpose().map_err(IndexError::from)
    }

    /// Full scan in key order, decoding only the records whose key passes `filter`
    pub async fn scan<F>(&self, filter: F) -> IndexResult<Vec<(String, IndexRecord)>>
    where
        F: Fn(&str) -> bool + Send,
    {
        let mut rows = sqlx::query_as::<_, (String, Vec<u8>)>(
            "SELECT key, value FROM entries ORDER BY key",
        )
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.next().await {
            let (key, value) = row?;
            if filter(&key) {
                let record = IndexRecord::from_bytes(&value)?;
                out.push((key, record));
            }
        }
        Ok(out)
    }

    /// Records with `start <= key < end`, in key order
    pub async fn scan_range(
        &self,
        start: &str,
        end: &str,
    ) -> IndexResult<Vec<(String, IndexRecord)>> {
        let rows = sqlx::query_as::<_, (String, Vec<u8>)>(
            "SELECT key, value FROM entries WHERE key >= ? AND key < ? ORDER BY key",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, value)| -> IndexResult<(String, IndexRecord)> {
                Ok((key, IndexRecord::from_bytes(&value)?))
            })
            .collect()
    }

    pub async fn count(&self) -> IndexResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM entries").fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    /// Drop every record (used to discard a partial build)
    pub async fn clear(&self) -> IndexResult<()> {
        sqlx::query("DELETE FROM entries").execute(&self.pool).await?;
        Ok(())
    }

    /// Rewrite the database file to reclaim free pages
    pub async fn compact(&self) -> IndexResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        tracing::debug!("Index store compacted");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("Index store closed");
    }
}

fn db_path(dir: &Path) -> PathBuf {
    dir.join(DB_FILE)
}
