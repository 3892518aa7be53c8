//! SQLite storage engine
//!
//! One table per queue, primary key = record key, index on timestamp.
//! Suited for devices that cannot run a Redis service; the file is owned
//! by the agent, so failing to open it at startup is fatal.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::utils::current_timestamp;

use super::{KeyedRecord, Queue, StorageEngine};

/// Database busy timeout. Nothing else is expected to hold the file, so a
/// short wait is enough to ride out filesystem hiccups.
const BUSY_TIMEOUT_SECONDS: u64 = 5;

pub struct SqliteEngine {
    db_path: PathBuf,
    conn: Connection,
}

impl SqliteEngine {
    /// Opens (or creates) the database file and materializes all queue
    /// tables. Idempotent across restarts.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECONDS))
            .context("Failed to set database busy timeout")?;

        let engine = Self { db_path, conn };
        engine.create_tables()?;
        Ok(engine)
    }

    fn create_tables(&self) -> Result<()> {
        for queue in Queue::ALL {
            let table = queue.table_name();
            self.conn
                .execute(
                    &format!(
                        r#"
                        CREATE TABLE IF NOT EXISTS {} (
                            key TEXT PRIMARY KEY,
                            timestamp REAL NOT NULL,
                            payload TEXT NOT NULL
                        )
                        "#,
                        table
                    ),
                    [],
                )
                .with_context(|| format!("Failed to create table {}", table))?;

            self.conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{}_timestamp ON {}(timestamp)",
                    table, table
                ),
                [],
            )?;
        }
        tracing::info!(
            "SQLite storage initialized at {}",
            self.db_path.display()
        );
        Ok(())
    }
}

impl StorageEngine for SqliteEngine {
    fn store_records(&mut self, queue: Queue, records: &[KeyedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (key, timestamp, payload) VALUES (?1, ?2, ?3)",
                queue.table_name()
            ))?;
            for record in records {
                stmt.execute(params![record.key, record.timestamp, record.payload])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn collect_keys(&mut self, queue: Queue, amount: usize) -> Result<Vec<(String, f64)>> {
        // Secondary rowid ordering keeps same-timestamp records in
        // insertion order.
        let mut query = format!(
            "SELECT key, timestamp FROM {} ORDER BY timestamp ASC, rowid ASC",
            queue.table_name()
        );
        if amount > 0 {
            query.push_str(&format!(" LIMIT {}", amount));
        }
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn collect_values(&mut self, queue: Queue, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT payload FROM {} WHERE key = ?1",
            queue.table_name()
        ))?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let payload: Option<String> = stmt
                .query_row(params![key], |row| row.get(0))
                .map(Some)
                .or_else(|error| match error {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            if let Some(payload) = payload {
                values.push(payload);
            }
        }
        Ok(values)
    }

    fn delete_records(&mut self, queue: Queue, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "DELETE FROM {} WHERE key = ?1",
                queue.table_name()
            ))?;
            for key in keys {
                stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn cleanup_outdated(&mut self, queue: Queue, ttl: u64) -> Result<usize> {
        let cutoff = current_timestamp() - ttl as f64;
        let removed = self.conn.execute(
            &format!("DELETE FROM {} WHERE timestamp < ?1", queue.table_name()),
            params![cutoff],
        )?;
        Ok(removed)
    }

    fn queue_size(&mut self, queue: Queue) -> Result<i64> {
        let size = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", queue.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(size)
    }
}
