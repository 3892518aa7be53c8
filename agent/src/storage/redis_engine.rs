//! Redis storage engine
//!
//! The reference layout: for every queue a sorted set
//! `chouette:{data_type}:{kind}.keys` scores record keys by timestamp,
//! and a hash `chouette:{data_type}:{kind}.values` maps keys to payloads.
//! Multi-structure mutations go through one MULTI/EXEC pipeline so a record
//! either exists in both structures or in neither.

use anyhow::{Context, Result};
use redis::{Commands, Connection};
use shared::utils::current_timestamp;

use super::{KeyedRecord, Queue, StorageEngine};

pub struct RedisEngine {
    conn: Connection,
}

impl RedisEngine {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let url = format!("redis://{}:{}/", host, port);
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("Invalid Redis URL {}", url))?;
        let conn = client
            .get_connection()
            .with_context(|| format!("Failed to connect to Redis at {}", url))?;
        tracing::info!("Redis storage connected to {}:{}", host, port);
        Ok(Self { conn })
    }
}

impl StorageEngine for RedisEngine {
    fn store_records(&mut self, queue: Queue, records: &[KeyedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let keys_set = queue.keys_set();
        let values_hash = queue.values_hash();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in records {
            pipe.zadd(&keys_set, &record.key, record.timestamp).ignore();
            pipe.hset(&values_hash, &record.key, &record.payload)
                .ignore();
        }
        pipe.query::<()>(&mut self.conn)
            .context("Failed to store records")?;
        Ok(())
    }

    fn collect_keys(&mut self, queue: Queue, amount: usize) -> Result<Vec<(String, f64)>> {
        let stop = if amount == 0 { -1 } else { amount as isize - 1 };
        let keys: Vec<(String, f64)> = self
            .conn
            .zrange_withscores(queue.keys_set(), 0, stop)
            .context("Failed to collect keys")?;
        Ok(keys)
    }

    fn collect_values(&mut self, queue: Queue, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        // HMGET returns one slot per requested key; missing keys come back
        // as nil and are dropped here.
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(queue.values_hash())
            .arg(keys)
            .query(&mut self.conn)
            .context("Failed to collect values")?;
        Ok(values.into_iter().flatten().collect())
    }

    fn delete_records(&mut self, queue: Queue, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(queue.keys_set(), keys).ignore();
        pipe.hdel(queue.values_hash(), keys).ignore();
        pipe.query::<()>(&mut self.conn)
            .context("Failed to delete records")?;
        Ok(())
    }

    fn cleanup_outdated(&mut self, queue: Queue, ttl: u64) -> Result<usize> {
        let cutoff = current_timestamp() - ttl as f64;
        // Exclusive upper bound: a record exactly at the cutoff is still
        // within its TTL, matching the SQLite engine's `timestamp < cutoff`.
        let max = format!("({}", cutoff);
        let outdated: Vec<String> = self
            .conn
            .zrangebyscore(queue.keys_set(), 0f64, max.as_str())
            .context("Failed to find outdated records")?;
        if outdated.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrembyscore(queue.keys_set(), 0f64, max.as_str()).ignore();
        pipe.hdel(queue.values_hash(), &outdated).ignore();
        pipe.query::<()>(&mut self.conn)
            .context("Failed to cleanup outdated records")?;
        Ok(outdated.len())
    }

    fn queue_size(&mut self, queue: Queue) -> Result<i64> {
        let size: i64 = self
            .conn
            .zcard(queue.keys_set())
            .context("Failed to read queue size")?;
        Ok(size)
    }
}
