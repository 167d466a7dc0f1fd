//! Embedded vector store.
//!
//! A single SQLite file holding one little-endian `f32` BLOB per record,
//! keyed by sha256(record id). The file is opened by one process only
//! (exclusive locking mode) over a single connection.
//!
//! # Capacity
//!
//! The store caps its own size with `PRAGMA max_page_count`. When a write
//! transaction hits the cap (`SQLITE_FULL`) it is rolled back, the cap is
//! doubled, and the same transaction is retried. Callers never see the
//! condition.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteLockingMode};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::ResultSink;
use crate::models::{ResultBatch, ResultItem};
use crate::skip::id_hash;

/// SQLite primary result code for "database or disk is full".
const SQLITE_FULL: &str = "13";

/// Give up after this many doublings in one write; the disk itself is full.
const MAX_GROWTHS: u32 = 24;

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// The vector carried by a result item: `image_vectors[0]`, else `vector`.
pub fn extract_vector(item: &ResultItem) -> Option<Vec<f32>> {
    let value = item
        .fields
        .get("image_vectors")
        .and_then(|v| v.get(0))
        .or_else(|| item.fields.get("vector"))?;
    value
        .as_array()?
        .iter()
        .map(|x| x.as_f64().map(|f| f as f32))
        .collect()
}

fn is_full(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .map(|code| code == SQLITE_FULL)
        .unwrap_or(false)
}

pub struct VectorStore {
    conn: Mutex<SqliteConnection>,
    path: PathBuf,
}

impl VectorStore {
    /// Open (or create) the store at `path` with room for at least
    /// `initial_capacity_bytes`.
    pub async fn open(path: &Path, initial_capacity_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .locking_mode(SqliteLockingMode::Exclusive);
        let mut conn = options
            .connect()
            .await
            .with_context(|| format!("Failed to open vector store {}", path.display()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vectors (
                key TEXT PRIMARY KEY,
                dims INTEGER NOT NULL,
                vector BLOB NOT NULL
            )",
        )
        .execute(&mut conn)
        .await?;

        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&mut conn)
            .await?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&mut conn)
            .await?;
        let wanted = (initial_capacity_bytes as i64 / page_size.max(1)).max(page_count + 1);
        let pages = set_max_pages(&mut conn, wanted).await?;

        info!(path = %path.display(), max_pages = pages, page_size, "vector store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace every `(key, vector)` pair in one transaction.
    pub async fn put_many(&self, rows: &[(String, Vec<f32>)]) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let mut growths = 0;
        loop {
            match write_all(&mut conn, rows).await {
                Ok(()) => return Ok(rows.len()),
                Err(e) if is_full(&e) && growths < MAX_GROWTHS => {
                    let current: i64 = sqlx::query_scalar("PRAGMA max_page_count")
                        .fetch_one(&mut *conn)
                        .await?;
                    let grown = set_max_pages(&mut conn, current.saturating_mul(2)).await?;
                    growths += 1;
                    info!(from = current, to = grown, "vector store full; capacity doubled");
                }
                Err(e) => return Err(e).context("Vector store write failed"),
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<f32>>> {
        let mut conn = self.conn.lock().await;
        let blob: Option<Vec<u8>> = sqlx::query_scalar("SELECT vector FROM vectors WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    pub async fn count(&self) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
            .fetch_one(&mut *conn)
            .await?)
    }

    /// Current page-count ceiling.
    pub async fn capacity_pages(&self) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        Ok(sqlx::query_scalar("PRAGMA max_page_count")
            .fetch_one(&mut *conn)
            .await?)
    }
}

async fn set_max_pages(conn: &mut SqliteConnection, pages: i64) -> Result<i64> {
    let applied: i64 = sqlx::query_scalar(&format!("PRAGMA max_page_count = {}", pages))
        .fetch_one(&mut *conn)
        .await?;
    Ok(applied)
}

async fn write_all(conn: &mut SqliteConnection, rows: &[(String, Vec<f32>)]) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    for (key, vector) in rows {
        let inserted = sqlx::query("INSERT OR REPLACE INTO vectors (key, dims, vector) VALUES (?, ?, ?)")
            .bind(key)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await;
        if let Err(e) = inserted {
            let _ = tx.rollback().await;
            return Err(e);
        }
    }
    tx.commit().await
}

pub struct VectorSink {
    store: VectorStore,
}

impl VectorSink {
    pub fn new(store: VectorStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }
}

#[async_trait]
impl ResultSink for VectorSink {
    fn name(&self) -> &str {
        "vector_store"
    }

    async fn persist(&self, batch: &ResultBatch) -> Result<usize> {
        let rows: Vec<(String, Vec<f32>)> = batch
            .items
            .iter()
            .filter_map(|item| match extract_vector(item) {
                Some(v) => Some((id_hash(&item.id), v)),
                None => {
                    debug!(id = %item.id, "result has no vector");
                    None
                }
            })
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }
        self.store.put_many(&rows).await
    }
}
