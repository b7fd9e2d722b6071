use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::catalog::CatalogMatch;
use crate::fusion::ConfirmedScan;
use crate::{now_ms, open_db_connection};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub i64);

impl std::fmt::Display for ScanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// A record for this episode already exists. Callers treat this as success.
    #[error("scan for episode {episode_key} already stored as #{existing_id}")]
    DuplicateScan {
        episode_key: String,
        existing_id: ScanId,
    },
    #[error("scan store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("record encoding: {}", err))
    }
}

/// A confirmed scan on its way to the store, keyed by its episode.
#[derive(Clone, Debug, PartialEq)]
pub struct NewScanRecord {
    pub episode_key: String,
    pub scan: ConfirmedScan,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: ScanId,
    pub episode_key: String,
    /// Epoch milliseconds at which the record was written.
    pub created_at: u64,
    #[serde(flatten)]
    pub scan: ConfirmedScan,
}

pub trait ScanStore: Send {
    /// Persist one scan. Idempotent by `episode_key`.
    fn write(&mut self, record: &NewScanRecord) -> Result<ScanId, StoreError>;

    /// Most recent records first.
    fn recent(&self, limit: usize) -> Result<Vec<ScanRecord>, StoreError>;

    fn get_by_episode(&self, episode_key: &str) -> Result<Option<ScanRecord>, StoreError>;

    fn count(&self) -> Result<u64, StoreError>;

    /// Delete records created before `cutoff_ms`. Returns the number deleted.
    fn purge_before(&mut self, cutoff_ms: u64) -> Result<usize, StoreError>;

    fn enforce_retention(&mut self, max_age: Duration) -> Result<usize, StoreError> {
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        self.purge_before(now_ms().saturating_sub(max_age_ms))
    }
}

impl<S: ScanStore + ?Sized> ScanStore for Box<S> {
    fn write(&mut self, record: &NewScanRecord) -> Result<ScanId, StoreError> {
        (**self).write(record)
    }

    fn recent(&self, limit: usize) -> Result<Vec<ScanRecord>, StoreError> {
        (**self).recent(limit)
    }

    fn get_by_episode(&self, episode_key: &str) -> Result<Option<ScanRecord>, StoreError> {
        (**self).get_by_episode(episode_key)
    }

    fn count(&self) -> Result<u64, StoreError> {
        (**self).count()
    }

    fn purge_before(&mut self, cutoff_ms: u64) -> Result<usize, StoreError> {
        (**self).purge_before(cutoff_ms)
    }
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

const RECORD_COLUMNS: &str = "id, episode_key, created_at, item_label, item_confidence, \
                              extracted_text, detected_at, source_frame_seq, catalog_match_json";

pub struct SqliteScanStore {
    conn: Connection,
}

impl SqliteScanStore {
    /// Open (creating if needed) the store at `db_path`. `file:` URIs are
    /// accepted, including shared in-memory databases.
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS scan_records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              episode_key TEXT NOT NULL UNIQUE,
              created_at INTEGER NOT NULL,
              item_label TEXT NOT NULL,
              item_confidence REAL NOT NULL,
              extracted_text TEXT NOT NULL,
              detected_at INTEGER NOT NULL,
              source_frame_seq INTEGER NOT NULL,
              catalog_match_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_scan_records_created ON scan_records(created_at);
            "#,
        )?;
        Ok(())
    }

    fn existing_id(&self, episode_key: &str) -> Result<Option<ScanId>, StoreError> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM scan_records WHERE episode_key = ?1",
                params![episode_key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.map(ScanId))
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Backend(format!("{} exceeds i64 range", what)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(ScanRecord, Option<String>)> {
    let created_at: i64 = row.get(2)?;
    let detected_at: i64 = row.get(6)?;
    let source_frame_seq: i64 = row.get(7)?;
    let confidence: f64 = row.get(4)?;
    let record = ScanRecord {
        id: ScanId(row.get(0)?),
        episode_key: row.get(1)?,
        created_at: created_at.max(0) as u64,
        scan: ConfirmedScan {
            item_label: row.get(3)?,
            item_confidence: confidence as f32,
            extracted_text: row.get(5)?,
            detected_at: detected_at.max(0) as u64,
            source_frame_seq: source_frame_seq.max(0) as u64,
            catalog_match: None,
        },
    };
    Ok((record, row.get(8)?))
}

fn attach_match(
    (mut record, catalog_json): (ScanRecord, Option<String>),
) -> Result<ScanRecord, StoreError> {
    if let Some(json) = catalog_json {
        record.scan.catalog_match = Some(serde_json::from_str::<CatalogMatch>(&json)?);
    }
    Ok(record)
}

impl ScanStore for SqliteScanStore {
    fn write(&mut self, record: &NewScanRecord) -> Result<ScanId, StoreError> {
        let scan = &record.scan;
        let catalog_json = scan
            .catalog_match
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let inserted = self.conn.execute(
            r#"
            INSERT INTO scan_records(
              episode_key, created_at, item_label, item_confidence,
              extracted_text, detected_at, source_frame_seq, catalog_match_json
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(episode_key) DO NOTHING
            "#,
            params![
                record.episode_key,
                to_i64(now_ms(), "created_at")?,
                scan.item_label,
                scan.item_confidence as f64,
                scan.extracted_text,
                to_i64(scan.detected_at, "detected_at")?,
                to_i64(scan.source_frame_seq, "source_frame_seq")?,
                catalog_json,
            ],
        )?;

        if inserted == 0 {
            let existing_id = self.existing_id(&record.episode_key)?.ok_or_else(|| {
                StoreError::Backend(format!(
                    "insert for episode {} ignored but no existing row found",
                    record.episode_key
                ))
            })?;
            return Err(StoreError::DuplicateScan {
                episode_key: record.episode_key.clone(),
                existing_id,
            });
        }
        Ok(ScanId(self.conn.last_insert_rowid()))
    }

    fn recent(&self, limit: usize) -> Result<Vec<ScanRecord>, StoreError> {
        let rows = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {} FROM scan_records ORDER BY id DESC LIMIT ?1",
                RECORD_COLUMNS
            ))?;
            let rows = stmt.query_map(params![to_i64(limit as u64, "limit")?], record_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(attach_match).collect()
    }

    fn get_by_episode(&self, episode_key: &str) -> Result<Option<ScanRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM scan_records WHERE episode_key = ?1",
                    RECORD_COLUMNS
                ),
                params![episode_key],
                record_from_row,
            )
            .optional()?;
        row.map(attach_match).transpose()
    }

    fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scan_records", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn purge_before(&mut self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM scan_records WHERE created_at < ?1",
            params![to_i64(cutoff_ms, "cutoff")?],
        )?;
        Ok(deleted)
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct InMemoryRecords {
    next_id: i64,
    records: Vec<ScanRecord>,
    by_episode: HashMap<String, ScanId>,
}

/// Volatile store for tests and dry runs. Clones share the same records.
#[derive(Clone, Debug, Default)]
pub struct InMemoryScanStore {
    inner: Arc<Mutex<InMemoryRecords>>,
}

impl InMemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryRecords>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".into()))
    }
}

impl ScanStore for InMemoryScanStore {
    fn write(&mut self, record: &NewScanRecord) -> Result<ScanId, StoreError> {
        let mut inner = self.lock()?;
        if let Some(existing_id) = inner.by_episode.get(&record.episode_key) {
            return Err(StoreError::DuplicateScan {
                episode_key: record.episode_key.clone(),
                existing_id: *existing_id,
            });
        }
        inner.next_id += 1;
        let id = ScanId(inner.next_id);
        inner.records.push(ScanRecord {
            id,
            episode_key: record.episode_key.clone(),
            created_at: now_ms(),
            scan: record.scan.clone(),
        });
        inner.by_episode.insert(record.episode_key.clone(), id);
        Ok(id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<ScanRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.records.iter().rev().take(limit).cloned().collect())
    }

    fn get_by_episode(&self, episode_key: &str) -> Result<Option<ScanRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .iter()
            .find(|r| r.episode_key == episode_key)
            .cloned())
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.records.len() as u64)
    }

    fn purge_before(&mut self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let before = inner.records.len();
        inner.records.retain(|r| r.created_at >= cutoff_ms);
        let kept: HashMap<String, ScanId> = inner
            .records
            .iter()
            .map(|r| (r.episode_key.clone(), r.id))
            .collect();
        inner.by_episode = kept;
        Ok(before - inner.records.len())
    }
}
