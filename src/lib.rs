//! AgroVision kiosk recognition core
//!
//! Turns a live camera feed at a farm-input kiosk into stable, deduplicated
//! scan records: a printed product label or an agricultural item is held up to
//! the camera, recognized over several frames, confirmed once and persisted.
//!
//! # Invariants
//!
//! 1. **One frame in flight**: frames arriving while a pass runs are dropped.
//! 2. **Joint observations**: text and classifier results for a frame are fused
//!    together or not at all; replies for other frames are discarded.
//! 3. **One scan per episode**: an item held in view produces exactly one
//!    confirmed scan and one stored record, retries included.
//! 4. **Degrade, don't fabricate**: an unavailable engine contributes no
//!    results; the pipeline carries on with the other.
//! 5. **Frames stay local**: pixels are never logged, written or transmitted.
//!
//! # Module Structure
//!
//! - `frame`: captured frame handles and read-only views
//! - `ingest`: frame sources (synthetic, scripted, image directory, V4L2)
//! - `throttle`: single-slot admission gate
//! - `detect`: inference engines (text recognizer, item classifier)
//! - `text` / `catalog`: OCR text cleanup and product lookup
//! - `fusion`: confirmation window and state machine
//! - `storage`: scan record stores
//! - `pipeline`: threads, dispatch, events
//! - `config`: kioskd configuration

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod catalog;
pub mod config;
pub mod detect;
pub mod frame;
pub mod fusion;
pub mod ingest;
pub mod pipeline;
pub mod storage;
pub mod text;
pub mod throttle;

pub use catalog::{Catalog, CatalogMatch, MatchKind, Product};
pub use config::KioskConfig;
pub use detect::{EngineError, EngineKind, InferenceEngine, RecognitionResult};
pub use frame::{Frame, FrameView, PixelFormat};
pub use fusion::{ConfirmedScan, FusionConfig, FusionState, ResultFuser};
pub use ingest::{FrameSource, ScriptedSource, SourceStats, SyntheticSource};
pub use pipeline::{EpisodeId, PendingScan, PipelineConfig, PipelineController, PipelineEvent};
pub use storage::{InMemoryScanStore, ScanId, ScanRecord, ScanStore, SqliteScanStore, StoreError};
pub use throttle::FrameThrottler;

/// Unique shared-cache in-memory SQLite URI. Every connection opened with the
/// same URI sees the same database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:agrovision_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Milliseconds since the Unix epoch. A clock before 1970 reads as 0.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_memory_uris_are_unique() {
        assert_ne!(shared_memory_uri(), shared_memory_uri());
    }

    #[test]
    fn shared_memory_connections_share_state() -> Result<()> {
        let uri = shared_memory_uri();
        let a = open_db_connection(&uri)?;
        a.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (7);")?;
        let b = open_db_connection(&uri)?;
        let v: i64 = b.query_row("SELECT v FROM t", [], |row| row.get(0))?;
        assert_eq!(v, 7);
        Ok(())
    }
}
