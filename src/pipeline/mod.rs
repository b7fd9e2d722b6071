//! Pipeline orchestration.
//!
//! Thread layout while running:
//!
//! ```text
//!  intake ──offer──▶ throttler ──▶ fusion ──dispatch──▶ engine-text
//!  (source)                         │  ◀──replies────── engine-classifier
//!                                   │
//!                                   └──PendingScan──▶ scan-writer ──▶ ScanStore
//! ```
//!
//! The fusion thread owns the `ResultFuser` and is the only thread that
//! dispatches frames, so at most one frame is ever in flight.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

mod controller;
mod events;
mod workers;
mod writer;

pub use controller::{PipelineConfig, PipelineController};
pub use events::{EpisodeId, PendingScan, PipelineEvent};

use crate::ingest::SourceStats;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    observations: AtomicU64,
    confirmed: AtomicU64,
    stored: AtomicU64,
    store_failures: AtomicU64,
    low_light_frames: AtomicU64,
    engine_timeouts: AtomicU64,
}

impl Counters {
    pub(crate) fn bump_observations(&self) {
        self.observations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_confirmed(&self) {
        self.confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_store_failures(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_low_light(&self) {
        self.low_light_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_engine_timeouts(&self) {
        self.engine_timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time counters for health logging.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineStats {
    pub frames_admitted: u64,
    pub frames_dropped: u64,
    pub observations: u64,
    pub confirmed: u64,
    pub stored: u64,
    pub store_failures: u64,
    pub low_light_frames: u64,
    pub engine_timeouts: u64,
    pub source: Option<SourceStats>,
    pub source_healthy: bool,
}

impl PipelineStats {
    pub(crate) fn from_counters(counters: &Counters) -> Self {
        Self {
            observations: counters.observations.load(Ordering::Relaxed),
            confirmed: counters.confirmed.load(Ordering::Relaxed),
            stored: counters.stored.load(Ordering::Relaxed),
            store_failures: counters.store_failures.load(Ordering::Relaxed),
            low_light_frames: counters.low_light_frames.load(Ordering::Relaxed),
            engine_timeouts: counters.engine_timeouts.load(Ordering::Relaxed),
            ..Self::default()
        }
    }
}
