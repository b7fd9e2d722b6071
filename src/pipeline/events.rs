use serde::{Deserialize, Serialize};

use crate::detect::EngineKind;
use crate::fusion::ConfirmedScan;
use crate::storage::ScanId;

/// Identity of one confirmation episode.
///
/// `run_id` is drawn at random on every controller start, so frame sequence
/// numbers restarting with a new source never produce a colliding key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpisodeId {
    pub run_id: u64,
    pub source_frame_seq: u64,
}

impl EpisodeId {
    /// Idempotency key used by the scan store.
    pub fn key(&self) -> String {
        format!("{:016x}-{}", self.run_id, self.source_frame_seq)
    }
}

impl std::fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// A confirmed scan bound to its episode, as handed to the store writer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingScan {
    pub episode: EpisodeId,
    pub scan: ConfirmedScan,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The fuser confirmed an item. Emitted before the write is attempted.
    Confirmed(PendingScan),
    /// The scan is durable. `duplicate` is set when the store already held it.
    Stored {
        episode: EpisodeId,
        scan_id: ScanId,
        duplicate: bool,
    },
    /// The write failed after one retry. Pass `pending` to `retry_store`.
    StoreFailed { pending: PendingScan, error: String },
    /// An engine became unavailable; the pipeline continues without it.
    Degraded { engine: EngineKind, reason: String },
    /// First frame of a streak too dark to analyse.
    LowLight { seq: u64, luminance: f32 },
    /// No engine is left; the pipeline has stopped itself.
    Failed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episode_key_is_zero_padded_hex_run_and_seq() {
        let id = EpisodeId {
            run_id: 0xabc,
            source_frame_seq: 42,
        };
        assert_eq!(id.key(), "0000000000000abc-42");
        assert_eq!(id.to_string(), id.key());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = PipelineEvent::LowLight {
            seq: 7,
            luminance: 12.5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "low_light");
        assert_eq!(json["seq"], 7);
    }
}
