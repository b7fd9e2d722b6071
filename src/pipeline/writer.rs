use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use super::events::{PendingScan, PipelineEvent};
use super::Counters;
use crate::storage::{NewScanRecord, ScanId, ScanStore, StoreError};

pub(crate) enum WriteOutcome {
    Stored { scan_id: ScanId, duplicate: bool },
    Failed(StoreError),
}

/// Write once, retry once after `backoff` on a backend error. A duplicate
/// episode is success: the scan is already durable.
pub(crate) fn write_with_retry(
    store: &mut dyn ScanStore,
    pending: &PendingScan,
    backoff: Duration,
) -> WriteOutcome {
    let record = NewScanRecord {
        episode_key: pending.episode.key(),
        scan: pending.scan.clone(),
    };
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.write(&record) {
            Ok(scan_id) => {
                return WriteOutcome::Stored {
                    scan_id,
                    duplicate: false,
                }
            }
            Err(StoreError::DuplicateScan { existing_id, .. }) => {
                log::debug!("scan {} already stored as #{}", record.episode_key, existing_id);
                return WriteOutcome::Stored {
                    scan_id: existing_id,
                    duplicate: true,
                };
            }
            Err(err) if attempt == 1 => {
                log::warn!(
                    "scan {} write failed, retrying in {:?}: {}",
                    record.episode_key,
                    backoff,
                    err
                );
                std::thread::sleep(backoff);
            }
            Err(err) => return WriteOutcome::Failed(err),
        }
    }
}

pub(crate) fn outcome_event(pending: PendingScan, outcome: WriteOutcome, counters: &Counters) -> PipelineEvent {
    match outcome {
        WriteOutcome::Stored { scan_id, duplicate } => {
            counters.bump_stored();
            log::info!(
                "scan stored: #{} {} ({}){}",
                scan_id,
                pending.scan.item_label,
                pending.episode,
                if duplicate { " [already stored]" } else { "" }
            );
            PipelineEvent::Stored {
                episode: pending.episode,
                scan_id,
                duplicate,
            }
        }
        WriteOutcome::Failed(err) => {
            counters.bump_store_failures();
            log::error!("scan {} not stored: {}", pending.episode, err);
            PipelineEvent::StoreFailed {
                pending,
                error: err.to_string(),
            }
        }
    }
}

/// Serializes all store writes on one thread. Exits (returning the store) once
/// every sender is dropped and the queue is drained.
pub(crate) fn spawn_writer(
    mut store: Box<dyn ScanStore>,
    jobs: Receiver<PendingScan>,
    events: Sender<PipelineEvent>,
    counters: std::sync::Arc<Counters>,
    backoff: Duration,
) -> Result<JoinHandle<Box<dyn ScanStore>>> {
    std::thread::Builder::new()
        .name("scan-writer".into())
        .spawn(move || {
            for pending in jobs.iter() {
                let outcome = write_with_retry(store.as_mut(), &pending, backoff);
                let _ = events.send(outcome_event(pending, outcome, &counters));
            }
            store
        })
        .context("spawn scan writer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::ConfirmedScan;
    use crate::pipeline::EpisodeId;
    use crate::storage::{InMemoryScanStore, ScanRecord};

    struct FailingStore {
        failures_left: usize,
        inner: InMemoryScanStore,
    }

    impl ScanStore for FailingStore {
        fn write(&mut self, record: &NewScanRecord) -> Result<ScanId, StoreError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(StoreError::Backend("disk busy".into()));
            }
            self.inner.write(record)
        }

        fn recent(&self, limit: usize) -> Result<Vec<ScanRecord>, StoreError> {
            self.inner.recent(limit)
        }

        fn get_by_episode(&self, key: &str) -> Result<Option<ScanRecord>, StoreError> {
            self.inner.get_by_episode(key)
        }

        fn count(&self) -> Result<u64, StoreError> {
            self.inner.count()
        }

        fn purge_before(&mut self, cutoff_ms: u64) -> Result<usize, StoreError> {
            self.inner.purge_before(cutoff_ms)
        }
    }

    fn pending(seq: u64) -> PendingScan {
        PendingScan {
            episode: EpisodeId {
                run_id: 1,
                source_frame_seq: seq,
            },
            scan: ConfirmedScan {
                item_label: "tomato".into(),
                item_confidence: 0.9,
                extracted_text: String::new(),
                detected_at: 0,
                source_frame_seq: seq,
                catalog_match: None,
            },
        }
    }

    #[test]
    fn single_failure_is_retried() {
        let mut store = FailingStore {
            failures_left: 1,
            inner: InMemoryScanStore::new(),
        };
        let outcome = write_with_retry(&mut store, &pending(3), Duration::from_millis(1));
        assert!(matches!(outcome, WriteOutcome::Stored { duplicate: false, .. }));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn second_failure_is_reported() {
        let mut store = FailingStore {
            failures_left: 2,
            inner: InMemoryScanStore::new(),
        };
        let outcome = write_with_retry(&mut store, &pending(3), Duration::from_millis(1));
        assert!(matches!(outcome, WriteOutcome::Failed(StoreError::Backend(_))));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn duplicate_counts_as_stored() {
        let mut store = InMemoryScanStore::new();
        let first = write_with_retry(&mut store, &pending(3), Duration::ZERO);
        let second = write_with_retry(&mut store, &pending(3), Duration::ZERO);
        let (WriteOutcome::Stored { scan_id: a, .. }, WriteOutcome::Stored { scan_id: b, duplicate }) =
            (first, second)
        else {
            panic!("both writes should count as stored");
        };
        assert_eq!(a, b);
        assert!(duplicate);
        assert_eq!(store.count().unwrap(), 1);
    }
}
