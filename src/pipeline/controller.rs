use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::events::{EpisodeId, PendingScan, PipelineEvent};
use super::workers::{EngineWorker, Reply};
use super::writer::{outcome_event, spawn_writer, write_with_retry};
use super::{Counters, PipelineStats};
use crate::catalog::Catalog;
use crate::detect::{EngineError, EngineKind, InferenceEngine, RecognitionResult};
use crate::frame::Frame;
use crate::fusion::{ConfirmedScan, FusionConfig, Observation, ResultFuser};
use crate::ingest::{FrameSource, SourceStats};
use crate::storage::ScanStore;
use crate::throttle::FrameThrottler;

const CANCEL_POLL: Duration = Duration::from_millis(10);
const SOURCE_RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub const DEFAULT_TEXT_TIMEOUT: Duration = Duration::from_millis(400);
pub const DEFAULT_CLASSIFIER_TIMEOUT: Duration = Duration::from_millis(300);
pub const DEFAULT_STORE_RETRY_BACKOFF: Duration = Duration::from_millis(200);
pub const DEFAULT_MIN_LUMINANCE: f32 = 45.0;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub fusion: FusionConfig,
    pub text_timeout: Duration,
    pub classifier_timeout: Duration,
    pub store_retry_backoff: Duration,
    /// Frames darker than this (mean luma, 0..=255) are not analysed.
    pub min_luminance: f32,
    /// How often the fuser's timers are advanced while no frame arrives.
    pub tick_interval: Duration,
    pub catalog: Option<Arc<Catalog>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fusion: FusionConfig::default(),
            text_timeout: DEFAULT_TEXT_TIMEOUT,
            classifier_timeout: DEFAULT_CLASSIFIER_TIMEOUT,
            store_retry_backoff: DEFAULT_STORE_RETRY_BACKOFF,
            min_luminance: DEFAULT_MIN_LUMINANCE,
            tick_interval: DEFAULT_TICK_INTERVAL,
            catalog: None,
        }
    }
}

#[derive(Clone, Debug)]
struct SourceHealth {
    stats: SourceStats,
    healthy: bool,
}

type SharedHealth = Arc<Mutex<Option<SourceHealth>>>;
type InFlight = Arc<Mutex<Option<Arc<Frame>>>>;
type EnginePair = (Option<Box<dyn InferenceEngine>>, Option<Box<dyn InferenceEngine>>);

struct Running {
    stop: Arc<AtomicBool>,
    in_flight: InFlight,
    admitted: Sender<Frame>,
    writes: Sender<PendingScan>,
    intake: Option<JoinHandle<()>>,
    fusion: JoinHandle<EnginePair>,
    writer: JoinHandle<Box<dyn ScanStore>>,
}

/// Owns the engine pair, the store and the pipeline threads.
///
/// `start` takes the engines and store onto worker threads; `stop` joins the
/// threads and takes them back, so a controller can be restarted.
pub struct PipelineController {
    config: PipelineConfig,
    text: Option<Box<dyn InferenceEngine>>,
    classifier: Option<Box<dyn InferenceEngine>>,
    store: Option<Box<dyn ScanStore>>,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    throttler: Arc<FrameThrottler>,
    counters: Arc<Counters>,
    source_health: SharedHealth,
    running: Option<Running>,
}

impl PipelineController {
    pub fn new<T, C, S>(config: PipelineConfig, text: T, classifier: C, store: S) -> Result<Self>
    where
        T: InferenceEngine + 'static,
        C: InferenceEngine + 'static,
        S: ScanStore + 'static,
    {
        if text.kind() != EngineKind::Text {
            bail!("text slot given a {} engine ({})", text.kind(), text.name());
        }
        if classifier.kind() != EngineKind::Classifier {
            bail!(
                "classifier slot given a {} engine ({})",
                classifier.kind(),
                classifier.name()
            );
        }
        let (events_tx, events_rx) = unbounded();
        Ok(Self {
            config,
            text: Some(Box::new(text)),
            classifier: Some(Box::new(classifier)),
            store: Some(Box::new(store)),
            events_tx,
            events_rx,
            throttler: Arc::new(FrameThrottler::new()),
            counters: Arc::new(Counters::default()),
            source_health: Arc::new(Mutex::new(None)),
            running: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Receiver of pipeline events, in the order they occur.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    /// Run the pipeline pulling frames from `source`.
    pub fn start<S: FrameSource + 'static>(&mut self, source: S) -> Result<()> {
        self.launch(Some(Box::new(source)))
    }

    /// Run the pipeline without an intake thread; frames arrive via `submit`.
    pub fn start_push(&mut self) -> Result<()> {
        self.launch(None)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.stop.load(Ordering::Acquire))
    }

    /// True while a frame is being processed.
    pub fn is_busy(&self) -> bool {
        self.throttler.is_busy()
    }

    /// Offer a frame from a push-style source. Returns false when the frame
    /// was dropped (pipeline busy or not running).
    pub fn submit(&self, frame: Frame) -> bool {
        let Some(running) = self.running.as_ref() else {
            return false;
        };
        if running.stop.load(Ordering::Acquire) || !self.throttler.offer(&frame) {
            return false;
        }
        if running.admitted.try_send(frame).is_err() {
            self.throttler.processing_complete();
            return false;
        }
        true
    }

    /// Re-submit a scan whose write failed. Safe to repeat: the store
    /// deduplicates by episode key. The outcome arrives as a `Stored` or
    /// `StoreFailed` event.
    pub fn retry_store(&mut self, pending: PendingScan) -> Result<()> {
        if let Some(running) = self.running.as_ref() {
            return running
                .writes
                .send(pending)
                .map_err(|_| anyhow!("scan writer is not running"));
        }
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| anyhow!("scan store unavailable"))?;
        let outcome = write_with_retry(store.as_mut(), &pending, self.config.store_retry_backoff);
        let _ = self
            .events_tx
            .send(outcome_event(pending, outcome, &self.counters));
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        let throttle = self.throttler.stats();
        let mut stats = PipelineStats::from_counters(&self.counters);
        stats.frames_admitted = throttle.admitted;
        stats.frames_dropped = throttle.dropped;
        if let Ok(health) = self.source_health.lock() {
            if let Some(health) = health.as_ref() {
                stats.source = Some(health.stats.clone());
                stats.source_healthy = health.healthy;
            }
        }
        stats
    }

    /// Stop intake, cancel the in-flight frame, drain pending writes and join
    /// all threads. No-op when not running.
    pub fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.stop.store(true, Ordering::Release);
        if let Ok(slot) = running.in_flight.lock() {
            if let Some(frame) = slot.as_ref() {
                log::debug!("cancelling in-flight frame {}", frame.seq);
                frame.release();
            }
        }

        let mut panicked = Vec::new();
        match running.fusion.join() {
            Ok((text, classifier)) => {
                self.text = text;
                self.classifier = classifier;
            }
            Err(_) => panicked.push("fusion"),
        }
        if let Some(intake) = running.intake {
            if intake.join().is_err() {
                panicked.push("intake");
            }
        }
        drop(running.admitted);
        drop(running.writes);
        match running.writer.join() {
            Ok(store) => self.store = Some(store),
            Err(_) => panicked.push("scan-writer"),
        }
        self.throttler.processing_complete();

        if !panicked.is_empty() {
            bail!("pipeline threads panicked: {}", panicked.join(", "));
        }
        log::info!("pipeline stopped");
        Ok(())
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Returns false (after emitting `Degraded`) when the engine cannot run.
    fn warm_up(&self, engine: &mut dyn InferenceEngine) -> bool {
        match engine.warm_up() {
            Ok(()) => {
                log::info!("{} engine ready: {}", engine.kind(), engine.name());
                true
            }
            Err(err) => {
                log::warn!(
                    "{} engine {} unavailable, continuing degraded: {}",
                    engine.kind(),
                    engine.name(),
                    err
                );
                self.emit(PipelineEvent::Degraded {
                    engine: engine.kind(),
                    reason: err.to_string(),
                });
                false
            }
        }
    }

    fn launch(&mut self, mut source: Option<Box<dyn FrameSource>>) -> Result<()> {
        if self.running.is_some() {
            bail!("pipeline already running");
        }
        if self.text.is_none() || self.classifier.is_none() || self.store.is_none() {
            bail!("pipeline components were lost by an earlier failed shutdown");
        }
        if let Some(source) = source.as_mut() {
            source.connect().context("connect frame source")?;
        }

        let (Some(mut text), Some(mut classifier), Some(store)) =
            (self.text.take(), self.classifier.take(), self.store.take())
        else {
            bail!("pipeline components unavailable");
        };

        let text_live = self.warm_up(text.as_mut());
        let classifier_live = self.warm_up(classifier.as_mut());
        if !text_live && !classifier_live {
            self.text = Some(text);
            self.classifier = Some(classifier);
            self.store = Some(store);
            let reason = "no inference engine available".to_string();
            log::error!("pipeline failed: {}", reason);
            self.emit(PipelineEvent::Failed {
                reason: reason.clone(),
            });
            bail!(reason);
        }

        let run_id = rand::random::<u64>();
        let stop = Arc::new(AtomicBool::new(false));
        let in_flight: InFlight = Arc::new(Mutex::new(None));
        let (admitted_tx, admitted_rx) = bounded::<Frame>(1);
        let (writes_tx, writes_rx) = unbounded::<PendingScan>();
        let (replies_tx, replies_rx) = unbounded::<Reply>();

        let writer = spawn_writer(
            store,
            writes_rx,
            self.events_tx.clone(),
            self.counters.clone(),
            self.config.store_retry_backoff,
        )?;
        let text_worker = EngineWorker::spawn(text, replies_tx.clone())?;
        let classifier_worker = EngineWorker::spawn(classifier, replies_tx)?;

        let mut fuser = ResultFuser::new(self.config.fusion.clone());
        if let Some(catalog) = &self.config.catalog {
            fuser = fuser.with_catalog(catalog.clone());
        }
        let fusion_loop = FusionLoop {
            run_id,
            min_luminance: self.config.min_luminance,
            tick_interval: self.config.tick_interval,
            fuser,
            text: EngineSlot {
                worker: text_worker,
                live: text_live,
                timeout: self.config.text_timeout,
            },
            classifier: EngineSlot {
                worker: classifier_worker,
                live: classifier_live,
                timeout: self.config.classifier_timeout,
            },
            frames: admitted_rx,
            replies: replies_rx,
            writes: writes_tx.clone(),
            events: self.events_tx.clone(),
            throttler: self.throttler.clone(),
            counters: self.counters.clone(),
            stop: stop.clone(),
            in_flight: in_flight.clone(),
            committed: HashSet::new(),
            dark_streak: false,
        };
        let fusion = std::thread::Builder::new()
            .name("fusion".into())
            .spawn(move || fusion_loop.run())
            .context("spawn fusion thread")?;

        let intake = match source {
            Some(source) => {
                let intake = Intake {
                    source,
                    admitted: admitted_tx.clone(),
                    throttler: self.throttler.clone(),
                    stop: stop.clone(),
                    health: self.source_health.clone(),
                };
                Some(
                    std::thread::Builder::new()
                        .name("intake".into())
                        .spawn(move || intake.run())
                        .context("spawn intake thread")?,
                )
            }
            None => None,
        };

        self.running = Some(Running {
            stop,
            in_flight,
            admitted: admitted_tx,
            writes: writes_tx,
            intake,
            fusion,
            writer,
        });
        log::info!("pipeline started (run {:016x})", run_id);
        Ok(())
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("pipeline shutdown failed: {:#}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Intake
// ----------------------------------------------------------------------------

struct Intake {
    source: Box<dyn FrameSource>,
    admitted: Sender<Frame>,
    throttler: Arc<FrameThrottler>,
    stop: Arc<AtomicBool>,
    health: SharedHealth,
}

impl Intake {
    fn run(mut self) {
        while !self.stop.load(Ordering::Acquire) {
            match self.source.next_frame() {
                Ok(Some(frame)) => {
                    if self.throttler.offer(&frame) && self.admitted.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    log::info!("frame source {} reached end of stream", self.source.stats().source);
                    break;
                }
                Err(err) => {
                    log::warn!("frame source error: {:#}", err);
                    std::thread::sleep(SOURCE_RETRY_BACKOFF);
                    if !self.source.is_healthy() {
                        if let Err(err) = self.source.connect() {
                            log::warn!("frame source reconnect failed: {:#}", err);
                        }
                    }
                }
            }
            self.publish_health();
        }
        self.publish_health();
    }

    fn publish_health(&self) {
        if let Ok(mut health) = self.health.lock() {
            *health = Some(SourceHealth {
                stats: self.source.stats(),
                healthy: self.source.is_healthy(),
            });
        }
    }
}

// ----------------------------------------------------------------------------
// Fusion
// ----------------------------------------------------------------------------

struct EngineSlot {
    worker: EngineWorker,
    live: bool,
    timeout: Duration,
}

enum Pending {
    Waiting(Instant),
    Done(Result<RecognitionResult, EngineError>),
}

impl Pending {
    fn deadline(&self) -> Option<Instant> {
        match self {
            Pending::Waiting(deadline) => Some(*deadline),
            Pending::Done(_) => None,
        }
    }

    fn expire(&mut self, now: Instant) {
        if self.deadline().is_some_and(|deadline| now >= deadline) {
            *self = Pending::Done(Err(EngineError::InferenceTimeout));
        }
    }

    fn complete(&mut self, outcome: Result<RecognitionResult, EngineError>) {
        if matches!(self, Pending::Waiting(_)) {
            *self = Pending::Done(outcome);
        }
    }

    fn into_outcome(self) -> Result<RecognitionResult, EngineError> {
        match self {
            Pending::Done(outcome) => outcome,
            Pending::Waiting(_) => Err(EngineError::InferenceTimeout),
        }
    }
}

struct FusionLoop {
    run_id: u64,
    min_luminance: f32,
    tick_interval: Duration,
    fuser: ResultFuser,
    text: EngineSlot,
    classifier: EngineSlot,
    frames: Receiver<Frame>,
    replies: Receiver<Reply>,
    writes: Sender<PendingScan>,
    events: Sender<PipelineEvent>,
    throttler: Arc<FrameThrottler>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    in_flight: InFlight,
    committed: HashSet<String>,
    dark_streak: bool,
}

impl FusionLoop {
    fn run(mut self) -> EnginePair {
        while !self.stop.load(Ordering::Acquire) {
            match self.frames.recv_timeout(self.tick_interval) {
                Ok(frame) => self.process(frame),
                Err(RecvTimeoutError::Timeout) => self.fuser.tick(Instant::now()),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        while let Ok(frame) = self.frames.try_recv() {
            frame.release();
        }
        self.fuser.reset();
        self.throttler.processing_complete();
        (self.text.worker.shutdown(), self.classifier.worker.shutdown())
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    fn set_in_flight(&self, frame: Option<Arc<Frame>>) {
        if let Ok(mut slot) = self.in_flight.lock() {
            *slot = frame;
        }
    }

    fn process(&mut self, frame: Frame) {
        let luminance = frame.mean_luminance();
        if luminance < self.min_luminance {
            self.counters.bump_low_light();
            if !self.dark_streak {
                self.dark_streak = true;
                log::warn!(
                    "frame {} too dark to analyse (mean luminance {:.1})",
                    frame.seq,
                    luminance
                );
                self.emit(PipelineEvent::LowLight {
                    seq: frame.seq,
                    luminance,
                });
            }
            self.fuser.tick(frame.captured_at());
            frame.release();
            drop(frame);
            self.throttler.processing_complete();
            return;
        }
        self.dark_streak = false;

        if log::log_enabled!(log::Level::Trace) {
            log::trace!("frame {} analysed, digest {}", frame.seq, frame.digest_hex());
        }
        let frame = Arc::new(frame);
        self.set_in_flight(Some(frame.clone()));
        let joint = self.infer_joint(&frame);
        self.set_in_flight(None);
        frame.release();

        if let Some((text, classification)) = joint {
            let observation = Observation {
                seq: frame.seq,
                captured_at: frame.captured_at(),
                detected_at_ms: frame.timestamp_ms,
                text,
                classification,
            };
            drop(frame);
            self.counters.bump_observations();
            if let Some(scan) = self.fuser.observe(&observation) {
                self.commit(scan);
            }
        }
        self.throttler.processing_complete();
    }

    /// Dispatch both engines and wait for both replies for this frame. Returns
    /// `None` when the pass was cancelled by `stop`.
    fn infer_joint(&mut self, frame: &Arc<Frame>) -> Option<(RecognitionResult, RecognitionResult)> {
        let started = Instant::now();
        let mut text = begin(&self.text, frame, started);
        let mut classification = begin(&self.classifier, frame, started);

        loop {
            let now = Instant::now();
            text.expire(now);
            classification.expire(now);
            let next_deadline = match (text.deadline(), classification.deadline()) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => break,
            };
            if self.stop.load(Ordering::Acquire) {
                return None;
            }

            match self.replies.recv_deadline(next_deadline.min(now + CANCEL_POLL)) {
                Ok(reply) if reply.seq == frame.seq => match reply.kind {
                    EngineKind::Text => text.complete(reply.outcome),
                    EngineKind::Classifier => classification.complete(reply.outcome),
                },
                Ok(stale) => {
                    log::trace!(
                        "discarding stale {} reply for frame {} (current {})",
                        stale.kind,
                        stale.seq,
                        frame.seq
                    );
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    let gone = || Err(EngineError::ModelUnavailable("engine worker exited".into()));
                    text.complete(gone());
                    classification.complete(gone());
                }
            }
        }

        let text = self.settle(EngineKind::Text, text.into_outcome(), frame.seq);
        let classification =
            self.settle(EngineKind::Classifier, classification.into_outcome(), frame.seq);

        if !self.text.live && !self.classifier.live {
            let reason = "both inference engines unavailable".to_string();
            log::error!("pipeline failed: {}", reason);
            self.emit(PipelineEvent::Failed { reason });
            self.stop.store(true, Ordering::Release);
        }
        Some((text, classification))
    }

    fn settle(
        &mut self,
        kind: EngineKind,
        outcome: Result<RecognitionResult, EngineError>,
        seq: u64,
    ) -> RecognitionResult {
        match outcome {
            Ok(result) => result,
            Err(EngineError::ModelUnavailable(reason)) => {
                self.mark_dead(kind, reason);
                RecognitionResult::NoDetection
            }
            Err(err) => {
                if err == EngineError::InferenceTimeout {
                    self.counters.bump_engine_timeouts();
                }
                log::debug!("{} engine, frame {}: {}", kind, seq, err);
                RecognitionResult::NoDetection
            }
        }
    }

    fn mark_dead(&mut self, kind: EngineKind, reason: String) {
        let slot = match kind {
            EngineKind::Text => &mut self.text,
            EngineKind::Classifier => &mut self.classifier,
        };
        if !slot.live {
            return;
        }
        slot.live = false;
        log::warn!(
            "{} engine {} unavailable, continuing degraded: {}",
            kind,
            slot.worker.name(),
            reason
        );
        self.emit(PipelineEvent::Degraded {
            engine: kind,
            reason: EngineError::ModelUnavailable(reason).to_string(),
        });
    }

    fn commit(&mut self, scan: ConfirmedScan) {
        let episode = EpisodeId {
            run_id: self.run_id,
            source_frame_seq: scan.source_frame_seq,
        };
        self.counters.bump_confirmed();
        log::info!(
            "item confirmed: {} ({:.2}) text={:?} episode {}",
            scan.item_label,
            scan.item_confidence,
            scan.extracted_text,
            episode
        );
        let pending = PendingScan { episode, scan };
        self.emit(PipelineEvent::Confirmed(pending.clone()));
        if self.committed.insert(episode.key()) && self.writes.send(pending).is_err() {
            log::error!("scan writer gone; episode {} not stored", episode);
        }
        self.fuser.begin_cooldown();
    }
}

fn begin(slot: &EngineSlot, frame: &Arc<Frame>, started: Instant) -> Pending {
    if !slot.live {
        return Pending::Done(Ok(RecognitionResult::NoDetection));
    }
    match slot.worker.dispatch(frame) {
        Ok(()) => Pending::Waiting(started + slot.timeout),
        Err(err) => {
            log::debug!(
                "{} engine not dispatched for frame {}: {}",
                slot.worker.kind(),
                frame.seq,
                err
            );
            Pending::Done(Err(err))
        }
    }
}
