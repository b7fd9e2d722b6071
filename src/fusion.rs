//! Result fusion and confirmation.
//!
//! Per-frame engine output is noisy: motion blur and partial occlusion produce
//! single-frame misreads. `ResultFuser` turns the stream of joint observations
//! into at most one `ConfirmedScan` per stable episode.
//!
//! ```text
//!            qualifying                      K agreeing within W
//!   Idle ---------------> Accumulating -------------------------> Confirmed
//!    ^                        |                                      |
//!    |   nothing qualifying   |                       begin_cooldown |
//!    +------- for D ----------+                                      v
//!    +--------------- nothing qualifying for C ------------------ Cooldown
//! ```
//!
//! An observation qualifies when its classification confidence reaches the
//! detect threshold (subject = label), or failing that its text confidence does
//! (subject = normalized text). The fuser is owned by the pipeline's fusion
//! step; it is never shared between threads.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::{Catalog, CatalogMatch};
use crate::detect::RecognitionResult;
use crate::text;

pub const DEFAULT_REQUIRED_AGREEING: usize = 3;
pub const DEFAULT_DETECT_THRESHOLD: f32 = 0.8;
pub const DEFAULT_WINDOW_MAX_AGE: Duration = Duration::from_millis(800);
pub const DEFAULT_WINDOW_CAPACITY: usize = 8;
pub const DEFAULT_ACCUMULATE_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1000);

#[derive(Clone, Debug, PartialEq)]
pub struct FusionConfig {
    /// K: agreeing window entries needed to confirm.
    pub required_agreeing: usize,
    /// T_detect: minimum confidence for an observation to qualify.
    pub detect_threshold: f32,
    /// W: entries older than this (relative to the newest observation) are evicted.
    pub window_max_age: Duration,
    /// N: hard cap on window entries.
    pub window_capacity: usize,
    /// D: an accumulating episode with no qualifying result for this long is abandoned.
    pub accumulate_timeout: Duration,
    /// C: how long the stage must stay clear before a new episode may start.
    pub cooldown: Duration,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            required_agreeing: DEFAULT_REQUIRED_AGREEING,
            detect_threshold: DEFAULT_DETECT_THRESHOLD,
            window_max_age: DEFAULT_WINDOW_MAX_AGE,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            accumulate_timeout: DEFAULT_ACCUMULATE_TIMEOUT,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Joint output of both engines for one admitted frame.
#[derive(Clone, Debug)]
pub struct Observation {
    pub seq: u64,
    pub captured_at: Instant,
    /// Wall-clock capture time, epoch milliseconds.
    pub detected_at_ms: u64,
    pub text: RecognitionResult,
    pub classification: RecognitionResult,
}

/// Fused, stable scan result. Emitted at most once per episode.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfirmedScan {
    pub item_label: String,
    pub item_confidence: f32,
    /// Empty when no text was recognized (or the text engine is unavailable).
    pub extracted_text: String,
    /// Epoch milliseconds of the confirming frame.
    pub detected_at: u64,
    pub source_frame_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_match: Option<CatalogMatch>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusionState {
    Idle,
    Accumulating,
    Confirmed,
    Cooldown,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Subject {
    Label(String),
    Text(String),
}

// ----------------------------------------------------------------------------
// ConfirmationWindow
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct WindowEntry {
    seq: u64,
    at: Instant,
    subject: Subject,
    confidence: f32,
    text: Option<(String, f32)>,
}

#[derive(Clone, Debug, PartialEq)]
struct Vote {
    subject: Subject,
    count: usize,
    mean_confidence: f32,
}

/// Rolling buffer of qualifying frame-level results, evicted by age and count.
#[derive(Debug)]
pub struct ConfirmationWindow {
    entries: VecDeque<WindowEntry>,
    capacity: usize,
    max_age: Duration,
}

impl ConfirmationWindow {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries older than `max_age` relative to `now`.
    pub fn evict_expired(&mut self, now: Instant) {
        while let Some(oldest) = self.entries.front() {
            if now.saturating_duration_since(oldest.at) > self.max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn push(&mut self, entry: WindowEntry) {
        self.evict_expired(entry.at);
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Majority subject; ties go to higher mean confidence, then the most recent entry.
    fn majority(&self) -> Option<Vote> {
        struct Tally {
            count: usize,
            sum: f32,
            last_seq: u64,
        }
        let mut tallies: HashMap<&Subject, Tally> = HashMap::new();
        for entry in &self.entries {
            let tally = tallies.entry(&entry.subject).or_insert(Tally {
                count: 0,
                sum: 0.0,
                last_seq: 0,
            });
            tally.count += 1;
            tally.sum += entry.confidence;
            tally.last_seq = tally.last_seq.max(entry.seq);
        }

        tallies
            .into_iter()
            .map(|(subject, t)| (subject, t.count, t.sum / t.count as f32, t.last_seq))
            .max_by(|a, b| {
                a.1.cmp(&b.1)
                    .then(a.2.total_cmp(&b.2))
                    .then(a.3.cmp(&b.3))
            })
            .map(|(subject, count, mean_confidence, _)| Vote {
                subject: subject.clone(),
                count,
                mean_confidence,
            })
    }

    fn best_text(&self) -> Option<&str> {
        self.entries
            .iter()
            .filter_map(|e| e.text.as_ref())
            .filter(|(t, _)| !t.is_empty())
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(t, _)| t.as_str())
    }
}

// ----------------------------------------------------------------------------
// ResultFuser
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
enum Phase {
    Idle,
    Accumulating { last_qualifying: Instant },
    Confirmed { at: Instant },
    /// Left once nothing has qualified for `cooldown`.
    Cooldown { last_qualifying: Instant },
}

pub struct ResultFuser {
    config: FusionConfig,
    phase: Phase,
    window: ConfirmationWindow,
    catalog: Option<Arc<Catalog>>,
}

impl ResultFuser {
    pub fn new(config: FusionConfig) -> Self {
        let window = ConfirmationWindow::new(config.window_capacity, config.window_max_age);
        Self {
            config,
            phase: Phase::Idle,
            window,
            catalog: None,
        }
    }

    /// Attach a product catalog; confirmed scans then carry a catalog match.
    pub fn with_catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn state(&self) -> FusionState {
        match self.phase {
            Phase::Idle => FusionState::Idle,
            Phase::Accumulating { .. } => FusionState::Accumulating,
            Phase::Confirmed { .. } => FusionState::Confirmed,
            Phase::Cooldown { .. } => FusionState::Cooldown,
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Feed one joint observation. Returns the confirmed scan when this
    /// observation completes an episode.
    pub fn observe(&mut self, obs: &Observation) -> Option<ConfirmedScan> {
        let now = obs.captured_at;
        self.tick(now);
        if matches!(self.phase, Phase::Confirmed { .. }) {
            self.begin_cooldown();
        }

        let entry = self.qualify(obs);
        match self.phase {
            Phase::Idle => {
                let entry = entry?;
                self.window.clear();
                self.window.push(entry);
                self.phase = Phase::Accumulating {
                    last_qualifying: now,
                };
                self.try_confirm(obs)
            }
            Phase::Accumulating { .. } => {
                let entry = entry?;
                self.window.push(entry);
                self.phase = Phase::Accumulating {
                    last_qualifying: now,
                };
                self.try_confirm(obs)
            }
            Phase::Cooldown { .. } => {
                if entry.is_some() {
                    self.phase = Phase::Cooldown {
                        last_qualifying: now,
                    };
                }
                None
            }
            Phase::Confirmed { .. } => None,
        }
    }

    /// Apply time-based transitions (accumulation timeout, cooldown expiry)
    /// without a new observation.
    pub fn tick(&mut self, now: Instant) {
        match self.phase {
            Phase::Accumulating { last_qualifying } => {
                if now.saturating_duration_since(last_qualifying) >= self.config.accumulate_timeout {
                    log::debug!("fusion: episode abandoned before confirmation");
                    self.window.clear();
                    self.phase = Phase::Idle;
                } else {
                    self.window.evict_expired(now);
                }
            }
            Phase::Cooldown { last_qualifying } => {
                if now.saturating_duration_since(last_qualifying) >= self.config.cooldown {
                    log::debug!("fusion: cooldown elapsed, ready for next item");
                    self.phase = Phase::Idle;
                }
            }
            _ => {}
        }
    }

    /// `Confirmed -> Cooldown`. No-op in any other state.
    pub fn begin_cooldown(&mut self) {
        if let Phase::Confirmed { at } = self.phase {
            self.window.clear();
            self.phase = Phase::Cooldown {
                last_qualifying: at,
            };
        }
    }

    /// Drop all episode state (pipeline stop).
    pub fn reset(&mut self) {
        self.window.clear();
        self.phase = Phase::Idle;
    }

    fn qualify(&self, obs: &Observation) -> Option<WindowEntry> {
        let threshold = self.config.detect_threshold;
        let text = match &obs.text {
            RecognitionResult::Text { text: raw, confidence } => {
                let prepared = text::prepare(raw);
                (!prepared.is_empty()).then_some((prepared, *confidence))
            }
            _ => None,
        };

        let subject = match &obs.classification {
            RecognitionResult::Classification {
                label, confidence, ..
            } if *confidence >= threshold && !label.trim().is_empty() => {
                Some((Subject::Label(label.trim().to_lowercase()), *confidence))
            }
            _ => None,
        };

        let (subject, confidence) = match subject {
            Some(found) => found,
            None => match &text {
                Some((t, c)) if *c >= threshold => (Subject::Text(t.clone()), *c),
                _ => return None,
            },
        };

        Some(WindowEntry {
            seq: obs.seq,
            at: obs.captured_at,
            subject,
            confidence,
            text,
        })
    }

    fn try_confirm(&mut self, obs: &Observation) -> Option<ConfirmedScan> {
        let vote = self.window.majority()?;
        if vote.count < self.config.required_agreeing.max(1) {
            return None;
        }

        let extracted_text = self.window.best_text().unwrap_or_default().to_string();
        let catalog_match = self
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.match_text(&extracted_text));
        let item_label = match &vote.subject {
            Subject::Label(label) => label.clone(),
            Subject::Text(text) => catalog_match
                .as_ref()
                .map(|m| m.product_name.clone())
                .unwrap_or_else(|| text.clone()),
        };

        self.phase = Phase::Confirmed {
            at: obs.captured_at,
        };
        Some(ConfirmedScan {
            item_label,
            item_confidence: vote.mean_confidence,
            extracted_text,
            detected_at: obs.detected_at_ms,
            source_frame_seq: obs.seq,
            catalog_match,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Product;

    const FRAME_MS: u64 = 100;

    fn config() -> FusionConfig {
        FusionConfig {
            required_agreeing: 3,
            detect_threshold: 0.8,
            window_max_age: Duration::from_millis(400),
            window_capacity: 8,
            accumulate_timeout: Duration::from_millis(1000),
            cooldown: Duration::from_millis(500),
        }
    }

    struct Clock {
        base: Instant,
    }

    impl Clock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
            }
        }

        fn at(&self, seq: u64) -> Instant {
            self.base + Duration::from_millis(seq * FRAME_MS)
        }

        fn obs(&self, seq: u64, classification: RecognitionResult) -> Observation {
            self.obs_with_text(seq, classification, RecognitionResult::NoDetection)
        }

        fn obs_with_text(
            &self,
            seq: u64,
            classification: RecognitionResult,
            text: RecognitionResult,
        ) -> Observation {
            Observation {
                seq,
                captured_at: self.at(seq),
                detected_at_ms: 1_700_000_000_000 + seq * FRAME_MS,
                text,
                classification,
            }
        }
    }

    fn cls(label: &str, confidence: f32) -> RecognitionResult {
        RecognitionResult::classification(label, confidence)
    }

    #[test]
    fn confirms_after_k_agreeing_frames_then_cools_down() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        let confidences = [0.9, 0.92, 0.88, 0.91, 0.15];

        let mut confirmed = Vec::new();
        for (i, c) in confidences.iter().enumerate() {
            let seq = i as u64 + 1;
            let label = if seq <= 4 { "tomato" } else { "" };
            if let Some(scan) = fuser.observe(&clock.obs(seq, cls(label, *c))) {
                confirmed.push(scan);
                fuser.begin_cooldown();
            }
        }

        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].item_label, "tomato");
        assert_eq!(confirmed[0].source_frame_seq, 3);
        assert!((confirmed[0].item_confidence - (0.9 + 0.92 + 0.88) / 3.0).abs() < 1e-5);
        assert_eq!(fuser.state(), FusionState::Cooldown);

        // f4 was the last qualifying frame; C after it the fuser is idle.
        fuser.tick(clock.at(4) + Duration::from_millis(499));
        assert_eq!(fuser.state(), FusionState::Cooldown);
        fuser.tick(clock.at(4) + Duration::from_millis(500));
        assert_eq!(fuser.state(), FusionState::Idle);
    }

    #[test]
    fn same_item_kept_in_view_is_not_confirmed_twice() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        let mut count = 0;
        for seq in 1..=40 {
            if fuser.observe(&clock.obs(seq, cls("tomato", 0.95))).is_some() {
                count += 1;
                fuser.begin_cooldown();
            }
        }
        assert_eq!(count, 1);
        assert_eq!(fuser.state(), FusionState::Cooldown);
    }

    #[test]
    fn item_can_be_confirmed_again_after_leaving() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        let mut confirmations = Vec::new();
        // present 1..=4, absent 5..=11 (700ms > C), present again 12..=15
        for seq in 1..=15 {
            let c = if (5..=11).contains(&seq) { 0.1 } else { 0.9 };
            if let Some(scan) = fuser.observe(&clock.obs(seq, cls("tomato", c))) {
                confirmations.push(scan.source_frame_seq);
                fuser.begin_cooldown();
            }
        }
        assert_eq!(confirmations, vec![3, 14]);
    }

    #[test]
    fn brief_absence_during_cooldown_does_not_rearm() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        let mut count = 0;
        for seq in 1..=20 {
            // one dropout frame every 4 frames never adds up to C
            let c = if seq % 4 == 0 { 0.1 } else { 0.9 };
            if fuser.observe(&clock.obs(seq, cls("tomato", c))).is_some() {
                count += 1;
                fuser.begin_cooldown();
            }
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn single_frame_misreads_are_filtered() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        let labels = ["tomato", "potato", "onion", "tomato", "potato"];
        for (i, label) in labels.iter().enumerate() {
            let seq = i as u64 * 5 + 1; // 500ms apart, outside W
            assert!(fuser.observe(&clock.obs(seq, cls(label, 0.9))).is_none());
        }
    }

    #[test]
    fn entries_older_than_window_do_not_count() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        assert!(fuser.observe(&clock.obs(1, cls("tomato", 0.9))).is_none());
        assert!(fuser.observe(&clock.obs(2, cls("tomato", 0.9))).is_none());
        // 600ms later: f1 and f2 have aged out of the 400ms window
        assert!(fuser.observe(&clock.obs(8, cls("tomato", 0.9))).is_none());
        assert_eq!(fuser.window_len(), 1);
        assert!(fuser.observe(&clock.obs(9, cls("tomato", 0.9))).is_none());
        let scan = fuser.observe(&clock.obs(10, cls("tomato", 0.9))).unwrap();
        assert_eq!(scan.source_frame_seq, 10);
    }

    #[test]
    fn accumulation_times_out_to_idle() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        fuser.observe(&clock.obs(1, cls("tomato", 0.9)));
        fuser.observe(&clock.obs(2, cls("tomato", 0.9)));
        assert_eq!(fuser.state(), FusionState::Accumulating);

        fuser.tick(clock.at(2) + Duration::from_millis(1000));
        assert_eq!(fuser.state(), FusionState::Idle);
        assert_eq!(fuser.window_len(), 0);
    }

    #[test]
    fn window_capacity_bounds_entries() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(FusionConfig {
            required_agreeing: 10,
            window_capacity: 4,
            window_max_age: Duration::from_secs(10),
            accumulate_timeout: Duration::from_secs(10),
            ..config()
        });
        for seq in 1..=12 {
            let label = format!("item{}", seq % 6);
            fuser.observe(&clock.obs(seq, cls(&label, 0.9)));
        }
        assert_eq!(fuser.window_len(), 4);
    }

    #[test]
    fn majority_tie_prefers_higher_mean_confidence() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(FusionConfig {
            required_agreeing: 2,
            ..config()
        });
        assert!(fuser.observe(&clock.obs(1, cls("potato", 0.85))).is_none());
        // tomato reaches 2 on f3 while potato still has 1
        assert!(fuser.observe(&clock.obs(2, cls("tomato", 0.95))).is_none());
        let scan = fuser.observe(&clock.obs(3, cls("tomato", 0.9))).unwrap();
        assert_eq!(scan.item_label, "tomato");

        let mut window = ConfirmationWindow::new(8, Duration::from_secs(1));
        let now = Instant::now();
        for (seq, subject, conf) in [(1, "a", 0.9), (2, "b", 0.95), (3, "a", 0.9), (4, "b", 0.95)] {
            window.push(WindowEntry {
                seq,
                at: now,
                subject: Subject::Label(subject.into()),
                confidence: conf,
                text: None,
            });
        }
        assert_eq!(window.majority().unwrap().subject, Subject::Label("b".into()));
    }

    #[test]
    fn majority_full_tie_prefers_most_recent() {
        let mut window = ConfirmationWindow::new(8, Duration::from_secs(1));
        let now = Instant::now();
        for (seq, subject) in [(1, "a"), (2, "b"), (3, "b"), (4, "a")] {
            window.push(WindowEntry {
                seq,
                at: now,
                subject: Subject::Label(subject.into()),
                confidence: 0.9,
                text: None,
            });
        }
        assert_eq!(window.majority().unwrap().subject, Subject::Label("a".into()));
    }

    #[test]
    fn labels_are_compared_case_insensitively() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        fuser.observe(&clock.obs(1, cls("Tomato", 0.9)));
        fuser.observe(&clock.obs(2, cls("tomato ", 0.9)));
        let scan = fuser.observe(&clock.obs(3, cls("TOMATO", 0.9))).unwrap();
        assert_eq!(scan.item_label, "tomato");
    }

    #[test]
    fn extracted_text_is_highest_confidence_text() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        let texts = [("Neem 0il", 0.4), ("NEEM OIL", 0.9), ("neem", 0.6)];
        let mut scan = None;
        for (i, (t, c)) in texts.iter().enumerate() {
            let seq = i as u64 + 1;
            scan = fuser.observe(&clock.obs_with_text(
                seq,
                cls("bottle", 0.9),
                RecognitionResult::text(*t, *c),
            ));
        }
        let scan = scan.unwrap();
        assert_eq!(scan.extracted_text, "neem oil");
        assert_eq!(scan.item_label, "bottle");
    }

    #[test]
    fn text_only_episode_confirms_and_matches_catalog() {
        let clock = Clock::new();
        let catalog = Arc::new(Catalog::new(vec![Product {
            id: "p-neem".into(),
            name: "Neem Oil".into(),
        }]));
        let mut fuser = ResultFuser::new(config()).with_catalog(catalog);
        let mut scan = None;
        for seq in 1..=3 {
            scan = fuser.observe(&clock.obs_with_text(
                seq,
                RecognitionResult::NoDetection,
                RecognitionResult::text("Neem Oil 20% EC", 0.9),
            ));
        }
        let scan = scan.unwrap();
        assert_eq!(scan.item_label, "Neem Oil");
        assert_eq!(scan.extracted_text, "neem oil 20 ec");
        assert_eq!(scan.catalog_match.unwrap().product_id, "p-neem");
    }

    #[test]
    fn classifier_only_scan_has_empty_text() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        let mut scan = None;
        for seq in 1..=3 {
            scan = fuser.observe(&clock.obs(seq, cls("onion", 0.9)));
        }
        let scan = scan.unwrap();
        assert!(scan.extracted_text.is_empty());
        assert!(scan.catalog_match.is_none());
    }

    #[test]
    fn low_confidence_results_never_start_an_episode() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        for seq in 1..=10 {
            assert!(fuser.observe(&clock.obs(seq, cls("tomato", 0.79))).is_none());
        }
        assert_eq!(fuser.state(), FusionState::Idle);
    }

    #[test]
    fn observe_in_confirmed_state_enters_cooldown() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        for seq in 1..=3 {
            fuser.observe(&clock.obs(seq, cls("tomato", 0.9)));
        }
        assert_eq!(fuser.state(), FusionState::Confirmed);
        assert!(fuser.observe(&clock.obs(4, cls("tomato", 0.9))).is_none());
        assert_eq!(fuser.state(), FusionState::Cooldown);
    }

    #[test]
    fn cooldown_expires_on_ticks_alone() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        for seq in 1..=3 {
            if fuser.observe(&clock.obs(seq, cls("tomato", 0.9))).is_some() {
                fuser.begin_cooldown();
            }
        }
        assert_eq!(fuser.state(), FusionState::Cooldown);

        // Camera dark or stalled: no observations, only ticks.
        fuser.tick(clock.at(3) + Duration::from_millis(499));
        assert_eq!(fuser.state(), FusionState::Cooldown);
        fuser.tick(clock.at(3) + Duration::from_secs(60));
        assert_eq!(fuser.state(), FusionState::Idle);

        // The same item in view again is a new episode.
        let mut confirmed = Vec::new();
        for seq in 700..=702 {
            if let Some(scan) = fuser.observe(&clock.obs(seq, cls("tomato", 0.9))) {
                confirmed.push(scan.source_frame_seq);
            }
        }
        assert_eq!(confirmed, vec![702]);
    }

    #[test]
    fn qualifying_frame_after_long_gap_starts_new_episode() {
        let clock = Clock::new();
        let mut fuser = ResultFuser::new(config());
        for seq in 1..=3 {
            if fuser.observe(&clock.obs(seq, cls("tomato", 0.9))).is_some() {
                fuser.begin_cooldown();
            }
        }
        // No tick in between: the observation itself notices C has passed.
        assert!(fuser.observe(&clock.obs(20, cls("tomato", 0.9))).is_none());
        assert_eq!(fuser.state(), FusionState::Accumulating);
        assert_eq!(fuser.window_len(), 1);
    }
}
