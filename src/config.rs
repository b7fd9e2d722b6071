use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::detect::{EngineKind, InferenceEngine, StubEngine, UnavailableEngine};
use crate::fusion::FusionConfig;
use crate::pipeline::PipelineConfig;

const DEFAULT_DB_PATH: &str = "agrovision.db";
const DEFAULT_SOURCE: &str = "stub://kiosk";
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 30;
const DEFAULT_CLASSIFIER_INPUT: (u32, u32) = (224, 224);
const DEFAULT_TEXT_INPUT: (u32, u32) = (160, 32);
const DEFAULT_CHARSET: &str = "0123456789abcdefghijklmnopqrstuvwxyz%.- ";
const DEFAULT_STUB_LABELS: &[&str] = &["tomato", "potato", "onion", "chili", "maize"];
const DEFAULT_STUB_TEXTS: &[&str] = &["neem oil", "mancozeb 75 wp", "urea 46", "dap 18 46"];
const MAX_TARGET_FPS: u32 = 60;

#[derive(Debug, Deserialize, Default)]
struct KioskConfigFile {
    db_path: Option<String>,
    catalog_path: Option<PathBuf>,
    source: Option<SourceConfigFile>,
    engines: Option<EnginesConfigFile>,
    fusion: Option<FusionConfigFile>,
    timeouts: Option<TimeoutsConfigFile>,
    store: Option<StoreConfigFile>,
    lighting: Option<LightingConfigFile>,
    retention: Option<RetentionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    location: Option<String>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct EnginesConfigFile {
    text: Option<EngineConfigFile>,
    classifier: Option<EngineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    backend: Option<EngineBackend>,
    model_path: Option<PathBuf>,
    labels: Option<Vec<String>>,
    charset: Option<String>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FusionConfigFile {
    confirm_frames: Option<usize>,
    detect_threshold: Option<f32>,
    window_ms: Option<u64>,
    window_capacity: Option<usize>,
    accumulate_timeout_ms: Option<u64>,
    cooldown_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TimeoutsConfigFile {
    text_ms: Option<u64>,
    classifier_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct LightingConfigFile {
    min_luminance: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    seconds: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineBackend {
    /// Deterministic stand-in driven by frame brightness and texture.
    Stub,
    /// ONNX model run with tract (feature: backend-tract).
    Tract,
    /// Engine switched off; the pipeline runs degraded without it.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backend: EngineBackend,
    pub model_path: Option<PathBuf>,
    /// Classifier output labels (stub: candidate labels).
    pub labels: Vec<String>,
    /// Recognizer charset (stub: candidate texts, one per `|`).
    pub charset: String,
    pub input_width: u32,
    pub input_height: u32,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub location: String,
    pub target_fps: u32,
}

#[derive(Debug, Clone)]
pub struct KioskConfig {
    pub db_path: String,
    pub catalog_path: Option<PathBuf>,
    pub source: SourceSettings,
    pub text_engine: EngineSettings,
    pub classifier_engine: EngineSettings,
    pub fusion: FusionConfig,
    pub text_timeout: Duration,
    pub classifier_timeout: Duration,
    pub store_retry_backoff: Duration,
    pub min_luminance: f32,
    pub retention: Duration,
}

impl KioskConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AGROVISION_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: KioskConfigFile) -> Self {
        let pipeline = PipelineConfig::default();
        let defaults = FusionConfig::default();

        let source = file.source.unwrap_or_default();
        let engines = file.engines.unwrap_or_default();
        let fusion = file.fusion.unwrap_or_default();
        let timeouts = file.timeouts.unwrap_or_default();

        let ms_or = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            catalog_path: file.catalog_path,
            source: SourceSettings {
                location: source.location.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                target_fps: source.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            },
            text_engine: engine_settings(engines.text.unwrap_or_default(), EngineKind::Text),
            classifier_engine: engine_settings(
                engines.classifier.unwrap_or_default(),
                EngineKind::Classifier,
            ),
            fusion: FusionConfig {
                required_agreeing: fusion.confirm_frames.unwrap_or(defaults.required_agreeing),
                detect_threshold: fusion.detect_threshold.unwrap_or(defaults.detect_threshold),
                window_max_age: ms_or(fusion.window_ms, defaults.window_max_age),
                window_capacity: fusion.window_capacity.unwrap_or(defaults.window_capacity),
                accumulate_timeout: ms_or(
                    fusion.accumulate_timeout_ms,
                    defaults.accumulate_timeout,
                ),
                cooldown: ms_or(fusion.cooldown_ms, defaults.cooldown),
            },
            text_timeout: ms_or(timeouts.text_ms, pipeline.text_timeout),
            classifier_timeout: ms_or(timeouts.classifier_ms, pipeline.classifier_timeout),
            store_retry_backoff: ms_or(
                file.store.and_then(|store| store.retry_backoff_ms),
                pipeline.store_retry_backoff,
            ),
            min_luminance: file
                .lighting
                .and_then(|lighting| lighting.min_luminance)
                .unwrap_or(pipeline.min_luminance),
            retention: Duration::from_secs(
                file.retention
                    .and_then(|retention| retention.seconds)
                    .unwrap_or(DEFAULT_RETENTION_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("AGROVISION_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(location) = std::env::var("AGROVISION_SOURCE") {
            if !location.trim().is_empty() {
                self.source.location = location;
            }
        }
        if let Ok(model) = std::env::var("AGROVISION_TEXT_MODEL") {
            if !model.trim().is_empty() {
                self.text_engine.backend = EngineBackend::Tract;
                self.text_engine.model_path = Some(PathBuf::from(model));
            }
        }
        if let Ok(model) = std::env::var("AGROVISION_CLASSIFIER_MODEL") {
            if !model.trim().is_empty() {
                self.classifier_engine.backend = EngineBackend::Tract;
                self.classifier_engine.model_path = Some(PathBuf::from(model));
            }
        }
        if let Ok(frames) = std::env::var("AGROVISION_CONFIRM_FRAMES") {
            self.fusion.required_agreeing = frames.trim().parse().map_err(|_| {
                anyhow!("AGROVISION_CONFIRM_FRAMES must be a positive integer")
            })?;
        }
        if let Ok(threshold) = std::env::var("AGROVISION_DETECT_THRESHOLD") {
            self.fusion.detect_threshold = threshold.trim().parse().map_err(|_| {
                anyhow!("AGROVISION_DETECT_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        if let Ok(retention) = std::env::var("AGROVISION_RETENTION_SECS") {
            let seconds: u64 = retention.trim().parse().map_err(|_| {
                anyhow!("AGROVISION_RETENTION_SECS must be an integer number of seconds")
            })?;
            self.retention = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let fusion = &self.fusion;
        if fusion.required_agreeing == 0 {
            return Err(anyhow!("fusion.confirm_frames must be at least 1"));
        }
        if fusion.window_capacity < fusion.required_agreeing {
            return Err(anyhow!(
                "fusion.window_capacity ({}) must be >= fusion.confirm_frames ({})",
                fusion.window_capacity,
                fusion.required_agreeing
            ));
        }
        if !(fusion.detect_threshold > 0.0 && fusion.detect_threshold <= 1.0) {
            return Err(anyhow!("fusion.detect_threshold must be in (0, 1]"));
        }
        for (name, value) in [
            ("fusion.window_ms", fusion.window_max_age),
            ("fusion.accumulate_timeout_ms", fusion.accumulate_timeout),
            ("fusion.cooldown_ms", fusion.cooldown),
            ("timeouts.text_ms", self.text_timeout),
            ("timeouts.classifier_ms", self.classifier_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.source.target_fps > MAX_TARGET_FPS {
            return Err(anyhow!(
                "source.target_fps must be at most {}",
                MAX_TARGET_FPS
            ));
        }
        if !(0.0..=255.0).contains(&self.min_luminance) {
            return Err(anyhow!("lighting.min_luminance must be within 0..=255"));
        }
        if self.retention.as_secs() == 0 {
            return Err(anyhow!("retention must be greater than zero"));
        }
        validate_engine("engines.text", &self.text_engine, EngineKind::Text)?;
        validate_engine(
            "engines.classifier",
            &self.classifier_engine,
            EngineKind::Classifier,
        )?;
        Ok(())
    }

    pub fn pipeline_config(&self, catalog: Option<Arc<Catalog>>) -> PipelineConfig {
        PipelineConfig {
            fusion: self.fusion.clone(),
            text_timeout: self.text_timeout,
            classifier_timeout: self.classifier_timeout,
            store_retry_backoff: self.store_retry_backoff,
            min_luminance: self.min_luminance,
            catalog,
            ..PipelineConfig::default()
        }
    }
}

impl EngineSettings {
    /// Instantiate the engine. Configurations that cannot run here (tract
    /// without the feature, disabled engines) produce an engine that reports
    /// `ModelUnavailable` at warm-up, so the pipeline starts degraded.
    pub fn build(&self, kind: EngineKind) -> Box<dyn InferenceEngine> {
        match self.backend {
            EngineBackend::Stub => match kind {
                EngineKind::Classifier => Box::new(StubEngine::classifier(self.labels.clone())),
                EngineKind::Text => Box::new(StubEngine::text_recognizer(
                    split_list(&self.charset, '|'),
                )),
            },
            EngineBackend::Disabled => Box::new(UnavailableEngine::new(
                kind,
                format!("{} engine disabled by configuration", kind),
            )),
            EngineBackend::Tract => self.build_tract(kind),
        }
    }

    #[cfg(feature = "backend-tract")]
    fn build_tract(&self, kind: EngineKind) -> Box<dyn InferenceEngine> {
        use crate::detect::{TractClassifier, TractTextRecognizer};

        let Some(model_path) = self.model_path.as_ref() else {
            return Box::new(UnavailableEngine::new(kind, "no model_path configured"));
        };
        match kind {
            EngineKind::Classifier => Box::new(TractClassifier::new(
                model_path,
                self.labels.clone(),
                self.input_width,
                self.input_height,
            )),
            EngineKind::Text => Box::new(TractTextRecognizer::new(
                model_path,
                &self.charset,
                self.input_width,
                self.input_height,
            )),
        }
    }

    #[cfg(not(feature = "backend-tract"))]
    fn build_tract(&self, kind: EngineKind) -> Box<dyn InferenceEngine> {
        Box::new(UnavailableEngine::new(
            kind,
            "built without the backend-tract feature",
        ))
    }
}

fn engine_settings(file: EngineConfigFile, kind: EngineKind) -> EngineSettings {
    let backend = file.backend.unwrap_or(if file.model_path.is_some() {
        EngineBackend::Tract
    } else {
        EngineBackend::Stub
    });
    let (default_w, default_h) = match kind {
        EngineKind::Classifier => DEFAULT_CLASSIFIER_INPUT,
        EngineKind::Text => DEFAULT_TEXT_INPUT,
    };
    let charset = file.charset.unwrap_or_else(|| match (kind, backend) {
        (EngineKind::Text, EngineBackend::Stub) => DEFAULT_STUB_TEXTS.join("|"),
        _ => DEFAULT_CHARSET.to_string(),
    });
    let labels = file.labels.unwrap_or_else(|| match (kind, backend) {
        (EngineKind::Classifier, EngineBackend::Stub) => {
            DEFAULT_STUB_LABELS.iter().map(|l| l.to_string()).collect()
        }
        _ => Vec::new(),
    });
    EngineSettings {
        backend,
        model_path: file.model_path,
        labels,
        charset,
        input_width: file.input_width.unwrap_or(default_w),
        input_height: file.input_height.unwrap_or(default_h),
    }
}

fn validate_engine(name: &str, engine: &EngineSettings, kind: EngineKind) -> Result<()> {
    if engine.backend != EngineBackend::Tract {
        return Ok(());
    }
    if engine.model_path.is_none() {
        return Err(anyhow!("{}: tract backend requires model_path", name));
    }
    if engine.input_width == 0 || engine.input_height == 0 {
        return Err(anyhow!("{}: input size must be non-zero", name));
    }
    match kind {
        EngineKind::Classifier if engine.labels.is_empty() => {
            Err(anyhow!("{}: tract classifier requires labels", name))
        }
        EngineKind::Text if engine.charset.is_empty() => {
            Err(anyhow!("{}: tract text recognizer requires a charset", name))
        }
        _ => Ok(()),
    }
}

fn read_config_file(path: &Path) -> Result<KioskConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
