//! kioskd - runs the kiosk recognition pipeline against the configured camera

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agrovision_kiosk::detect::EngineKind;
use agrovision_kiosk::ingest::open_source;
use agrovision_kiosk::{
    Catalog, KioskConfig, PendingScan, PipelineController, PipelineEvent, ScanStore,
    SqliteScanStore,
};

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
const STORE_RETRY_LIMIT: u32 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Frame source location (overrides config; e.g. stub://kiosk, /dev/video0).
    #[arg(long)]
    source: Option<String>,
    /// Stop after this many seconds (default: run until Ctrl-C).
    #[arg(long)]
    run_for_secs: Option<u64>,
    /// Print pipeline events to stdout as JSON lines.
    #[arg(long)]
    print_events: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = KioskConfig::load()?;
    if let Some(source) = args.source {
        cfg.source.location = source;
    }

    let catalog = match cfg.catalog_path.as_deref() {
        Some(path) => {
            let catalog = Catalog::load(path)?;
            log::info!("catalog loaded: {} products from {}", catalog.len(), path.display());
            Some(Arc::new(catalog))
        }
        None => None,
    };

    let mut maintenance = SqliteScanStore::open(&cfg.db_path)
        .with_context(|| format!("open scan store {}", cfg.db_path))?;
    enforce_retention(&mut maintenance, cfg.retention);
    let store = SqliteScanStore::open(&cfg.db_path)?;

    let text = cfg.text_engine.build(EngineKind::Text);
    let classifier = cfg.classifier_engine.build(EngineKind::Classifier);
    let mut controller =
        PipelineController::new(cfg.pipeline_config(catalog), text, classifier, store)?;
    let events = controller.events();

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = running.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        handler_running.store(false, Ordering::SeqCst);
    }) {
        log::warn!("failed to install Ctrl-C handler: {}", err);
    }

    let source = open_source(&cfg.source.location, cfg.source.target_fps)?;
    controller.start(source)?;
    log::info!(
        "kioskd running. source={} db={} confirm_frames={} threshold={:.2}",
        cfg.source.location,
        cfg.db_path,
        cfg.fusion.required_agreeing,
        cfg.fusion.detect_threshold
    );

    let deadline = args
        .run_for_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut last_health_log = Instant::now();
    let mut last_retention = Instant::now();
    let mut failed_writes: Vec<(PendingScan, u32)> = Vec::new();
    let mut failure: Option<String> = None;

    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::info!("run time elapsed");
            break;
        }

        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                if args.print_events {
                    println!("{}", serde_json::to_string(&event)?);
                }
                match event {
                    PipelineEvent::StoreFailed { pending, .. } => {
                        let attempts = failed_writes
                            .iter()
                            .find(|(p, _)| p.episode == pending.episode)
                            .map(|(_, n)| *n)
                            .unwrap_or(0);
                        failed_writes.retain(|(p, _)| p.episode != pending.episode);
                        if attempts < STORE_RETRY_LIMIT {
                            failed_writes.push((pending, attempts + 1));
                        } else {
                            log::error!(
                                "giving up on scan {} after {} retries",
                                pending.episode,
                                attempts
                            );
                        }
                    }
                    PipelineEvent::Stored { episode, .. } => {
                        failed_writes.retain(|(p, _)| p.episode != episode);
                    }
                    PipelineEvent::Failed { reason } => failure = Some(reason),
                    _ => {}
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if failure.is_some() {
            break;
        }

        if last_health_log.elapsed() >= HEALTH_INTERVAL {
            let stats = controller.stats();
            let source = stats.source.unwrap_or_default();
            log::info!(
                "source health={} captured={} admitted={} dropped={} confirmed={} stored={} store_failures={} low_light={} timeouts={}",
                stats.source_healthy,
                source.frames_captured,
                stats.frames_admitted,
                stats.frames_dropped,
                stats.confirmed,
                stats.stored,
                stats.store_failures,
                stats.low_light_frames,
                stats.engine_timeouts
            );
            for (pending, attempts) in &failed_writes {
                log::info!("retrying scan {} (attempt {})", pending.episode, attempts);
                controller.retry_store(pending.clone())?;
            }
            last_health_log = Instant::now();
        }

        if last_retention.elapsed() >= RETENTION_INTERVAL {
            enforce_retention(&mut maintenance, cfg.retention);
            last_retention = Instant::now();
        }
    }

    log::info!("shutting down pipeline...");
    controller.stop()?;
    match failure {
        Some(reason) => Err(anyhow!("pipeline failed: {}", reason)),
        None => Ok(()),
    }
}

fn enforce_retention(store: &mut SqliteScanStore, retention: Duration) {
    match store.enforce_retention(retention) {
        Ok(0) => {}
        Ok(deleted) => log::info!("retention removed {} scan records", deleted),
        Err(err) => log::warn!("retention pass failed: {}", err),
    }
}
