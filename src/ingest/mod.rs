//! Frame ingestion sources.
//!
//! - Synthetic kiosk scenes (`stub://`), for demos and tests
//! - Scripted frame lists, for replay and pipeline tests
//! - Directories of still images (feature: ingest-image)
//! - USB/V4L2 cameras (feature: ingest-v4l2)
//!
//! Sources hand frames to the pipeline and learn when the pipeline is done with
//! each one through the frame's release hook.
//!
//! The ingestion layer MUST NOT:
//! - Store raw frames to disk
//! - Transmit raw frames over network
//! - Log raw frame content

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::frame::{Frame, ReleaseHook};

#[cfg(feature = "ingest-image")]
pub mod image_dir;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod scripted;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

#[cfg(feature = "ingest-image")]
pub use image_dir::ImageDirSource;
pub use scripted::ScriptedSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// A camera (or camera-like) frame producer.
pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available. `Ok(None)` means end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub frames_captured: u64,
    /// Frames the pipeline has signalled it is done with.
    pub frames_released: u64,
    pub source: String,
}

/// Counts release signals for frames handed out by a source.
#[derive(Clone, Debug, Default)]
pub struct ReleaseCounter {
    released: Arc<AtomicU64>,
}

impl ReleaseCounter {
    pub fn hook(&self) -> ReleaseHook {
        let released = self.released.clone();
        Box::new(move |_seq| {
            released.fetch_add(1, Ordering::Relaxed);
        })
    }

    pub fn get(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

/// Build a source from its configured location.
///
/// - `stub://<name>`: synthetic kiosk scenes
/// - `/dev/video*`: V4L2 camera (feature: ingest-v4l2)
/// - any other local path: directory of still images (feature: ingest-image)
pub fn open_source(location: &str, target_fps: u32) -> Result<Box<dyn FrameSource>> {
    if location.trim().is_empty() {
        return Err(anyhow!("frame source location is empty"));
    }
    if location.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            name: location.to_string(),
            target_fps,
            ..SyntheticConfig::default()
        })));
    }
    if location.contains("://") {
        return Err(anyhow!(
            "frame source {} is not local; only local cameras and directories are supported",
            location
        ));
    }
    if location.starts_with("/dev/video") {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Box::new(V4l2Source::new(V4l2Config {
                device: location.to_string(),
                target_fps,
                ..V4l2Config::default()
            })?));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!("camera {} requires the ingest-v4l2 feature", location));
        }
    }
    #[cfg(feature = "ingest-image")]
    {
        Ok(Box::new(ImageDirSource::new(location, target_fps)?))
    }
    #[cfg(not(feature = "ingest-image"))]
    {
        Err(anyhow!(
            "image directory source {} requires the ingest-image feature",
            location
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_locations_open_synthetic_source() -> Result<()> {
        let mut source = open_source("stub://kiosk", 0)?;
        source.connect()?;
        assert!(source.next_frame()?.is_some());
        assert_eq!(source.stats().source, "stub://kiosk");
        Ok(())
    }

    #[test]
    fn network_locations_are_rejected() {
        assert!(open_source("rtsp://camera/stream", 10).is_err());
        assert!(open_source("  ", 10).is_err());
    }

    #[test]
    fn release_counter_counts_hook_calls() {
        let counter = ReleaseCounter::default();
        let hook = counter.hook();
        hook(4);
        assert_eq!(counter.get(), 1);
    }
}
