//! Kiosk USB camera over V4L2.
//!
//! Buffers are mmapped from the driver and converted to packed RGB in memory.
//! Nothing is written to disk and a converted frame lives only until the
//! pipeline releases it.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{to_rgb24, CaptureLayout};
use super::{FrameSource, ReleaseCounter, SourceStats};
use crate::frame::{Frame, PixelFormat};

const MMAP_BUFFERS: u32 = 4;
const STALL_FRAMES: u32 = 6;
const MIN_STALL: Duration = Duration::from_secs(2);
/// Capture errors in a row before the camera is reported unhealthy.
const MAX_CAPTURE_ERRORS: u32 = 3;

#[derive(Clone, Debug)]
pub struct V4l2Config {
    pub device: String,
    pub target_fps: u32,
    /// Requested capture size; the driver may pick another.
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

#[self_referencing]
struct Capture {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// Size and layout the driver agreed to.
#[derive(Clone, Copy, Debug)]
struct Negotiated {
    width: u32,
    height: u32,
    layout: CaptureLayout,
}

pub struct V4l2Source {
    config: V4l2Config,
    capture: Option<Capture>,
    negotiated: Option<Negotiated>,
    seq: u64,
    last_capture: Option<Instant>,
    capture_errors: u32,
    released: ReleaseCounter,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!(
                "camera {}: capture size must be non-zero",
                config.device
            ));
        }
        Ok(Self {
            config,
            capture: None,
            negotiated: None,
            seq: 0,
            last_capture: None,
            capture_errors: 0,
            released: ReleaseCounter::default(),
        })
    }

    /// Longest gap between frames before the camera counts as stalled.
    fn stall_after(&self) -> Duration {
        match self.config.target_fps {
            0 => MIN_STALL,
            fps => (Duration::from_secs(1) / fps * STALL_FRAMES).max(MIN_STALL),
        }
    }

    fn negotiate(&self, device: &mut v4l::Device) -> Result<Negotiated> {
        use v4l::video::Capture as _;

        let mut wanted = device.format().context("read camera format")?;
        wanted.width = self.config.width;
        wanted.height = self.config.height;
        wanted.fourcc = v4l::FourCC::new(b"RGB3");

        let format = device.set_format(&wanted).or_else(|err| {
            log::warn!(
                "camera {} refused {}x{} RGB3 ({}); keeping driver format",
                self.config.device,
                self.config.width,
                self.config.height,
                err
            );
            device.format().context("read camera format")
        })?;
        let layout = CaptureLayout::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "camera {} delivers unsupported pixel format {}",
                self.config.device,
                format.fourcc
            )
        })?;
        Ok(Negotiated {
            width: format.width,
            height: format.height,
            layout,
        })
    }

    fn request_frame_rate(&self, device: &v4l::Device) {
        use v4l::video::Capture as _;

        if self.config.target_fps == 0 {
            return;
        }
        let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!(
                "camera {} ignored {} fps request: {}",
                self.config.device,
                self.config.target_fps,
                err
            );
        }
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        self.capture = None;
        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open camera {}", self.config.device))?;
        let negotiated = self.negotiate(&mut device)?;
        self.request_frame_rate(&device);

        let capture = CaptureTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(
                    device,
                    v4l::buffer::Type::VideoCapture,
                    MMAP_BUFFERS,
                )
                .context("map camera buffers")
            },
        }
        .try_build()?;

        log::info!(
            "camera {} streaming {}x{} {:?}",
            self.config.device,
            negotiated.width,
            negotiated.height,
            negotiated.layout
        );
        self.capture = Some(capture);
        self.negotiated = Some(negotiated);
        self.capture_errors = 0;
        self.last_capture = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let (Some(capture), Some(negotiated)) = (self.capture.as_mut(), self.negotiated) else {
            return Err(anyhow!("camera {} is not connected", self.config.device));
        };
        let pixels = match capture.with_stream_mut(|stream| stream.next()) {
            Ok((buf, _meta)) => to_rgb24(buf, negotiated.width, negotiated.height, negotiated.layout),
            Err(err) => Err(anyhow::Error::new(err).context("dequeue camera buffer")),
        };
        let pixels = match pixels {
            Ok(pixels) => pixels,
            Err(err) => {
                self.capture_errors = self.capture_errors.saturating_add(1);
                return Err(err);
            }
        };

        self.capture_errors = 0;
        self.seq += 1;
        self.last_capture = Some(Instant::now());
        let frame = Frame::new(
            self.seq,
            negotiated.width,
            negotiated.height,
            PixelFormat::Rgb8,
            pixels,
        )?
        .with_release_hook(self.released.hook());
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        if self.capture_errors >= MAX_CAPTURE_ERRORS {
            return false;
        }
        self.last_capture
            .map_or(true, |at| at.elapsed() <= self.stall_after())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.seq,
            frames_released: self.released.get(),
            source: self.config.device.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capture_size() {
        let config = V4l2Config {
            height: 0,
            ..V4l2Config::default()
        };
        assert!(V4l2Source::new(config).is_err());
    }

    #[test]
    fn stall_window_never_below_two_seconds() -> Result<()> {
        let fast = V4l2Source::new(V4l2Config {
            target_fps: 30,
            ..V4l2Config::default()
        })?;
        assert_eq!(fast.stall_after(), MIN_STALL);

        let slow = V4l2Source::new(V4l2Config {
            target_fps: 1,
            ..V4l2Config::default()
        })?;
        assert_eq!(slow.stall_after(), Duration::from_secs(6));
        Ok(())
    }

    #[test]
    fn reading_before_connect_fails() -> Result<()> {
        let mut source = V4l2Source::new(V4l2Config {
            device: "/dev/video-missing".to_string(),
            ..V4l2Config::default()
        })?;
        assert!(source.connect().is_err());
        assert!(source.next_frame().is_err());
        assert_eq!(source.stats().frames_captured, 0);
        Ok(())
    }
}
