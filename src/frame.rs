//! Captured frame handles.
//!
//! - `Frame`: immutable handle to one camera image. Pixel bytes are private.
//! - `FrameView`: read-only view handed to inference engines.
//!
//! A frame is shared (`Arc<Frame>`) by both engine workers during a single
//! pipeline pass and is released as soon as the pass completes or is
//! superseded. Once released, new views fail with `EngineError::InvalidFrame`.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use zeroize::Zeroize;

use crate::detect::EngineError;

/// Callback the frame source registers to learn when the pipeline is done with a frame.
/// Receives the frame sequence number.
pub type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured image plus capture metadata.
///
/// There is no `Clone` and no public byte accessor; engines read pixels through
/// `FrameView`, which is only handed out while the frame is live.
///
/// ```compile_fail
/// fn leak(frame: &agrovision_kiosk::Frame) -> &[u8] {
///     &frame.data
/// }
/// ```
///
/// ```compile_fail
/// fn assert_clone<T: Clone>() {}
/// assert_clone::<agrovision_kiosk::Frame>();
/// ```
///
/// Frames cannot be serialized, so pixels never reach an event or the store.
///
/// ```compile_fail
/// fn assert_serialize<T: serde::Serialize>() {}
/// assert_serialize::<agrovision_kiosk::Frame>();
/// ```
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Capture sequence number assigned by the source (monotonic per source).
    pub seq: u64,

    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,

    /// Monotonic capture instant (window ageing, never exported).
    captured_at: Instant,

    released: AtomicBool,
    release_hook: Mutex<Option<ReleaseHook>>,
}

impl Frame {
    /// Wrap captured pixels. The buffer length must match the dimensions and format.
    pub fn new(
        seq: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(format.channels()))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {} length mismatch: expected {} bytes for {}x{} {:?}, got {}",
                seq,
                expected,
                width,
                height,
                format,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            seq,
            timestamp_ms: crate::now_ms(),
            captured_at: Instant::now(),
            released: AtomicBool::new(false),
            release_hook: Mutex::new(None),
        })
    }

    /// Override capture times (replayed or scripted streams).
    pub fn with_capture_time(mut self, captured_at: Instant, timestamp_ms: u64) -> Self {
        self.captured_at = captured_at;
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Register the source's release signal. Fires exactly once.
    pub fn with_release_hook(self, hook: ReleaseHook) -> Self {
        if let Ok(mut slot) = self.release_hook.lock() {
            *slot = Some(hook);
        }
        self
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Read-only view for inference. Fails once the frame has been released.
    pub fn view(&self) -> std::result::Result<FrameView<'_>, EngineError> {
        if self.is_released() {
            return Err(EngineError::InvalidFrame);
        }
        Ok(FrameView { frame: self })
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Signal that the pipeline is done with this frame.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.fire_release_hook();
    }

    /// Mean luma on a 0..=255 scale, sampled on a coarse grid.
    pub fn mean_luminance(&self) -> f32 {
        mean_luminance(&self.data, self.format)
    }

    /// SHA-256 of the pixel buffer, hex encoded. Safe to log.
    pub fn digest_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.data))
    }

    fn fire_release_hook(&self) {
        let hook = match self.release_hook.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(hook) = hook {
            hook(self.seq);
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.fire_release_hook();
        self.data.zeroize();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("released", &self.is_released())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameView
// ----------------------------------------------------------------------------

/// Read-only view of a live frame.
pub struct FrameView<'a> {
    frame: &'a Frame,
}

impl<'a> FrameView<'a> {
    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    pub fn format(&self) -> PixelFormat {
        self.frame.format
    }

    pub fn seq(&self) -> u64 {
        self.frame.seq
    }

    pub fn pixels(&self) -> &'a [u8] {
        &self.frame.data
    }

    /// Long-running engines poll this to abandon work on a cancelled pass.
    pub fn is_released(&self) -> bool {
        self.frame.is_released()
    }
}

fn mean_luminance(data: &[u8], format: PixelFormat) -> f32 {
    const SAMPLE_STEP: usize = 7;

    let channels = format.channels();
    let pixel_count = data.len() / channels;
    if pixel_count == 0 {
        return 0.0;
    }

    let mut sum = 0f64;
    let mut samples = 0u64;
    for px in (0..pixel_count).step_by(SAMPLE_STEP) {
        let offset = px * channels;
        let luma = match format {
            PixelFormat::Gray8 => data[offset] as f64,
            PixelFormat::Rgb8 => {
                0.299 * data[offset] as f64
                    + 0.587 * data[offset + 1] as f64
                    + 0.114 * data[offset + 2] as f64
            }
        };
        sum += luma;
        samples += 1;
    }
    (sum / samples as f64) as f32
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
