//! Synthetic kiosk source (`stub://`).
//!
//! Alternates between an empty stage (flat background) and an item on the
//! stage (high-contrast stripes whose brightness identifies the item), holding
//! each scene for `scene_frames` frames. `stub://dark` renders every scene
//! under-exposed, for exercising the low-light gate.

use anyhow::Result;
use std::time::{Duration, Instant};

use super::{FrameSource, ReleaseCounter, SourceStats};
use crate::frame::{Frame, PixelFormat};

const ITEM_VARIANTS: u64 = 4;
const BACKGROUND: u8 = 128;
const STRIPE_WIDTH: u32 = 8;
const STRIPE_SPAN: u8 = 60;
const DARK_DIVISOR: u8 = 6;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// 0 = produce frames as fast as they are pulled.
    pub target_fps: u32,
    pub scene_frames: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://kiosk".to_string(),
            width: 320,
            height: 240,
            target_fps: 10,
            scene_frames: 30,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    dark: bool,
    frame_count: u64,
    next_due: Option<Instant>,
    released: ReleaseCounter,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let dark = config.name == "stub://dark";
        Self {
            config,
            dark,
            frame_count: 0,
            next_due: None,
            released: ReleaseCounter::default(),
        }
    }

    /// Item variant on stage for the given frame, `None` while the stage is empty.
    pub fn item_at(&self, seq: u64) -> Option<u64> {
        let scene = seq.saturating_sub(1) / self.config.scene_frames.max(1);
        (scene % 2 == 1).then_some((scene / 2) % ITEM_VARIANTS)
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_secs(1) / self.config.target_fps;
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(self.next_due.unwrap_or(now).max(now) + interval);
    }

    fn render(&self, seq: u64) -> Vec<u8> {
        let (w, h) = (self.config.width, self.config.height);
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        let item = self.item_at(seq);
        for _y in 0..h {
            for x in 0..w {
                let value = match item {
                    None => BACKGROUND,
                    Some(variant) => {
                        let low = 40 + (variant as u8) * 40;
                        if (x / STRIPE_WIDTH) % 2 == 0 {
                            low
                        } else {
                            low + STRIPE_SPAN
                        }
                    }
                };
                let value = if self.dark { value / DARK_DIVISOR } else { value };
                pixels.extend_from_slice(&[value, value, value]);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {} (synthetic)", self.config.name);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.pace();
        self.frame_count += 1;
        let seq = self.frame_count;
        let frame = Frame::new(
            seq,
            self.config.width,
            self.config.height,
            PixelFormat::Rgb8,
            self.render(seq),
        )?
        .with_release_hook(self.released.hook());
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            frames_released: self.released.get(),
            source: self.config.name.clone(),
        }
    }
}
