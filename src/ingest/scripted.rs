use anyhow::Result;
use std::collections::VecDeque;
use std::time::Duration;

use super::{FrameSource, ReleaseCounter, SourceStats};
use crate::frame::Frame;

/// Replays a fixed list of frames, optionally paced, then reports end of stream.
pub struct ScriptedSource {
    name: String,
    frames: VecDeque<Frame>,
    interval: Duration,
    captured: u64,
    connected: bool,
    released: ReleaseCounter,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        let released = ReleaseCounter::default();
        let frames = frames
            .into_iter()
            .map(|frame| frame.with_release_hook(released.hook()))
            .collect();
        Self {
            name: "scripted".to_string(),
            frames,
            interval: Duration::ZERO,
            captured: 0,
            connected: false,
            released,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sleep this long before handing out each frame.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ScriptedSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("ScriptedSource: {} frames queued from {}", self.frames.len(), self.name);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.interval.is_zero() && !self.frames.is_empty() {
            std::thread::sleep(self.interval);
        }
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.captured += 1;
        }
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.captured,
            frames_released: self.released.get(),
            source: self.name.clone(),
        }
    }
}
