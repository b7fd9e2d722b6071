//! Still-image directory source.
//!
//! Replays `.jpg`/`.jpeg`/`.png` files from a local directory in file name
//! order, decoding each to RGB in memory. Useful for bench testing a kiosk
//! without a camera attached.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::{FrameSource, ReleaseCounter, SourceStats};
use crate::frame::{Frame, PixelFormat};

pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    interval: Duration,
    next_due: Option<Instant>,
    frame_count: u64,
    last_error: Option<String>,
    released: ReleaseCounter,
}

impl ImageDirSource {
    pub fn new<P: AsRef<Path>>(dir: P, target_fps: u32) -> Result<Self> {
        let interval = if target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / target_fps
        };
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            files: Vec::new(),
            cursor: 0,
            interval,
            next_due: None,
            frame_count: 0,
            last_error: None,
            released: ReleaseCounter::default(),
        })
    }

    fn pace(&mut self) {
        if self.interval.is_zero() {
            return;
        }
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(self.next_due.unwrap_or(now).max(now) + self.interval);
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

fn decode(path: &Path) -> Result<(u32, u32, Vec<u8>)> {
    let image = image::open(path).with_context(|| format!("decode {}", path.display()))?;
    let (width, height) = image.dimensions();
    Ok((width, height, image.into_rgb8().into_raw()))
}

impl FrameSource for ImageDirSource {
    fn connect(&mut self) -> Result<()> {
        let mut files = std::fs::read_dir(&self.dir)
            .with_context(|| format!("read image directory {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image(path))
            .collect::<Vec<_>>();
        files.sort();
        if files.is_empty() {
            return Err(anyhow!("no images found in {}", self.dir.display()));
        }
        log::info!(
            "ImageDirSource: {} images in {}",
            files.len(),
            self.dir.display()
        );
        self.files = files;
        self.cursor = 0;
        self.last_error = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;
        self.pace();

        let (width, height, rgb) = decode(&path).map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.frame_count += 1;
        let frame = Frame::new(self.frame_count, width, height, PixelFormat::Rgb8, rgb)?
            .with_release_hook(self.released.hook());
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            frames_released: self.released.get(),
            source: self.dir.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_images_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for (name, value) in [("b.png", 200u8), ("a.png", 50u8)] {
            let img = image::RgbImage::from_pixel(4, 2, image::Rgb([value, value, value]));
            img.save(dir.path().join(name))?;
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored")?;

        let mut source = ImageDirSource::new(dir.path(), 0)?;
        source.connect()?;
        let first = source.next_frame()?.unwrap();
        assert_eq!((first.width, first.height), (4, 2));
        assert!(first.mean_luminance() < 60.0);
        let second = source.next_frame()?.unwrap();
        assert!(second.mean_luminance() > 190.0);
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }

    #[test]
    fn empty_directory_fails_to_connect() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut source = ImageDirSource::new(dir.path(), 10)?;
        assert!(source.connect().is_err());
        Ok(())
    }
}
