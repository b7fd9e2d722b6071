//! Model input preparation shared by the engines.
//!
//! Frames arrive as packed 8-bit Gray or RGB. Models want a fixed input size
//! and planar `f32` values in `[0, 1]`.

use anyhow::{anyhow, Result};

use crate::frame::{FrameView, PixelFormat};

/// Convert a view to 8-bit grayscale (Rec.601 luma).
pub fn to_gray(view: &FrameView<'_>) -> Vec<u8> {
    let pixels = view.pixels();
    match view.format() {
        PixelFormat::Gray8 => pixels.to_vec(),
        PixelFormat::Rgb8 => pixels
            .chunks_exact(3)
            .map(|px| {
                let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                luma.round().clamp(0.0, 255.0) as u8
            })
            .collect(),
    }
}

/// Convert a view to packed RGB, replicating gray channels.
pub fn to_rgb(view: &FrameView<'_>) -> Vec<u8> {
    let pixels = view.pixels();
    match view.format() {
        PixelFormat::Rgb8 => pixels.to_vec(),
        PixelFormat::Gray8 => pixels.iter().flat_map(|&p| [p, p, p]).collect(),
    }
}

/// Bilinear resize of a packed interleaved buffer.
pub fn resize_bilinear(
    src: &[u8],
    width: u32,
    height: u32,
    channels: usize,
    dst_width: u32,
    dst_height: u32,
) -> Result<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    let (dw, dh) = (dst_width as usize, dst_height as usize);
    if w == 0 || h == 0 || dw == 0 || dh == 0 {
        return Err(anyhow!("cannot resize empty image"));
    }
    if src.len() != w * h * channels {
        return Err(anyhow!(
            "resize input length mismatch: expected {}, got {}",
            w * h * channels,
            src.len()
        ));
    }
    if w == dw && h == dh {
        return Ok(src.to_vec());
    }

    let scale_x = w as f32 / dw as f32;
    let scale_y = h as f32 / dh as f32;
    let mut out = vec![0u8; dw * dh * channels];

    for y in 0..dh {
        let sy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (h - 1) as f32);
        let y0 = sy.floor() as usize;
        let y1 = (y0 + 1).min(h - 1);
        let fy = sy - y0 as f32;
        for x in 0..dw {
            let sx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (w - 1) as f32);
            let x0 = sx.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let fx = sx - x0 as f32;
            for c in 0..channels {
                let p00 = src[(y0 * w + x0) * channels + c] as f32;
                let p01 = src[(y0 * w + x1) * channels + c] as f32;
                let p10 = src[(y1 * w + x0) * channels + c] as f32;
                let p11 = src[(y1 * w + x1) * channels + c] as f32;
                let top = p00 + (p01 - p00) * fx;
                let bottom = p10 + (p11 - p10) * fx;
                let value = top + (bottom - top) * fy;
                out[(y * dw + x) * channels + c] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    Ok(out)
}

/// Interleaved `HWC` bytes to planar `CHW` floats scaled to `[0, 1]`.
pub fn to_planar_unit(pixels: &[u8], width: u32, height: u32, channels: usize) -> Vec<f32> {
    let plane = width as usize * height as usize;
    let mut out = vec![0f32; plane * channels];
    for (idx, px) in pixels.chunks_exact(channels).enumerate().take(plane) {
        for (c, &value) in px.iter().enumerate() {
            out[c * plane + idx] = value as f32 / 255.0;
        }
    }
    out
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}

/// Highest `k` probabilities paired with their labels, best first.
///
/// Indices without a label are reported as `class_<index>`.
pub fn top_k(probs: &[f32], labels: &[String], k: usize) -> Vec<(String, f32)> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().cloned().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed
        .into_iter()
        .take(k)
        .map(|(idx, p)| {
            let label = labels
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", idx));
            (label, p)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn gray_conversion_of_rgb_white_is_white() {
        let frame = Frame::new(1, 2, 1, PixelFormat::Rgb8, vec![255u8; 6]).unwrap();
        let view = frame.view().unwrap();
        assert_eq!(to_gray(&view), vec![255, 255]);
    }

    #[test]
    fn gray_to_rgb_replicates_channels() {
        let frame = Frame::new(1, 2, 1, PixelFormat::Gray8, vec![10, 20]).unwrap();
        let view = frame.view().unwrap();
        assert_eq!(to_rgb(&view), vec![10, 10, 10, 20, 20, 20]);
    }

    #[test]
    fn resize_constant_image_stays_constant() -> Result<()> {
        let src = vec![77u8; 6 * 4];
        let out = resize_bilinear(&src, 6, 4, 1, 3, 2)?;
        assert_eq!(out, vec![77u8; 6]);
        Ok(())
    }

    #[test]
    fn resize_rejects_bad_length() {
        assert!(resize_bilinear(&[0u8; 5], 2, 2, 1, 1, 1).is_err());
    }

    #[test]
    fn planar_layout_splits_channels() {
        let out = to_planar_unit(&[255, 0, 0, 0, 255, 0], 2, 1, 3);
        assert_eq!(out, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn softmax_sums_to_one_and_orders() {
        let probs = softmax(&[1.0, 3.0, 2.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[1] > probs[2] && probs[2] > probs[0]);
    }

    #[test]
    fn top_k_orders_and_labels() {
        let labels = vec!["apple".to_string(), "tomato".to_string()];
        let best = top_k(&[0.2, 0.7, 0.1], &labels, 2);
        assert_eq!(best[0].0, "tomato");
        assert_eq!(best[1].0, "apple");
        let unlabeled = top_k(&[0.2, 0.7, 0.9], &labels, 1);
        assert_eq!(unlabeled[0].0, "class_2");
    }
}
