use anyhow::{anyhow, Result};

/// Pixel layouts USB cameras commonly deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CaptureLayout {
    Rgb24,
    Nv12,
    Yuyv,
}

impl CaptureLayout {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(CaptureLayout::Rgb24),
            b"NV12" => Some(CaptureLayout::Nv12),
            b"YUYV" => Some(CaptureLayout::Yuyv),
            _ => None,
        }
    }
}

/// Convert a captured buffer to packed RGB. The buffer may carry trailing
/// driver padding; only the bytes the layout needs are read.
pub(crate) fn to_rgb24(pixels: &[u8], width: u32, height: u32, layout: CaptureLayout) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    let expected = match layout {
        CaptureLayout::Rgb24 => plane * 3,
        CaptureLayout::Nv12 => plane + nv12_chroma_stride(w) * h.div_ceil(2),
        CaptureLayout::Yuyv => plane * 2,
    };
    if pixels.len() < expected {
        return Err(anyhow!(
            "{:?} frame too short: expected {} bytes, got {}",
            layout,
            expected,
            pixels.len()
        ));
    }
    let pixels = &pixels[..expected];

    Ok(match layout {
        CaptureLayout::Rgb24 => pixels.to_vec(),
        CaptureLayout::Nv12 => nv12_to_rgb(pixels, w, h),
        CaptureLayout::Yuyv => yuyv_to_rgb(pixels, w, h),
    })
}

/// Interleaved UV bytes per chroma row. Odd widths round the last pair up.
fn nv12_chroma_stride(w: usize) -> usize {
    w.div_ceil(2) * 2
}

fn nv12_to_rgb(pixels: &[u8], w: usize, h: usize) -> Vec<u8> {
    let y_plane = w * h;
    let stride = nv12_chroma_stride(w);
    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * stride + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;
            write_rgb(&mut rgb[(j * w + i) * 3..], y, u, v);
        }
    }
    rgb
}

fn yuyv_to_rgb(pixels: &[u8], w: usize, h: usize) -> Vec<u8> {
    let mut rgb = vec![0u8; w * h * 3];
    for (pair, chunk) in pixels.chunks_exact(4).enumerate() {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        let px = pair * 2;
        write_rgb(&mut rgb[px * 3..], chunk[0] as f32, u, v);
        if px + 1 < w * h {
            write_rgb(&mut rgb[(px + 1) * 3..], chunk[2] as f32, u, v);
        }
    }
    rgb
}

fn write_rgb(out: &mut [u8], y: f32, u: f32, v: f32) {
    out[0] = clamp_to_u8(y + 1.402_f32 * v);
    out[1] = clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v);
    out[2] = clamp_to_u8(y + 1.772_f32 * u);
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_neutral_chroma_is_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let rgb = to_rgb24(&nv12, 2, 2, CaptureLayout::Nv12)?;
        assert_eq!(rgb, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn nv12_odd_dimensions_read_rounded_chroma_plane() -> Result<()> {
        // 3x3 luma, chroma 2 rows of 2 UV pairs.
        let nv12 = [vec![128u8; 9], vec![128u8; 8]].concat();
        let rgb = to_rgb24(&nv12, 3, 3, CaptureLayout::Nv12)?;
        assert_eq!(rgb, vec![128u8; 27]);

        let short = [vec![128u8; 6], vec![128u8; 3]].concat();
        assert!(to_rgb24(&short, 2, 3, CaptureLayout::Nv12).is_err());
        Ok(())
    }

    #[test]
    fn yuyv_neutral_chroma_is_gray() -> Result<()> {
        let yuyv = vec![100u8, 128, 200, 128];
        let rgb = to_rgb24(&yuyv, 2, 1, CaptureLayout::Yuyv)?;
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
        Ok(())
    }

    #[test]
    fn rgb_pass_through_trims_padding_and_rejects_short() -> Result<()> {
        let rgb = to_rgb24(&[1u8; 12], 1, 3, CaptureLayout::Rgb24)?;
        assert_eq!(rgb, vec![1u8; 9]);
        assert!(to_rgb24(&[1u8; 8], 1, 3, CaptureLayout::Rgb24).is_err());
        Ok(())
    }

    #[test]
    fn fourcc_lookup() {
        assert_eq!(CaptureLayout::from_fourcc(b"YUYV"), Some(CaptureLayout::Yuyv));
        assert_eq!(CaptureLayout::from_fourcc(b"MJPG"), None);
    }
}
