//! Grayscale frames and the pixel work done on them before recognition:
//! luma extraction, darkness checks and CLAHE contrast enhancement.

use std::time::Instant;

/// Pixels below this value count as dark.
pub const DARK_PIXEL: u8 = 32;

/// A captured grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Luma bytes, row-major, `width * height` long.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub captured_at: Instant,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn mean_brightness(&self) -> f32 {
        mean_brightness(&self.data)
    }

    /// Fraction of pixels below [`DARK_PIXEL`].
    pub fn dark_fraction(&self) -> f32 {
        dark_fraction(&self.data)
    }

    pub fn is_dark(&self, max_dark_fraction: f32) -> bool {
        is_dark(&self.data, max_dark_fraction)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("{format} buffer too short: expected {expected} bytes, got {actual}")]
    ShortBuffer {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn require(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::ShortBuffer {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Y channel of packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair).
pub fn yuyv_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    require("YUYV", buf, expected)?;
    Ok(buf[..expected].iter().step_by(2).copied().collect())
}

/// High byte of each little-endian 16-bit sample.
pub fn y16_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    require("Y16", buf, expected)?;
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

pub fn grey_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    require("GREY", buf, expected)?;
    Ok(buf[..expected].to_vec())
}

pub fn mean_brightness(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    gray.iter().map(|&b| b as u64).sum::<u64>() as f32 / gray.len() as f32
}

pub fn dark_fraction(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 1.0;
    }
    gray.iter().filter(|&&p| p < DARK_PIXEL).count() as f32 / gray.len() as f32
}

/// True when more than `max_dark_fraction` of the pixels are dark. Empty frames are dark.
pub fn is_dark(gray: &[u8], max_dark_fraction: f32) -> bool {
    dark_fraction(gray) > max_dark_fraction
}

/// Contrast-limited adaptive histogram equalization.
///
/// Webcam frames in a dim classroom are often low contrast; equalizing per
/// tile brings faces up without blowing out the background.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clahe {
    /// Tiles per side of the square grid.
    pub tiles: u32,
    /// Histogram clip, as a fraction of the tile's pixel count.
    pub clip_limit: f32,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            tiles: 8,
            clip_limit: 0.02,
        }
    }
}

impl Clahe {
    /// Equalize `gray` in place. Frames too small for the grid are left as is.
    pub fn apply(&self, gray: &mut [u8], width: u32, height: u32) {
        let (w, h) = (width as usize, height as usize);
        let n = self.tiles.max(1) as usize;
        if gray.len() < w * h || w / n == 0 || h / n == 0 {
            return;
        }
        let (tile_w, tile_h) = (w / n, h / n);

        let luts: Vec<[u8; 256]> = (0..n * n)
            .map(|t| self.tile_lut(gray, w, (t % n) * tile_w, (t / n) * tile_h, tile_w, tile_h))
            .collect();

        // Blend the four nearest tile mappings, weighted by distance to tile centres.
        let axis = |pos: usize, tile: usize| {
            let f = (pos as f32 / tile as f32 - 0.5).clamp(0.0, (n - 1) as f32);
            let lo = f as usize;
            (lo, (lo + 1).min(n - 1), f - lo as f32)
        };

        for y in 0..h {
            let (r0, r1, dy) = axis(y, tile_h);
            for x in 0..w {
                let (c0, c1, dx) = axis(x, tile_w);
                let px = gray[y * w + x] as usize;
                let at = |r: usize, c: usize| luts[r * n + c][px] as f32;

                let top = at(r0, c0) * (1.0 - dx) + at(r0, c1) * dx;
                let bottom = at(r1, c0) * (1.0 - dx) + at(r1, c1) * dx;
                gray[y * w + x] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    fn tile_lut(&self, gray: &[u8], stride: usize, x0: usize, y0: usize, tw: usize, th: usize) -> [u8; 256] {
        let mut hist = [0u32; 256];
        for row in gray[y0 * stride..].chunks(stride).take(th) {
            for &p in &row[x0..x0 + tw] {
                hist[p as usize] += 1;
            }
        }

        let pixels = (tw * th) as u32;
        let clip = ((self.clip_limit * pixels as f32) as u32).max(1);
        let excess: u32 = hist.iter().map(|&b| b.saturating_sub(clip)).sum();
        let (share, rest) = (excess / 256, (excess % 256) as usize);
        for (i, bin) in hist.iter_mut().enumerate() {
            *bin = (*bin).min(clip) + share + u32::from(i < rest);
        }

        let mut lut = [0u8; 256];
        let mut cdf = 0u32;
        let cdf_min = hist.iter().copied().find(|&b| b > 0).unwrap_or(0);
        let denom = pixels.saturating_sub(cdf_min).max(1) as f32;
        for (i, &bin) in hist.iter().enumerate() {
            cdf += bin;
            lut[i] = ((cdf.saturating_sub(cdf_min)) as f32 / denom * 255.0).clamp(0.0, 255.0) as u8;
        }
        lut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_luma() {
        let buf: Vec<u8> = (0..16).collect();
        assert_eq!(yuyv_luma(&buf, 4, 2).unwrap(), vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_yuyv_short_buffer() {
        let err = yuyv_luma(&[100, 128], 2, 1).unwrap_err();
        assert!(err.to_string().contains("expected 4"));
    }

    #[test]
    fn test_y16_takes_high_byte() {
        let buf = [0x34, 0x12, 0xff, 0x80];
        assert_eq!(y16_luma(&buf, 2, 1).unwrap(), vec![0x12, 0x80]);
    }

    #[test]
    fn test_grey_truncates_padding() {
        let buf = [1, 2, 3, 4, 99, 99];
        assert_eq!(grey_luma(&buf, 2, 2).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_dark_detection() {
        assert!(is_dark(&[0u8; 100], 0.95));
        assert!(!is_dark(&[128u8; 100], 0.95));
        assert!(is_dark(&[], 0.95));

        let mut mostly = vec![10u8; 96];
        mostly.extend([128u8; 4]);
        assert!(is_dark(&mostly, 0.95));

        let mut borderline = vec![10u8; 94];
        borderline.extend([128u8; 6]);
        assert!(!is_dark(&borderline, 0.95));
    }

    #[test]
    fn test_frame_brightness() {
        let frame = Frame {
            data: vec![0, 100, 200, 100],
            width: 2,
            height: 2,
            sequence: 0,
            captured_at: Instant::now(),
        };
        assert_eq!(frame.mean_brightness(), 100.0);
        assert_eq!(frame.dark_fraction(), 0.25);
    }

    #[test]
    fn test_clahe_spreads_low_contrast_image() {
        let (w, h) = (16u32, 16u32);
        let mut gray: Vec<u8> = (0..(w * h) as usize).map(|i| 100 + (i % 11) as u8).collect();
        let before = spread(&gray);
        Clahe { tiles: 2, clip_limit: 0.02 }.apply(&mut gray, w, h);
        assert!(spread(&gray) > before);
    }

    #[test]
    fn test_clahe_ignores_tiny_frames() {
        let mut gray = vec![50u8; 4];
        Clahe::default().apply(&mut gray, 2, 2);
        assert_eq!(gray, vec![50u8; 4]);
    }

    fn spread(data: &[u8]) -> u8 {
        data.iter().max().unwrap() - data.iter().min().unwrap()
    }
}
