//! Frame type and pixel conversions: YUYV, GREY and JPEG to packed RGB.

use chrono::{DateTime, Utc};
use std::time::Instant;

/// A captured camera frame in packed 8-bit RGB.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant; drives cooldown arithmetic.
    pub timestamp: Instant,
    /// Wall-clock capture time; recorded on attendance events.
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Wrap RGB data captured just now.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            captured_at: Utc::now(),
            sequence,
        }
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range YCbCr → RGB, integer arithmetic.
fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V], sharing chroma.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

/// Replicate 8-bit grayscale into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: grey.len() });
    }
    Ok(grey[..expected].iter().flat_map(|&g| [g, g, g]).collect())
}

/// Decode a JPEG image into (rgb, width, height).
pub fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32), FrameError> {
    let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)?.to_rgb8();
    let (w, h) = img.dimensions();
    Ok((img.into_raw(), w, h))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("jpeg decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_grey_levels() {
        // 2x1 image at mid-grey chroma: Y=16 → black, Y=235 → white.
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_chroma() {
        // Strong Cr pushes red up and green down.
        let rgb = yuyv_to_rgb(&[128, 128, 128, 240], 2, 1).unwrap();
        assert!(rgb[0] > 200, "r = {}", rgb[0]);
        assert!(rgb[1] < rgb[0] && rgb[2] < rgb[0]);
        assert_eq!(&rgb[0..3], &rgb[3..6]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_to_rgb() {
        assert_eq!(grey_to_rgb(&[7, 9], 2, 1).unwrap(), vec![7, 7, 7, 9, 9, 9]);
        assert!(grey_to_rgb(&[7], 2, 1).is_err());
    }

    #[test]
    fn test_decode_jpeg_roundtrip_dimensions() {
        let img = image::RgbImage::from_pixel(16, 8, image::Rgb([200, 100, 50]));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
            .unwrap();
        let (rgb, w, h) = decode_jpeg(&bytes).unwrap();
        assert_eq!((w, h), (16, 8));
        assert_eq!(rgb.len(), 16 * 8 * 3);
        assert!((rgb[0] as i32 - 200).abs() < 10);
    }

    #[test]
    fn test_decode_jpeg_garbage() {
        assert!(matches!(decode_jpeg(b"\xff\xd8nope\xff\xd9"), Err(FrameError::Decode(_))));
    }
}
