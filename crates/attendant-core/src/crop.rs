//! Turns an accepted frame into a submittable face sample.
//!
//! The detected box is padded on every side, clamped to the frame, scaled to
//! a fixed square and JPEG-encoded.

use crate::types::{BoundingBox, CapturedSample, FrameSize};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, GrayImage};
use thiserror::Error;

/// Padding added to each side of the face box, as a fraction of its size.
pub const CROP_PADDING: f32 = 0.35;
/// Side length of the square output sample.
pub const SAMPLE_SIZE: u32 = 224;
/// JPEG quality of the encoded sample.
pub const JPEG_QUALITY: u8 = 92;

#[derive(Error, Debug)]
pub enum CropError {
    #[error("frame buffer too short: expected {expected}, got {actual}")]
    BadFrame { expected: usize, actual: usize },
    #[error("crop region is empty")]
    EmptyRegion,
    #[error("encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Integer crop rectangle inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Expand `face` by `padding` on each side and clamp the result to `frame`.
pub fn crop_rect(face: &BoundingBox, frame: FrameSize, padding: f32) -> CropRect {
    let fw = frame.width as f32;
    let fh = frame.height as f32;

    let x = (face.x - face.width * padding).clamp(0.0, fw);
    let y = (face.y - face.height * padding).clamp(0.0, fh);
    let w = (face.width * (1.0 + padding * 2.0)).min(fw - x).max(0.0);
    let h = (face.height * (1.0 + padding * 2.0)).min(fh - y).max(0.0);

    CropRect {
        x: x.floor() as u32,
        y: y.floor() as u32,
        width: w.round() as u32,
        height: h.round() as u32,
    }
    .fit(frame)
}

impl CropRect {
    fn fit(mut self, frame: FrameSize) -> Self {
        self.width = self.width.min(frame.width.saturating_sub(self.x));
        self.height = self.height.min(frame.height.saturating_sub(self.y));
        self
    }
}

/// Crop, resize and encode a grayscale frame around an accepted face.
pub fn normalize(frame: &[u8], size: FrameSize, face: &BoundingBox) -> Result<CapturedSample, CropError> {
    let expected = (size.width * size.height) as usize;
    if frame.len() < expected {
        return Err(CropError::BadFrame {
            expected,
            actual: frame.len(),
        });
    }
    let rect = crop_rect(face, size, CROP_PADDING);
    if rect.width == 0 || rect.height == 0 {
        return Err(CropError::EmptyRegion);
    }

    let image = GrayImage::from_raw(size.width, size.height, frame[..expected].to_vec()).ok_or(
        CropError::BadFrame {
            expected,
            actual: frame.len(),
        },
    )?;
    let cropped = image::imageops::crop_imm(&image, rect.x, rect.y, rect.width, rect.height).to_image();
    let square = image::imageops::resize(&cropped, SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Triangle);

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode(
        square.as_raw(),
        SAMPLE_SIZE,
        SAMPLE_SIZE,
        ExtendedColorType::L8,
    )?;

    tracing::debug!(?rect, bytes = jpeg.len(), "face sample encoded");
    Ok(CapturedSample { jpeg, source: size })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: FrameSize = FrameSize { width: 640, height: 480 };

    #[test]
    fn test_crop_rect_pads_each_side() {
        let face = BoundingBox::new(200.0, 100.0, 200.0, 200.0);
        let r = crop_rect(&face, FRAME, CROP_PADDING);
        assert_eq!(r, CropRect { x: 130, y: 30, width: 340, height: 340 });
    }

    #[test]
    fn test_crop_rect_clamps_top_left() {
        let face = BoundingBox::new(10.0, 5.0, 200.0, 200.0);
        let r = crop_rect(&face, FRAME, CROP_PADDING);
        assert_eq!((r.x, r.y), (0, 0));
        assert_eq!((r.width, r.height), (340, 340));
    }

    #[test]
    fn test_crop_rect_clamps_bottom_right() {
        let face = BoundingBox::new(500.0, 350.0, 200.0, 200.0);
        let r = crop_rect(&face, FRAME, CROP_PADDING);
        assert_eq!((r.x, r.y), (430, 280));
        assert_eq!(r.x + r.width, 640);
        assert_eq!(r.y + r.height, 480);
    }

    #[test]
    fn test_normalize_produces_square_jpeg() {
        let frame = vec![128u8; 640 * 480];
        let face = BoundingBox::new(220.0, 140.0, 200.0, 200.0);
        let sample = normalize(&frame, FRAME, &face).unwrap();
        assert_eq!(sample.source, FRAME);

        let decoded = image::load_from_memory(&sample.jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (SAMPLE_SIZE, SAMPLE_SIZE));
    }

    #[test]
    fn test_normalize_rejects_short_buffer() {
        let face = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(matches!(
            normalize(&[0u8; 100], FRAME, &face),
            Err(CropError::BadFrame { .. })
        ));
    }

    #[test]
    fn test_normalize_rejects_box_outside_frame() {
        let frame = vec![0u8; 640 * 480];
        let face = BoundingBox::new(900.0, 900.0, 50.0, 50.0);
        assert!(matches!(normalize(&frame, FRAME, &face), Err(CropError::EmptyRegion)));
    }
}
