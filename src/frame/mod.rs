/// Canonical frame construction
///
/// This module handles:
/// - The fixed-size BGRA8 buffer handed to the sharpness engines
/// - Decoding and resampling arbitrary source images into that buffer
/// - Picking embedded JPEG previews out of camera RAW files

pub mod builder;
pub mod embedded;

pub use builder::{CanonicalFrameBuilder, FrameError};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Row stride alignment of frame buffers, so rows can be copied to the GPU as is
pub const ROW_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// How a non-square source is mapped onto the square target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    /// Preserve aspect ratio, letterbox with transparent black
    Fit,
    /// Preserve aspect ratio, crop the center to fill
    #[default]
    Fill,
}

impl FillMode {
    /// Side of the source that must reach the target size to cover it
    pub fn covering_side(self, width: u32, height: u32) -> u32 {
        match self {
            FillMode::Fit => width.max(height),
            FillMode::Fill => width.min(height),
        }
    }
}

/// Handle to a source image as supplied by an asset source
#[derive(Debug, Clone)]
pub enum SourceImage {
    /// A file on disk (regular image or camera RAW)
    Path(PathBuf),
    /// Encoded bytes already in memory
    Encoded(Vec<u8>),
    /// Pixels already decoded
    Decoded(DynamicImage),
}

/// Fixed-size, premultiplied BGRA8 pixel buffer.
///
/// Rows are padded to `ROW_ALIGNMENT` bytes so the buffer can be uploaded
/// without repacking. The frame is owned by whoever built it until it is
/// handed to a scorer, which consumes it.
#[derive(Clone, PartialEq, Eq)]
pub struct CanonicalFrame {
    width: u32,
    height: u32,
    bytes_per_row: u32,
    data: Vec<u8>,
}

impl CanonicalFrame {
    /// Padded stride for a row of `width` BGRA pixels
    pub fn stride_for(width: u32) -> u32 {
        let unpadded = width * crate::color::BYTES_PER_PIXEL as u32;
        unpadded.div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT
    }

    /// Allocate a zeroed (transparent black) frame
    ///
    /// Returns `None` for zero-area sizes or when the allocation fails.
    pub fn zeroed(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let bytes_per_row = Self::stride_for(width);
        let len = bytes_per_row as usize * height as usize;

        let mut data = Vec::new();
        data.try_reserve_exact(len).ok()?;
        data.resize(len, 0);

        Some(Self {
            width,
            height,
            bytes_per_row,
            data,
        })
    }

    /// Build a frame from straight-alpha RGBA8 pixels (tightly packed)
    pub fn from_rgba(width: u32, height: u32, rgba: &[u8]) -> Option<Self> {
        let row_len = width as usize * 4;
        if rgba.len() != row_len * height as usize {
            return None;
        }
        let mut frame = Self::zeroed(width, height)?;
        for (y, src_row) in rgba.chunks_exact(row_len).enumerate() {
            let dst_row = frame.row_mut(y as u32);
            for (dst, src) in dst_row.chunks_exact_mut(4).zip(src_row.chunks_exact(4)) {
                dst.copy_from_slice(&crate::color::rgba_to_bgra_premultiplied([
                    src[0], src[1], src[2], src[3],
                ]));
            }
        }
        Some(frame)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.bytes_per_row
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whole padded buffer, as uploaded to the GPU
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Pixels of row `y` without padding
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.bytes_per_row as usize;
        &self.data[start..start + self.width as usize * 4]
    }

    fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.bytes_per_row as usize;
        let len = self.width as usize * 4;
        &mut self.data[start..start + len]
    }

    /// BGRA of one pixel
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let row = self.row(y);
        let i = x as usize * 4;
        [row[i], row[i + 1], row[i + 2], row[i + 3]]
    }
}

// Manual Debug implementation (the pixel buffer is too large to print)
impl std::fmt::Debug for CanonicalFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanonicalFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes_per_row", &self.bytes_per_row)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_padded_to_alignment() {
        assert_eq!(CanonicalFrame::stride_for(64), 256);
        assert_eq!(CanonicalFrame::stride_for(65), 512);
        assert_eq!(CanonicalFrame::stride_for(512), 2048);

        let frame = CanonicalFrame::zeroed(3, 2).unwrap();
        assert_eq!(frame.bytes_per_row(), 256);
        assert_eq!(frame.as_bytes().len(), 512);
        assert_eq!(frame.row(1).len(), 12);
    }

    #[test]
    fn test_zero_area_is_rejected() {
        assert!(CanonicalFrame::zeroed(0, 10).is_none());
        assert!(CanonicalFrame::zeroed(10, 0).is_none());
    }

    #[test]
    fn test_from_rgba_swizzles_and_premultiplies() {
        let rgba = [10, 20, 30, 255, 255, 0, 0, 0];
        let frame = CanonicalFrame::from_rgba(2, 1, &rgba).unwrap();
        assert_eq!(frame.pixel(0, 0), [30, 20, 10, 255]);
        assert_eq!(frame.pixel(1, 0), [0, 0, 0, 0]);

        // Wrong buffer length
        assert!(CanonicalFrame::from_rgba(2, 2, &rgba).is_none());
    }

    #[test]
    fn test_covering_side() {
        assert_eq!(FillMode::Fit.covering_side(800, 600), 800);
        assert_eq!(FillMode::Fill.covering_side(800, 600), 600);
    }
}
