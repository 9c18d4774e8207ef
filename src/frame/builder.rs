/// Source image -> canonical frame
///
/// One synchronous call per asset; the orchestrator runs many of them on
/// blocking worker threads at once, bounded by its decode permit pool.

use super::{embedded, CanonicalFrame, FillMode, SourceImage};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageReader, Limits, RgbaImage};
use std::borrow::Cow;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// Sources whose covering side exceeds the target by this factor are
/// box-shrunk first, down to twice the target.
const PRESHRINK_FACTOR: u32 = 4;

/// Default ceiling on decoder allocations (512 MiB)
pub const DEFAULT_MAX_DECODE_BYTES: u64 = 512 * 1024 * 1024;

/// Why a frame could not be built. Never surfaced past the builder:
/// callers only see a missing frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("target size must be positive")]
    ZeroSize,
    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode source: {0}")]
    Decode(#[from] image::ImageError),
    #[error("no decodable preview in RAW file")]
    NoPreview,
    #[error("source has zero area")]
    EmptySource,
    #[error("frame allocation failed")]
    Allocation,
}

#[derive(Debug, Clone)]
pub struct CanonicalFrameBuilder {
    max_decode_bytes: u64,
}

impl Default for CanonicalFrameBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DECODE_BYTES)
    }
}

impl CanonicalFrameBuilder {
    pub fn new(max_decode_bytes: u64) -> Self {
        Self { max_decode_bytes }
    }

    /// Build a `target_size` x `target_size` frame from `source`
    ///
    /// Every failure (unreadable, corrupt, over the allocation ceiling, zero
    /// size) yields `None`: a missing frame means "skip this asset".
    pub fn build(
        &self,
        source: &SourceImage,
        target_size: u32,
        fill: FillMode,
    ) -> Option<CanonicalFrame> {
        match self.try_build(source, target_size, fill) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!(error = %e, "frame build failed");
                None
            }
        }
    }

    /// Same as `build`, with the reason for a failure
    pub fn try_build(
        &self,
        source: &SourceImage,
        target_size: u32,
        fill: FillMode,
    ) -> Result<CanonicalFrame, FrameError> {
        if target_size == 0 {
            return Err(FrameError::ZeroSize);
        }

        let decoded;
        let img: &DynamicImage = match source {
            SourceImage::Decoded(img) => img,
            SourceImage::Path(path) => {
                decoded = self.decode_path(path, target_size, fill)?;
                &decoded
            }
            SourceImage::Encoded(bytes) => {
                decoded = self.decode_bytes(bytes, target_size, fill)?;
                &decoded
            }
        };

        if img.width() == 0 || img.height() == 0 {
            return Err(FrameError::EmptySource);
        }

        let rgba = resample(img, target_size, fill);
        CanonicalFrame::from_rgba(target_size, target_size, rgba.as_raw())
            .ok_or(FrameError::Allocation)
    }

    fn decode_path(
        &self,
        path: &Path,
        target_size: u32,
        fill: FillMode,
    ) -> Result<DynamicImage, FrameError> {
        let bytes = std::fs::read(path)?;
        if embedded::is_raw_path(path) {
            let preview = embedded::select_preview(&bytes, target_size, fill)
                .ok_or(FrameError::NoPreview)?;
            return self.decode(preview);
        }
        self.decode_bytes(&bytes, target_size, fill)
    }

    fn decode_bytes(
        &self,
        bytes: &[u8],
        target_size: u32,
        fill: FillMode,
    ) -> Result<DynamicImage, FrameError> {
        match self.decode(bytes) {
            // RAW bytes without a telling file name (many are TIFF-shaped)
            Err(FrameError::Decode(e)) => {
                match embedded::select_preview(bytes, target_size, fill) {
                    Some(preview) => self.decode(preview),
                    None => Err(FrameError::Decode(e)),
                }
            }
            other => other,
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, FrameError> {
        let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.max_decode_bytes);
        reader.limits(limits);
        Ok(reader.decode()?)
    }
}

/// Cheap box reduction for sources far above the target size
fn preshrink(img: &DynamicImage, target_size: u32, fill: FillMode) -> Cow<'_, DynamicImage> {
    let side = fill.covering_side(img.width(), img.height());
    if side < target_size.saturating_mul(PRESHRINK_FACTOR) {
        return Cow::Borrowed(img);
    }

    // Scale so the covering side lands on twice the target
    let scale = (target_size as f64 * 2.0) / side as f64;
    let w = ((img.width() as f64 * scale).ceil() as u32).max(1);
    let h = ((img.height() as f64 * scale).ceil() as u32).max(1);
    Cow::Owned(img.thumbnail_exact(w, h))
}

/// Exact resample to a `target_size` square, straight-alpha RGBA8
fn resample(img: &DynamicImage, target_size: u32, fill: FillMode) -> RgbaImage {
    match fill {
        FillMode::Fill => fill_square(img, target_size),
        FillMode::Fit => {
            let scaled = preshrink(img, target_size, fill)
                .resize(target_size, target_size, FilterType::Triangle)
                .to_rgba8();
            if scaled.width() == target_size && scaled.height() == target_size {
                return scaled;
            }
            // Letterbox on transparent black, centered
            let mut canvas = RgbaImage::new(target_size, target_size);
            let x = (target_size - scaled.width()) / 2;
            let y = (target_size - scaled.height()) / 2;
            imageops::replace(&mut canvas, &scaled, x as i64, y as i64);
            canvas
        }
    }
}

/// Aspect-fill: crop the centred square before any upscaling, so no
/// intermediate is larger than the source or its pre-shrunk copy
fn fill_square(img: &DynamicImage, target_size: u32) -> RgbaImage {
    let img = preshrink(img, target_size, FillMode::Fill);
    let (width, height) = (img.width(), img.height());
    let side = width.min(height);
    let square = img.crop_imm((width - side) / 2, (height - side) / 2, side, side);
    if side == target_size {
        return square.to_rgba8();
    }
    square
        .resize_exact(target_size, target_size, FilterType::Triangle)
        .to_rgba8()
}
