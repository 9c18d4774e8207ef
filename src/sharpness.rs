//! Variance-of-Laplacian sharpness scoring
//!
//! Both engines run the same stages over a canonical frame:
//! 1. BGRA -> linear luma
//! 2. Optional separable Gaussian (clamp-to-edge)
//! 3. 4-neighbour Laplacian (clamp-to-edge)
//! 4. Population mean and variance of the response
//! 5. Bessel correction to the sample variance
//!
//! `CpuSharpnessEngine` is the `f64` reference; `gpu::GpuSharpnessEngine`
//! is the production path.

use crate::color;
use crate::frame::CanonicalFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no compatible GPU adapter found")]
    NoAdapter,
    #[error("failed to create GPU device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("frame has {0} pixels, at least 2 are required")]
    TooFewPixels(usize),
    #[error("frame {width}x{height} exceeds the device texture limit of {limit}")]
    FrameTooLarge { width: u32, height: u32, limit: u32 },
    #[error("result readback failed: {0}")]
    Readback(String),
    #[error("scoring task failed: {0}")]
    Task(String),
    #[error("invalid gaussian sigma {0}")]
    InvalidSigma(f32),
}

/// Anything that turns a canonical frame into a sharpness score
///
/// Each submitted frame resolves exactly once, with a score or an error.
#[async_trait]
pub trait SharpnessScorer: Send + Sync {
    async fn score(&self, frame: CanonicalFrame) -> Result<f64, EngineError>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Largest accepted smoothing sigma; the kernel radius is `ceil(3 sigma)`
pub const MAX_GAUSSIAN_SIGMA: f32 = 64.0;

/// Tunables shared by both engines
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SharpnessConfig {
    /// Standard deviation of the pre-Laplacian Gaussian, in pixels; `None` disables it
    pub gaussian_sigma: Option<f32>,
}

impl SharpnessConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        match self.gaussian_sigma {
            Some(sigma) if !(sigma > 0.0 && sigma <= MAX_GAUSSIAN_SIGMA) => {
                Err(EngineError::InvalidSigma(sigma))
            }
            _ => Ok(()),
        }
    }

    /// Normalised Gaussian weights, or `None` when smoothing is disabled
    pub fn kernel(&self) -> Option<Vec<f32>> {
        self.gaussian_sigma.map(gaussian_kernel)
    }
}

/// Normalised 1-D Gaussian of radius `ceil(3 sigma)` (at least 1)
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = ((3.0 * sigma).ceil() as i32).max(1);
    let two_sigma_sq = 2.0 * sigma as f64 * sigma as f64;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-((x * x) as f64) / two_sigma_sq).exp())
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.iter().map(|w| (w / sum) as f32).collect()
}

/// Bessel's correction: population variance over `n` samples -> sample variance
///
/// Undefined below two samples.
pub fn sample_variance(population_variance: f64, n: usize) -> Result<f64, EngineError> {
    if n < 2 {
        return Err(EngineError::TooFewPixels(n));
    }
    let n = n as f64;
    Ok(population_variance.max(0.0) * n / (n - 1.0))
}

/// Single-channel plane of `f64` samples
#[derive(Debug, Clone)]
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl Plane {
    #[inline]
    fn at(&self, x: isize, y: isize) -> f64 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    fn map(&self, f: impl Fn(isize, isize) -> f64) -> Plane {
        let mut data = Vec::with_capacity(self.data.len());
        for y in 0..self.height as isize {
            for x in 0..self.width as isize {
                data.push(f(x, y));
            }
        }
        Plane {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

fn luma_plane(frame: &CanonicalFrame) -> Plane {
    let mut data = Vec::with_capacity(frame.pixel_count());
    for y in 0..frame.height() {
        data.extend(frame.row(y).chunks_exact(4).map(color::luma_from_bgra));
    }
    Plane {
        width: frame.width() as usize,
        height: frame.height() as usize,
        data,
    }
}

fn blur_axis(plane: &Plane, kernel: &[f32], horizontal: bool) -> Plane {
    let radius = (kernel.len() / 2) as isize;
    plane.map(|x, y| {
        kernel
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let k = i as isize - radius;
                let sample = if horizontal {
                    plane.at(x + k, y)
                } else {
                    plane.at(x, y + k)
                };
                *w as f64 * sample
            })
            .sum()
    })
}

fn laplacian(plane: &Plane) -> Plane {
    plane.map(|x, y| {
        plane.at(x - 1, y) + plane.at(x + 1, y) + plane.at(x, y - 1) + plane.at(x, y + 1)
            - 4.0 * plane.at(x, y)
    })
}

/// Population mean and variance in one pass
fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let (sum, sum_sq) = values
        .iter()
        .fold((0.0, 0.0), |(s, sq), v| (s + v, sq + v * v));
    let mean = sum / n;
    (mean, (sum_sq / n - mean * mean).max(0.0))
}

/// CPU reference implementation of the sharpness pipeline
#[derive(Debug, Clone, Default)]
pub struct CpuSharpnessEngine {
    kernel: Option<Vec<f32>>,
}

impl CpuSharpnessEngine {
    pub fn new(config: &SharpnessConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            kernel: config.kernel(),
        })
    }

    /// Score one frame on the calling thread
    pub fn score_frame(&self, frame: &CanonicalFrame) -> Result<f64, EngineError> {
        let n = frame.pixel_count();
        if n < 2 {
            return Err(EngineError::TooFewPixels(n));
        }

        let mut plane = luma_plane(frame);
        if let Some(kernel) = &self.kernel {
            plane = blur_axis(&blur_axis(&plane, kernel, true), kernel, false);
        }
        let response = laplacian(&plane);
        let (_, population_variance) = mean_and_variance(&response.data);
        sample_variance(population_variance, n)
    }
}

#[async_trait]
impl SharpnessScorer for CpuSharpnessEngine {
    async fn score(&self, frame: CanonicalFrame) -> Result<f64, EngineError> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.score_frame(&frame))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
    }

    fn name(&self) -> &'static str {
        "cpu"
    }
}
