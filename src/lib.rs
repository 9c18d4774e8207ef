/// Blur detection for large photo libraries
///
/// Every image is reduced to a small canonical frame, scored with the
/// variance of its Laplacian (on the GPU, or on the CPU as a fallback) and
/// classified against a threshold. `scan::BatchOrchestrator` runs this over
/// a whole library in pages, with bounded decode and scoring concurrency
/// and a persisted result cache.

pub mod color;
pub mod config;
pub mod frame;
pub mod gpu;
pub mod scan;
pub mod sharpness;
pub mod state;

pub use config::{Backend, ConfigError, ScanConfig};
pub use frame::{CanonicalFrame, CanonicalFrameBuilder, FillMode, SourceImage};
pub use gpu::GpuSharpnessEngine;
pub use scan::{BatchOrchestrator, ScanError, ScanEvent, ScanStream, ScanSummary};
pub use sharpness::{CpuSharpnessEngine, EngineError, SharpnessConfig, SharpnessScorer};
pub use state::{AssetId, ProgressEvent, ResultCache, SqliteStore};
