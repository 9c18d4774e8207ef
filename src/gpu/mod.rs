/// GPU sharpness scoring
///
/// Architecture:
/// - `shaders.rs` - WGSL compute kernels (luma, Gaussian, Laplacian, reductions)
/// - `pipeline.rs` - device setup, per-frame dispatch and readback
///
/// Frames are uploaded as BGRA8 textures and reduced on the device to a
/// single `[mean, variance]` pair; only those eight bytes come back.

pub mod pipeline;
pub mod shaders;

pub use pipeline::GpuSharpnessEngine;
