/// Scan settings, loaded from a `settings.toml` file
///
/// Every field has a default, so a partial (or absent) file is fine:
///
/// ```toml
/// frame_size = 256
/// build_concurrency = 8
/// gaussian_sigma = 1.0
/// backend = "cpu"
/// ```

use crate::frame::builder::DEFAULT_MAX_DECODE_BYTES;
use crate::frame::FillMode;
use crate::scan::SortOrder;
use crate::sharpness::SharpnessConfig;
use crate::state::cache::DEFAULT_CACHE_KEY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_DIR: &str = "blur-scan";
const CONFIG_FILE: &str = "settings.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("could not determine the user config directory")]
    NoConfigDir,
}

/// Which sharpness engine scores the frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Side of the square canonical frame, in pixels
    pub frame_size: u32,
    pub fill_mode: FillMode,
    /// Concurrent frame builds (decode + resample)
    pub build_concurrency: usize,
    /// Concurrent scoring calls in flight
    pub score_concurrency: usize,
    /// Pages worked on at once; 1 drains each page before starting the next
    pub page_concurrency: usize,
    pub sort_order: SortOrder,
    /// Pre-Laplacian Gaussian sigma in pixels; absent disables smoothing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gaussian_sigma: Option<f32>,
    /// Decoder allocation ceiling per source image
    pub max_decode_bytes: u64,
    pub backend: Backend,
    /// Storage key of the persisted result cache
    pub cache_key: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            frame_size: 512,
            fill_mode: FillMode::Fill,
            build_concurrency: 4,
            score_concurrency: 2,
            page_concurrency: 1,
            sort_order: SortOrder::NewestFirst,
            gaussian_sigma: None,
            max_decode_bytes: DEFAULT_MAX_DECODE_BYTES,
            backend: Backend::Gpu,
            cache_key: DEFAULT_CACHE_KEY.to_string(),
        }
    }
}

impl ScanConfig {
    /// `<config_dir>/blur-scan/settings.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load and validate settings from `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Settings from an explicit file, else the default file if it exists, else defaults
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Ok(path) if path.is_file() => Self::load(&path),
            _ => {
                tracing::debug!("no settings file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, toml::to_string_pretty(self)?).map_err(io_error)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("frame_size", self.frame_size as u64),
            ("build_concurrency", self.build_concurrency as u64),
            ("score_concurrency", self.score_concurrency as u64),
            ("page_concurrency", self.page_concurrency as u64),
            ("max_decode_bytes", self.max_decode_bytes),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be positive".to_string(),
                });
            }
        }

        if let Err(e) = self.sharpness().validate() {
            return Err(ConfigError::Invalid {
                field: "gaussian_sigma",
                reason: e.to_string(),
            });
        }

        if self.cache_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "cache_key",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn sharpness(&self) -> SharpnessConfig {
        SharpnessConfig {
            gaussian_sigma: self.gaussian_sigma,
        }
    }
}
