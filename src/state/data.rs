/// Shared data structures for the scan state
///
/// These structs represent the data model that flows between
/// the asset source, the result cache and the scan consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, stable identifier of one source image
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An asset is blurry iff its score is strictly below the threshold
pub fn is_blurry(score: f64, threshold: f64) -> bool {
    score < threshold
}

/// Lookup key of the result cache: (asset, threshold)
///
/// The threshold is keyed by its bit pattern, with -0.0 folded into 0.0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub asset_id: AssetId,
    threshold_bits: u64,
}

impl CacheKey {
    pub fn new(asset_id: AssetId, threshold: f64) -> Self {
        let threshold = if threshold == 0.0 { 0.0 } else { threshold };
        Self {
            asset_id,
            threshold_bits: threshold.to_bits(),
        }
    }

    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits)
    }
}

/// One cached classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub asset_id: AssetId,
    pub threshold: f64,
    pub is_blurry: bool,
    /// Raw sharpness score, kept so decisions could be re-derived later
    pub score: f64,
    pub computed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Record a fresh classification of `score` against `threshold`
    pub fn classify(asset_id: AssetId, threshold: f64, score: f64) -> Self {
        Self {
            asset_id,
            threshold,
            is_blurry: is_blurry(score, threshold),
            score,
            computed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.asset_id.clone(), self.threshold)
    }
}

/// Emitted once per completed page, in page order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub page_index: usize,
    /// Blurry assets of this page, in listing order
    pub blurry_ids: Vec<AssetId>,
    pub total_assets: usize,
    pub processed: usize,
}
