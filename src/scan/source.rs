/// Asset sources: where scan identities and their pixels come from
///
/// The orchestrator only sees the `AssetSource` trait. `FolderSource` walks
/// a directory tree on disk; `MemorySource` holds images supplied directly.

use crate::frame::{embedded, SourceImage};
use crate::state::AssetId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use walkdir::WalkDir;

/// Regular image extensions the decoder handles
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "tif", "tiff", "bmp", "gif",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Listing order of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Most recently modified first
    #[default]
    NewestFirst,
    OldestFirst,
    /// Lexicographic by identity
    Name,
}

/// Capability the orchestrator needs from an asset library
///
/// Both calls are synchronous; the orchestrator runs them on blocking threads.
pub trait AssetSource: Send + Sync {
    /// Every asset identity, in `order`
    fn list_assets(&self, order: SortOrder) -> Result<Vec<AssetId>, SourceError>;

    /// Handle to the pixels of one asset, `None` when it is unavailable
    fn fetch_source_image(&self, id: &AssetId) -> Option<SourceImage>;
}

/// Check if a path has an extension the frame builder can read
pub fn is_supported_path(path: &Path) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    let ext = ext.to_string_lossy().to_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str()) || embedded::is_raw_path(path)
}

/// Images under a directory, recursively. Asset identities are file paths.
#[derive(Debug, Clone)]
pub struct FolderSource {
    root: PathBuf,
}

impl FolderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetSource for FolderSource {
    fn list_assets(&self, order: SortOrder) -> Result<Vec<AssetId>, SourceError> {
        let meta = std::fs::metadata(&self.root).map_err(|source| SourceError::Io {
            path: self.root.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(SourceError::NotADirectory(self.root.clone()));
        }

        let mut found: Vec<(SystemTime, PathBuf)> = WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_supported_path(entry.path()))
            .map(|entry| {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, entry.into_path())
            })
            .collect();

        match order {
            // Ties fall back to the path so listings are stable
            SortOrder::NewestFirst => {
                found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)))
            }
            SortOrder::OldestFirst => found.sort(),
            SortOrder::Name => found.sort_by(|a, b| a.1.cmp(&b.1)),
        }

        tracing::debug!(root = %self.root.display(), assets = found.len(), "folder listed");
        Ok(found
            .into_iter()
            .map(|(_, path)| AssetId::new(path.to_string_lossy()))
            .collect())
    }

    fn fetch_source_image(&self, id: &AssetId) -> Option<SourceImage> {
        let path = PathBuf::from(id.as_str());
        // Vanished since listing, or never ours
        if !path.is_file() {
            return None;
        }
        Some(SourceImage::Path(path))
    }
}

/// In-memory assets, listed in insertion order
///
/// Memory assets carry no timestamps: both time orders keep insertion
/// order, `Name` sorts by identity.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    order: Vec<AssetId>,
    images: HashMap<AssetId, SourceImage>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an asset; `None` registers an identity whose pixels are unavailable
    pub fn insert(&mut self, id: impl Into<AssetId>, image: Option<SourceImage>) {
        let id = id.into();
        self.order.push(id.clone());
        match image {
            Some(image) => {
                self.images.insert(id, image);
            }
            None => {
                self.images.remove(&id);
            }
        }
    }
}

impl AssetSource for MemorySource {
    fn list_assets(&self, order: SortOrder) -> Result<Vec<AssetId>, SourceError> {
        let mut ids = self.order.clone();
        if order == SortOrder::Name {
            ids.sort();
        }
        Ok(ids)
    }

    fn fetch_source_image(&self, id: &AssetId) -> Option<SourceImage> {
        self.images.get(id).cloned()
    }
}
