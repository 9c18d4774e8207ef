/// Library scanning
///
/// This module handles:
/// - Where assets come from (source.rs)
/// - Splitting a listing into pages (paging.rs)
/// - Driving build, score and cache work across pages (orchestrator.rs)

pub mod orchestrator;
pub mod paging;
pub mod source;

pub use orchestrator::{BatchOrchestrator, ScanError, ScanEvent, ScanPhase, ScanStream, ScanSummary};
pub use source::{AssetSource, FolderSource, MemorySource, SortOrder, SourceError};
