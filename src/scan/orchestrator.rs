/// End-to-end blur scan driver
///
/// A scan lists the assets once, splits them into pages and works through
/// each page in two stages:
/// 1. Building: cache misses are fetched and turned into canonical frames,
///    at most `build_concurrency` at a time (permit pool A)
/// 2. Scoring: built frames are scored, at most `score_concurrency` calls in
///    flight (permit pool B), classified and written to the result cache
///
/// One `ProgressEvent` per page is pushed into a bounded channel, in page
/// order, followed by a `ScanEvent::Completed` summary. Dropping the
/// `ScanStream` cancels the scan: nothing new is dispatched, in-flight work
/// drains, and the cache is still flushed.

use super::paging::{self, Page};
use super::source::{AssetSource, SourceError};
use crate::config::{ConfigError, ScanConfig};
use crate::frame::{CanonicalFrame, CanonicalFrameBuilder, FillMode};
use crate::sharpness::SharpnessScorer;
use crate::state::{AssetId, CacheEntry, ProgressEvent, ResultCache};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;

/// Events buffered ahead of a slow consumer
const EVENT_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("page size must be positive")]
    InvalidPageSize,
    #[error("threshold must be a finite number, got {0}")]
    InvalidThreshold(f64),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to list assets: {0}")]
    Source(#[from] SourceError),
    #[error("a scan is already running")]
    AlreadyRunning,
    #[error("scan task failed: {0}")]
    Task(String),
}

/// Where a scan currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Idle,
    /// Listing assets and loading the cache
    Paging,
    Building { page: usize },
    Scoring { page: usize },
    /// Emitting a page's progress or the final summary
    Reporting,
    Done,
}

/// Final totals, delivered once after the last page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    pub total_assets: usize,
    pub processed: usize,
    pub cache_hits: usize,
    /// Assets skipped because no frame or no score could be produced
    pub failures: usize,
    /// Every blurry asset, in listing order
    pub blurry_ids: Vec<AssetId>,
    #[serde(skip)]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Progress(ProgressEvent),
    Completed(ScanSummary),
}

/// Finite, non-restartable stream of scan events
///
/// Dropping it cancels the scan.
#[derive(Debug)]
pub struct ScanStream {
    events: mpsc::Receiver<ScanEvent>,
    phase: watch::Receiver<ScanPhase>,
}

impl ScanStream {
    /// Next event, `None` once the scan is over
    pub async fn recv(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    pub fn phase(&self) -> ScanPhase {
        *self.phase.borrow()
    }

    /// Drain every remaining event and return the summary
    pub async fn finish(mut self) -> Option<ScanSummary> {
        while let Some(event) = self.events.recv().await {
            if let ScanEvent::Completed(summary) = event {
                return Some(summary);
            }
        }
        None
    }
}

impl Stream for ScanStream {
    type Item = ScanEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ScanEvent>> {
        self.get_mut().events.poll_recv(cx)
    }
}

/// Answers "has the consumer gone away?" between dispatches
#[derive(Clone, Copy)]
struct CancelProbe<'a>(Option<&'a mpsc::Sender<ScanEvent>>);

impl CancelProbe<'_> {
    fn never() -> Self {
        CancelProbe(None)
    }

    fn is_cancelled(&self) -> bool {
        self.0.is_some_and(|tx| tx.is_closed())
    }
}

struct BuiltFrame {
    slot: usize,
    asset_id: AssetId,
    frame: CanonicalFrame,
}

/// Tally of one stage over a set of assets
struct StageOutcome<T> {
    done: Vec<T>,
    failures: usize,
    cancelled: bool,
}

impl<T> Default for StageOutcome<T> {
    fn default() -> Self {
        Self {
            done: Vec::new(),
            failures: 0,
            cancelled: false,
        }
    }
}

struct PageOutcome {
    index: usize,
    len: usize,
    /// Blurry ids in listing order
    blurry: Vec<AssetId>,
    cache_hits: usize,
    failures: usize,
    cancelled: bool,
}

struct Inner {
    source: Arc<dyn AssetSource>,
    builder: CanonicalFrameBuilder,
    scorer: Arc<dyn SharpnessScorer>,
    cache: Arc<ResultCache>,
    build_permits: Arc<Semaphore>,
    score_permits: Arc<Semaphore>,
    config: ScanConfig,
    /// Held by the running scan, so two scans never share the cache
    scan_gate: Arc<Mutex<()>>,
}

/// Drives scans over one asset source, one scorer and one result cache
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

// Manual Debug implementation (trait objects don't implement Debug)
impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("scorer", &self.inner.scorer.name())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl BatchOrchestrator {
    pub fn new(
        source: Arc<dyn AssetSource>,
        scorer: Arc<dyn SharpnessScorer>,
        cache: Arc<ResultCache>,
        config: ScanConfig,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                source,
                builder: CanonicalFrameBuilder::new(config.max_decode_bytes),
                scorer,
                cache,
                build_permits: Arc::new(Semaphore::new(config.build_concurrency)),
                score_permits: Arc::new(Semaphore::new(config.score_concurrency)),
                config,
                scan_gate: Arc::new(Mutex::new(())),
            }),
        })
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.inner.cache
    }

    /// Scan the whole library
    ///
    /// Argument errors, listing failures and a concurrent scan are reported
    /// here, before any page starts. Everything after that is per-asset and
    /// only shows up as a missing result.
    pub async fn scan_all(
        &self,
        page_size: usize,
        threshold: f64,
        force_refresh: bool,
    ) -> Result<ScanStream, ScanError> {
        let page_size = NonZeroUsize::new(page_size).ok_or(ScanError::InvalidPageSize)?;
        validate_threshold(threshold)?;
        let gate = Arc::clone(&self.inner.scan_gate)
            .try_lock_owned()
            .map_err(|_| ScanError::AlreadyRunning)?;

        let (phase_tx, phase_rx) = watch::channel(ScanPhase::Idle);
        phase_tx.send_replace(ScanPhase::Paging);
        let inner = Arc::clone(&self.inner);

        let source = Arc::clone(&inner.source);
        let order = inner.config.sort_order;
        let listed = tokio::task::spawn_blocking(move || source.list_assets(order))
            .await
            .map_err(|e| ScanError::Task(e.to_string()))??;
        let assets = paging::dedupe(listed);

        let cache = Arc::clone(&inner.cache);
        let loaded = tokio::task::spawn_blocking(move || cache.load_all())
            .await
            .map_err(|e| ScanError::Task(e.to_string()))?;

        tracing::info!(
            assets = assets.len(),
            page_size = page_size.get(),
            threshold,
            force_refresh,
            cached = loaded,
            scorer = inner.scorer.name(),
            "starting scan"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let pages = paging::partition(assets, page_size);
        tokio::spawn(inner.run_scan(gate, pages, threshold, force_refresh, tx, phase_tx));

        Ok(ScanStream {
            events: rx,
            phase: phase_rx,
        })
    }

    /// Classify an explicit set of assets, bypassing paging and the cache
    ///
    /// Repeated ids are checked once. Returns the blurry ones in input order;
    /// unavailable or unscorable assets are left out.
    pub async fn scan_subset(
        &self,
        ids: Vec<AssetId>,
        threshold: f64,
    ) -> Result<Vec<AssetId>, ScanError> {
        validate_threshold(threshold)?;
        let ids = paging::dedupe(ids);
        let total = ids.len();

        let built = self
            .inner
            .build_frames(ids.into_iter().enumerate().collect(), CancelProbe::never())
            .await;
        let scored = self
            .inner
            .score_frames(built.done, threshold, None, CancelProbe::never())
            .await;

        let mut blurry: Vec<(usize, AssetId)> = scored
            .done
            .into_iter()
            .filter(|(_, entry)| entry.is_blurry)
            .map(|(slot, entry)| (slot, entry.asset_id))
            .collect();
        blurry.sort_by_key(|(slot, _)| *slot);

        tracing::info!(
            assets = total,
            blurry = blurry.len(),
            failures = built.failures + scored.failures,
            "subset check finished"
        );
        Ok(blurry.into_iter().map(|(_, id)| id).collect())
    }
}

fn validate_threshold(threshold: f64) -> Result<(), ScanError> {
    if threshold.is_finite() {
        Ok(())
    } else {
        Err(ScanError::InvalidThreshold(threshold))
    }
}

impl Inner {
    async fn run_scan(
        self: Arc<Self>,
        _gate: OwnedMutexGuard<()>,
        pages: Vec<Page>,
        threshold: f64,
        force_refresh: bool,
        tx: mpsc::Sender<ScanEvent>,
        phase: watch::Sender<ScanPhase>,
    ) {
        let started = Instant::now();
        let total_assets: usize = pages.iter().map(Page::len).sum();
        let phase = Arc::new(phase);

        // `buffered` yields pages in order even when several are in flight
        let mut outcomes = stream::iter(pages)
            .map(|page| {
                let inner = Arc::clone(&self);
                let tx = tx.clone();
                let phase = Arc::clone(&phase);
                async move {
                    inner
                        .scan_page(page, threshold, force_refresh, &tx, &phase)
                        .await
                }
            })
            .buffered(self.config.page_concurrency);

        let mut summary = ScanSummary {
            total_assets,
            processed: 0,
            cache_hits: 0,
            failures: 0,
            blurry_ids: Vec::new(),
            elapsed: Duration::ZERO,
        };
        let mut cancelled = false;

        while let Some(outcome) = outcomes.next().await {
            if outcome.cancelled {
                cancelled = true;
                break;
            }
            phase.send_replace(ScanPhase::Reporting);
            summary.processed += outcome.len;
            summary.cache_hits += outcome.cache_hits;
            summary.failures += outcome.failures;
            summary.blurry_ids.extend(outcome.blurry.iter().cloned());

            tracing::info!(
                page = outcome.index,
                blurry = outcome.blurry.len(),
                processed = summary.processed,
                total = total_assets,
                "page finished"
            );

            let event = ProgressEvent {
                page_index: outcome.index,
                blurry_ids: outcome.blurry,
                total_assets,
                processed: summary.processed,
            };
            if tx.send(ScanEvent::Progress(event)).await.is_err() {
                cancelled = true;
                break;
            }
        }
        // Stop polling any overlapped pages before flushing
        drop(outcomes);

        self.flush_cache().await;
        summary.elapsed = started.elapsed();

        if cancelled {
            tracing::info!(processed = summary.processed, "scan cancelled by consumer");
        } else {
            tracing::info!(
                processed = summary.processed,
                blurry = summary.blurry_ids.len(),
                cache_hits = summary.cache_hits,
                failures = summary.failures,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "scan complete"
            );
            phase.send_replace(ScanPhase::Reporting);
            let _ = tx.send(ScanEvent::Completed(summary)).await;
        }
        phase.send_replace(ScanPhase::Done);
    }

    async fn flush_cache(&self) {
        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || cache.flush_all()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to persist result cache"),
            Err(e) => tracing::warn!(error = %e, "cache flush task failed"),
        }
    }

    async fn scan_page(
        &self,
        page: Page,
        threshold: f64,
        force_refresh: bool,
        tx: &mpsc::Sender<ScanEvent>,
        phase: &watch::Sender<ScanPhase>,
    ) -> PageOutcome {
        let probe = CancelProbe(Some(tx));
        let mut outcome = PageOutcome {
            index: page.index,
            len: page.len(),
            blurry: Vec::new(),
            cache_hits: 0,
            failures: 0,
            cancelled: false,
        };
        if probe.is_cancelled() {
            outcome.cancelled = true;
            return outcome;
        }

        let mut blurry: Vec<(usize, AssetId)> = Vec::new();
        let mut misses = Vec::new();
        for (slot, asset_id) in page.assets.into_iter().enumerate() {
            let hit = if force_refresh {
                None
            } else {
                self.cache.lookup(&asset_id, threshold)
            };
            match hit {
                Some(entry) => {
                    outcome.cache_hits += 1;
                    if entry.is_blurry {
                        blurry.push((slot, asset_id));
                    }
                }
                None => misses.push((slot, asset_id)),
            }
        }

        phase.send_replace(ScanPhase::Building { page: page.index });
        let built = self.build_frames(misses, probe).await;

        phase.send_replace(ScanPhase::Scoring { page: page.index });
        let scored = self
            .score_frames(built.done, threshold, Some(&self.cache), probe)
            .await;

        blurry.extend(
            scored
                .done
                .into_iter()
                .filter(|(_, entry)| entry.is_blurry)
                .map(|(slot, entry)| (slot, entry.asset_id)),
        );
        blurry.sort_by_key(|(slot, _)| *slot);

        outcome.blurry = blurry.into_iter().map(|(_, id)| id).collect();
        outcome.failures = built.failures + scored.failures;
        outcome.cancelled = built.cancelled || scored.cancelled;
        outcome
    }

    /// Fetch and build frames under permit pool A
    async fn build_frames(
        &self,
        work: Vec<(usize, AssetId)>,
        probe: CancelProbe<'_>,
    ) -> StageOutcome<BuiltFrame> {
        let mut outcome = StageOutcome::default();
        let mut tasks = JoinSet::new();
        let (size, fill) = (self.config.frame_size, self.config.fill_mode);

        for (slot, asset_id) in work {
            if probe.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let Ok(permit) = Arc::clone(&self.build_permits).acquire_owned().await else {
                break;
            };
            let source = Arc::clone(&self.source);
            let builder = self.builder.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let frame = build_one(source.as_ref(), &builder, &asset_id, size, fill);
                (slot, asset_id, frame)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, asset_id, Some(frame))) => outcome.done.push(BuiltFrame {
                    slot,
                    asset_id,
                    frame,
                }),
                Ok((_, asset_id, None)) => {
                    tracing::debug!(asset = %asset_id, "no frame, skipping asset");
                    outcome.failures += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "frame build task failed");
                    outcome.failures += 1;
                }
            }
        }
        outcome
    }

    /// Score frames under permit pool B; successful scores go to `cache` when given
    async fn score_frames(
        &self,
        frames: Vec<BuiltFrame>,
        threshold: f64,
        cache: Option<&Arc<ResultCache>>,
        probe: CancelProbe<'_>,
    ) -> StageOutcome<(usize, CacheEntry)> {
        let mut outcome = StageOutcome::default();
        let mut tasks = JoinSet::new();

        for built in frames {
            if probe.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let Ok(permit) = Arc::clone(&self.score_permits).acquire_owned().await else {
                break;
            };
            let scorer = Arc::clone(&self.scorer);
            let cache = cache.map(Arc::clone);
            tasks.spawn(async move {
                let _permit = permit;
                let BuiltFrame {
                    slot,
                    asset_id,
                    frame,
                } = built;
                let started = Instant::now();
                match scorer.score(frame).await {
                    Ok(score) => {
                        let entry = CacheEntry::classify(asset_id, threshold, score);
                        tracing::debug!(
                            asset = %entry.asset_id,
                            score,
                            blurry = entry.is_blurry,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "asset scored"
                        );
                        if let Some(cache) = cache {
                            cache.store(entry.clone());
                        }
                        Some((slot, entry))
                    }
                    Err(e) => {
                        tracing::debug!(
                            asset = %asset_id,
                            error = %e,
                            "scoring failed, skipping asset"
                        );
                        None
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(scored)) => outcome.done.push(scored),
                Ok(None) => outcome.failures += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "scoring task failed");
                    outcome.failures += 1;
                }
            }
        }
        outcome
    }
}

fn build_one(
    source: &dyn AssetSource,
    builder: &CanonicalFrameBuilder,
    asset_id: &AssetId,
    size: u32,
    fill: FillMode,
) -> Option<CanonicalFrame> {
    let Some(image) = source.fetch_source_image(asset_id) else {
        tracing::debug!(asset = %asset_id, "asset unavailable");
        return None;
    };
    builder.build(&image, size, fill)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SourceImage;
    use crate::scan::source::{MemorySource, SortOrder};
    use crate::sharpness::{CpuSharpnessEngine, EngineError};
    use crate::state::{KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const THRESHOLD: f64 = 0.01;

    fn flat() -> SourceImage {
        SourceImage::Decoded(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            48,
            48,
            Rgba([120, 120, 120, 255]),
        )))
    }

    fn sharp() -> SourceImage {
        SourceImage::Decoded(DynamicImage::ImageRgba8(RgbaImage::from_fn(48, 48, |x, y| {
            if (x / 6 + y / 6) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        })))
    }

    /// Counts fetches so tests can tell cache hits from recomputation, and
    /// tracks how many builds overlap (each fetch is slowed down a little)
    struct CountingSource {
        inner: MemorySource,
        fetches: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl CountingSource {
        fn new(inner: MemorySource) -> Self {
            Self {
                inner,
                fetches: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        fn peak_builds(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    impl AssetSource for CountingSource {
        fn list_assets(&self, order: SortOrder) -> Result<Vec<AssetId>, SourceError> {
            self.inner.list_assets(order)
        }

        fn fetch_source_image(&self, id: &AssetId) -> Option<SourceImage> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(3));
            let image = self.inner.fetch_source_image(id);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            image
        }
    }

    /// CPU engine with a call counter and an optional per-call delay
    struct CountingScorer {
        engine: CpuSharpnessEngine,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl CountingScorer {
        fn new(delay: Duration) -> Self {
            Self {
                engine: CpuSharpnessEngine::default(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                delay,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SharpnessScorer for CountingScorer {
        async fn score(&self, frame: CanonicalFrame) -> Result<f64, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let result = self.engine.score(frame).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn name(&self) -> &'static str {
            "counting-cpu"
        }
    }

    struct Harness {
        orchestrator: BatchOrchestrator,
        source: Arc<CountingSource>,
        scorer: Arc<CountingScorer>,
        store: Arc<MemoryStore>,
    }

    fn test_config() -> ScanConfig {
        ScanConfig {
            frame_size: 32,
            build_concurrency: 3,
            score_concurrency: 2,
            ..Default::default()
        }
    }

    fn harness(assets: Vec<(&str, Option<SourceImage>)>, delay: Duration) -> Harness {
        let mut memory = MemorySource::new();
        for (id, image) in assets {
            memory.insert(id, image);
        }
        let source = Arc::new(CountingSource::new(memory));
        let scorer = Arc::new(CountingScorer::new(delay));
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(ResultCache::new(store.clone(), "test.results"));
        let orchestrator = BatchOrchestrator::new(
            source.clone(),
            scorer.clone(),
            cache,
            test_config(),
        )
        .unwrap();
        Harness {
            orchestrator,
            source,
            scorer,
            store,
        }
    }

    /// 10 assets; 2, 5 and 9 are flat (blurry), the rest sharp
    fn ten_assets() -> Vec<(&'static str, Option<SourceImage>)> {
        const IDS: [&str; 10] = ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8", "a9"];
        IDS.iter()
            .enumerate()
            .map(|(i, id)| (*id, Some(if [2, 5, 9].contains(&i) { flat() } else { sharp() })))
            .collect()
    }

    async fn collect(mut stream: ScanStream) -> (Vec<ProgressEvent>, ScanSummary) {
        let mut progress = Vec::new();
        while let Some(event) = stream.recv().await {
            match event {
                ScanEvent::Progress(p) => progress.push(p),
                ScanEvent::Completed(summary) => {
                    assert!(stream.recv().await.is_none());
                    return (progress, summary);
                }
            }
        }
        panic!("stream ended without a summary");
    }

    async fn scan(
        orchestrator: &BatchOrchestrator,
        page_size: usize,
        force_refresh: bool,
    ) -> (Vec<ProgressEvent>, ScanSummary) {
        let stream = orchestrator
            .scan_all(page_size, THRESHOLD, force_refresh)
            .await
            .unwrap();
        collect(stream).await
    }

    fn ids(names: &[&str]) -> Vec<AssetId> {
        names.iter().map(|n| AssetId::from(*n)).collect()
    }

    #[tokio::test]
    async fn test_pages_progress_and_blurry_ids() {
        let h = harness(ten_assets(), Duration::ZERO);
        let stream = h.orchestrator.scan_all(4, THRESHOLD, false).await.unwrap();
        let (progress, summary) = collect(stream).await;

        assert_eq!(progress.len(), 3);
        assert_eq!(
            progress.iter().map(|p| p.page_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            progress.iter().map(|p| p.processed).collect::<Vec<_>>(),
            vec![4, 8, 10]
        );
        assert!(progress.iter().all(|p| p.total_assets == 10));
        assert_eq!(progress[0].blurry_ids, ids(&["a2"]));
        assert_eq!(progress[1].blurry_ids, ids(&["a5"]));
        assert_eq!(progress[2].blurry_ids, ids(&["a9"]));

        assert_eq!(summary.blurry_ids, ids(&["a2", "a5", "a9"]));
        assert_eq!(summary.processed, 10);
        assert_eq!(summary.failures, 0);
        assert_eq!(h.scorer.calls(), 10);
        assert!(h.scorer.peak_in_flight.load(Ordering::SeqCst) <= 2);
        let peak_builds = h.source.peak_builds();
        assert!((1..=3).contains(&peak_builds), "{peak_builds} builds overlapped");
    }

    #[tokio::test]
    async fn test_failed_asset_is_skipped_and_not_cached() {
        let mut assets = ten_assets();
        assets[3].1 = Some(SourceImage::Encoded(b"corrupt".to_vec()));
        assets[7].1 = None;
        let h = harness(assets, Duration::ZERO);

        let stream = h.orchestrator.scan_all(4, THRESHOLD, false).await.unwrap();
        let (progress, summary) = collect(stream).await;

        assert_eq!(progress.last().unwrap().processed, 10);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.blurry_ids, ids(&["a2", "a5", "a9"]));
        assert_eq!(h.scorer.calls(), 8);

        let cache = h.orchestrator.cache();
        assert!(cache.lookup(&AssetId::from("a3"), THRESHOLD).is_none());
        assert!(cache.lookup(&AssetId::from("a7"), THRESHOLD).is_none());
        assert_eq!(cache.len(), 8);
    }

    #[tokio::test]
    async fn test_second_scan_is_answered_from_cache() {
        let h = harness(ten_assets(), Duration::ZERO);
        let (first_progress, first) = scan(&h.orchestrator, 4, false).await;
        let first_entries: Vec<_> = (0..10)
            .map(|i| h.orchestrator.cache().lookup(&AssetId::new(format!("a{i}")), THRESHOLD))
            .collect();
        assert!(h.store.read_blob("test.results").unwrap().is_some());

        let fetches = h.source.fetches.load(Ordering::SeqCst);
        let (second_progress, second) = scan(&h.orchestrator, 4, false).await;

        assert_eq!(h.source.fetches.load(Ordering::SeqCst), fetches);
        assert_eq!(h.scorer.calls(), 10);
        assert_eq!(second.cache_hits, 10);
        assert_eq!(second.blurry_ids, first.blurry_ids);
        assert_eq!(second_progress, first_progress);

        let second_entries: Vec<_> = (0..10)
            .map(|i| h.orchestrator.cache().lookup(&AssetId::new(format!("a{i}")), THRESHOLD))
            .collect();
        assert_eq!(second_entries, first_entries);

        // A different threshold is a different key
        let (_, third) = collect(h.orchestrator.scan_all(4, 0.02, false).await.unwrap()).await;
        assert_eq!(third.cache_hits, 0);
        assert_eq!(h.scorer.calls(), 20);
    }

    #[tokio::test]
    async fn test_force_refresh_overrides_stale_entry() {
        let h = harness(ten_assets(), Duration::ZERO);
        let cache = h.orchestrator.cache();
        cache.store(CacheEntry::classify(AssetId::from("a2"), THRESHOLD, 500.0));
        cache.flush_all().unwrap();

        // Without a refresh the stale "sharp" decision stands
        let (_, cached) = scan(&h.orchestrator, 4, false).await;
        assert_eq!(cached.blurry_ids, ids(&["a5", "a9"]));
        assert_eq!(cached.cache_hits, 1);

        let (_, fresh) = scan(&h.orchestrator, 4, true).await;
        assert_eq!(fresh.blurry_ids, ids(&["a2", "a5", "a9"]));
        assert_eq!(fresh.cache_hits, 0);
        assert_eq!(h.scorer.calls(), 9 + 10);

        let entry = cache.lookup(&AssetId::from("a2"), THRESHOLD).unwrap();
        assert!(entry.is_blurry);
        assert!(entry.score < THRESHOLD);
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_before_work() {
        let h = harness(ten_assets(), Duration::ZERO);
        assert!(matches!(
            h.orchestrator.scan_all(0, THRESHOLD, false).await,
            Err(ScanError::InvalidPageSize)
        ));
        assert!(matches!(
            h.orchestrator.scan_all(4, f64::NAN, false).await,
            Err(ScanError::InvalidThreshold(_))
        ));
        assert!(matches!(
            h.orchestrator.scan_subset(ids(&["a1"]), f64::INFINITY).await,
            Err(ScanError::InvalidThreshold(_))
        ));
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(h.scorer.calls(), 0);

        let bad = ScanConfig {
            build_concurrency: 0,
            ..test_config()
        };
        let cache = Arc::new(ResultCache::new(Arc::new(MemoryStore::new()), "x"));
        assert!(matches!(
            BatchOrchestrator::new(h.source.clone(), h.scorer.clone(), cache, bad),
            Err(ScanError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_library_completes() {
        let h = harness(Vec::new(), Duration::ZERO);
        let (progress, summary) = scan(&h.orchestrator, 4, false).await;
        assert!(progress.is_empty());
        assert_eq!(summary.total_assets, 0);
        assert!(summary.blurry_ids.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_the_stream_cancels() {
        let names: Vec<String> = (0..20).map(|i| format!("p{i}")).collect();
        let assets = names.iter().map(|n| (n.as_str(), Some(sharp()))).collect();
        let h = harness(assets, Duration::from_millis(25));

        let mut stream = h.orchestrator.scan_all(1, THRESHOLD, false).await.unwrap();
        assert!(matches!(stream.recv().await, Some(ScanEvent::Progress(_))));
        assert!(matches!(
            h.orchestrator.scan_all(1, THRESHOLD, false).await,
            Err(ScanError::AlreadyRunning)
        ));
        drop(stream);

        // The driver notices, drains, flushes and releases the scan gate
        let mut restarted = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(stream) = h.orchestrator.scan_all(1, THRESHOLD, false).await {
                restarted = Some(stream);
                break;
            }
        }
        let restarted = restarted.expect("scan gate was never released");
        let calls_before_restart = h.scorer.calls();
        assert!(calls_before_restart < 20, "{calls_before_restart} assets scored after cancel");

        // Work finished before the cancel was persisted and is reused
        let summary = restarted.finish().await.unwrap();
        assert!(summary.cache_hits >= 1);
        assert_eq!(summary.processed, 20);
    }

    #[tokio::test]
    async fn test_overlapping_pages_keep_order() {
        let h = harness(ten_assets(), Duration::from_millis(5));
        let orchestrator = BatchOrchestrator::new(
            h.source.clone(),
            h.scorer.clone(),
            h.orchestrator.cache().clone(),
            ScanConfig {
                page_concurrency: 3,
                ..test_config()
            },
        )
        .unwrap();

        let (progress, summary) = scan(&orchestrator, 2, false).await;
        assert_eq!(
            progress.iter().map(|p| p.page_index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(summary.blurry_ids, ids(&["a2", "a5", "a9"]));
        // Overlap never lifts either ceiling
        assert!(h.scorer.peak_in_flight.load(Ordering::SeqCst) <= 2);
        let peak_builds = h.source.peak_builds();
        assert!(peak_builds <= 3, "{peak_builds} builds overlapped");
    }

    #[tokio::test]
    async fn test_subset_check() {
        let h = harness(ten_assets(), Duration::ZERO);
        let blurry = h
            .orchestrator
            .scan_subset(ids(&["a9", "a1", "a2", "a9", "missing", "a5"]), THRESHOLD)
            .await
            .unwrap();

        assert_eq!(blurry, ids(&["a9", "a2", "a5"]));
        // Duplicate checked once, missing asset never scored
        assert_eq!(h.scorer.calls(), 4);
        assert!(h.orchestrator.cache().is_empty());
    }

    #[tokio::test]
    async fn test_phase_reaches_done() {
        let h = harness(ten_assets(), Duration::ZERO);
        let mut stream = h.orchestrator.scan_all(5, THRESHOLD, false).await.unwrap();
        assert_ne!(stream.phase(), ScanPhase::Idle);
        while stream.recv().await.is_some() {}
        // Sender is dropped only after the final phase update
        assert_eq!(stream.phase(), ScanPhase::Done);
    }
}
