use anyhow::{Context, Result};
use blur_scan::config::{Backend, ScanConfig};
use blur_scan::scan::{BatchOrchestrator, FolderSource, ScanEvent};
use blur_scan::state::{MemoryStore, ResultCache, SqliteStore};
use blur_scan::{AssetId, CpuSharpnessEngine, GpuSharpnessEngine, SharpnessScorer};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "blur-scan")]
#[command(about = "Find blurry photos with a variance-of-Laplacian sharpness score")]
#[command(version)]
struct Cli {
    /// Settings file (default: <config_dir>/blur-scan/settings.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Result cache database (default: <data_dir>/blur-scan/blur_scan.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan every image under a folder, page by page
    Scan {
        folder: PathBuf,
        /// Assets scoring below this are blurry
        #[arg(short, long)]
        threshold: f64,
        #[arg(short, long, default_value = "50")]
        page_size: usize,
        /// Recompute every asset instead of answering from the cache
        #[arg(long)]
        force_refresh: bool,
        /// Score on the CPU instead of the GPU
        #[arg(long)]
        cpu: bool,
        /// Print the final summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check specific files, without paging or caching
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(short, long)]
        threshold: f64,
        #[arg(long)]
        cpu: bool,
    },
    /// Forget every cached result
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("blur_scan=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ScanConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load settings")?;

    match cli.command {
        Commands::Scan {
            folder,
            threshold,
            page_size,
            force_refresh,
            cpu,
            json,
        } => {
            let store = open_store(cli.db)?;
            println!("🗄️  Result cache: {}", store.path().display());
            let cache = Arc::new(ResultCache::new(Arc::new(store), config.cache_key.clone()));
            let scorer = create_scorer(&config, cpu).await?;
            let source = Arc::new(FolderSource::new(folder));
            println!("🔍 Scanning folder: {}", source.root().display());
            let orchestrator = BatchOrchestrator::new(source, scorer, cache, config)?;

            let mut stream = orchestrator
                .scan_all(page_size, threshold, force_refresh)
                .await
                .context("Scan failed to start")?;

            while let Some(event) = stream.recv().await {
                match event {
                    ScanEvent::Progress(progress) => {
                        println!(
                            "⏳ Page {}: {} blurry ({}/{} processed)",
                            progress.page_index + 1,
                            progress.blurry_ids.len(),
                            progress.processed,
                            progress.total_assets
                        );
                        for id in &progress.blurry_ids {
                            println!("   🌫️  {}", id);
                        }
                    }
                    ScanEvent::Completed(summary) => {
                        if json {
                            println!("{}", serde_json::to_string_pretty(&summary)?);
                        } else {
                            println!(
                                "✅ Scan complete: {} of {} blurry, {} from cache, {} skipped ({:.1}s)",
                                summary.blurry_ids.len(),
                                summary.processed,
                                summary.cache_hits,
                                summary.failures,
                                summary.elapsed.as_secs_f64()
                            );
                        }
                    }
                }
            }
        }
        Commands::Check {
            files,
            threshold,
            cpu,
        } => {
            // Subset checks never touch the persisted cache
            let cache = Arc::new(ResultCache::new(
                Arc::new(MemoryStore::new()),
                config.cache_key.clone(),
            ));
            let scorer = create_scorer(&config, cpu).await?;
            let source = Arc::new(FolderSource::new("."));
            let orchestrator = BatchOrchestrator::new(source, scorer, cache, config)?;

            let ids: Vec<AssetId> = files
                .iter()
                .map(|f| AssetId::new(f.to_string_lossy()))
                .collect();
            let blurry = orchestrator.scan_subset(ids.clone(), threshold).await?;

            for id in &ids {
                let marker = if blurry.contains(id) {
                    "🌫️  blurry"
                } else {
                    "✨ sharp or skipped"
                };
                println!("{}: {}", marker, id);
            }
            println!("📊 {} of {} blurry", blurry.len(), ids.len());
        }
        Commands::ClearCache => {
            let store = open_store(cli.db)?;
            let cache = ResultCache::new(Arc::new(store), config.cache_key);
            cache.clear();
            cache.flush_all().context("Failed to clear the result cache")?;
            println!("🧹 Result cache cleared");
        }
    }

    Ok(())
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore> {
    let store = match db {
        Some(path) => SqliteStore::open(&path),
        None => SqliteStore::open_default(),
    };
    store.context("Failed to open the result cache database")
}

/// GPU engine unless the CPU is requested; no adapter is a startup error
async fn create_scorer(config: &ScanConfig, force_cpu: bool) -> Result<Arc<dyn SharpnessScorer>> {
    let sharpness = config.sharpness();
    if force_cpu || config.backend == Backend::Cpu {
        println!("🧮 Scoring on the CPU");
        return Ok(Arc::new(CpuSharpnessEngine::new(&sharpness)?));
    }

    let engine = GpuSharpnessEngine::new(&sharpness)
        .await
        .context("GPU initialization failed (use --cpu to score on the CPU)")?;
    println!("🎨 Scoring on {}", engine.adapter_name());
    Ok(Arc::new(engine))
}
