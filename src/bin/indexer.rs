use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use boothlens::embedder::clip::ClipHttpEmbedder;
use boothlens::index::memory::MemoryIndex;
use boothlens::index::qdrant::QdrantIndex;
use boothlens::{
    run_ingest, CancelFlag, IndexingProgress, IngestConfig, VectorIndex, EMBEDDING_DIMENSIONS,
};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "boothlens-indexer",
    about = "Index scraped listing images into the vector collection"
)]
struct IndexerCli {
    /// Newline-delimited JSON metadata log produced by the scraper
    #[arg(
        long,
        env = "BOOTHLENS_METADATA",
        default_value = "data/popular_items_full.jsonl"
    )]
    metadata: PathBuf,

    /// Root directory relative image references resolve against
    #[arg(long, env = "BOOTHLENS_IMAGE_ROOT", default_value = "data")]
    image_root: PathBuf,

    /// Fallback subdirectory searched by file name for missing images
    #[arg(long, env = "BOOTHLENS_FALLBACK_SUBDIR", default_value = "raw_images")]
    fallback_subdir: String,

    /// Qdrant cluster URL; omitted = ephemeral in-process index
    #[arg(long, env = "QDRANT_CLOUD_URL")]
    qdrant_url: Option<String>,

    /// API key for Qdrant Cloud clusters
    #[arg(long, env = "QDRANT_CLOUD_API_KEY")]
    qdrant_api_key: Option<String>,

    /// Collection holding the image points
    #[arg(long, env = "BOOTHLENS_COLLECTION", default_value = "booth_items")]
    collection: String,

    /// Seconds before Qdrant requests time out
    #[arg(long, env = "BOOTHLENS_QDRANT_TIMEOUT_SECS", default_value_t = 30)]
    qdrant_timeout_secs: u64,

    /// CLIP image-embedding inference endpoint
    #[arg(
        long,
        env = "BOOTHLENS_EMBED_ENDPOINT",
        default_value = "http://127.0.0.1:8100/embed/image"
    )]
    embed_endpoint: String,

    /// Optional bearer token for the embedding endpoint
    #[arg(long, env = "BOOTHLENS_EMBED_API_KEY")]
    embed_api_key: Option<String>,

    /// Seconds before embedding requests time out
    #[arg(long, env = "BOOTHLENS_EMBED_TIMEOUT_SECS", default_value_t = 30)]
    embed_timeout_secs: u64,

    /// Retry attempts for transient embedding errors
    #[arg(long, env = "BOOTHLENS_EMBED_MAX_RETRIES", default_value_t = 3)]
    embed_max_retries: usize,

    /// Seconds before each remote image fetch times out
    #[arg(long, env = "BOOTHLENS_FETCH_TIMEOUT_SECS", default_value_t = 10)]
    fetch_timeout_secs: u64,

    /// Milliseconds to pause between per-image operations
    #[arg(long, env = "BOOTHLENS_IMAGE_THROTTLE_MS", default_value_t = 10)]
    image_throttle_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = IndexerCli::parse();

    let index: Arc<dyn VectorIndex> = match &cli.qdrant_url {
        Some(url) => Arc::new(QdrantIndex::new(
            url,
            cli.qdrant_api_key.as_deref(),
            &cli.collection,
            EMBEDDING_DIMENSIONS,
            Duration::from_secs(cli.qdrant_timeout_secs.max(1)),
        )?),
        None => {
            info!("no Qdrant URL configured, indexing into an ephemeral in-process collection");
            Arc::new(MemoryIndex::new(EMBEDDING_DIMENSIONS))
        }
    };
    let embedder = Arc::new(ClipHttpEmbedder::new(
        cli.embed_endpoint.clone(),
        cli.embed_api_key.clone(),
        EMBEDDING_DIMENSIONS,
        Duration::from_secs(cli.embed_timeout_secs.max(1)),
        cli.embed_max_retries.max(1),
    )?);
    let config = IngestConfig {
        metadata_path: cli.metadata.clone(),
        image_root: cli.image_root.clone(),
        fallback_subdir: cli.fallback_subdir.clone(),
        fetch_timeout: Duration::from_secs(cli.fetch_timeout_secs.max(1)),
        image_throttle: Duration::from_millis(cli.image_throttle_ms),
    };

    let progress = IndexingProgress::new();
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, finishing current listing...");
                cancel.cancel();
            }
        });
    }
    let reporter = {
        let progress = progress.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let snap = progress.snapshot();
                if snap.is_complete {
                    break;
                }
                eprintln!(
                    "indexed {}/{} listings (last: {})...",
                    snap.current,
                    snap.total,
                    snap.last_item.as_deref().unwrap_or("-")
                );
            }
        })
    };

    let report = run_ingest(&config, index, embedder, progress, cancel)
        .await
        .context("ingestion run failed")?;
    reporter.await.ok();

    println!(
        "Indexing {}: {} image{} from {} listing{} ({} image{} skipped, {} listing{} skipped).",
        if report.cancelled {
            "cancelled"
        } else {
            "complete"
        },
        report.images_indexed,
        plural(report.images_indexed),
        report.listings_indexed,
        plural(report.listings_indexed),
        report.images_skipped,
        plural(report.images_skipped),
        report.listings_skipped,
        plural(report.listings_skipped),
    );
    Ok(())
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}
