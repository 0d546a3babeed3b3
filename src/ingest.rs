//! Ingestion pipeline: streams the scraped metadata log into vector-index
//! points, tolerating partial failure per listing and per image.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncBufReadExt;
use tokio::task::yield_now;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::embedder::ImageEmbedder;
use crate::ident::stable_id;
use crate::index::VectorIndex;
use crate::listing::{IndexPoint, ListingRecord};
use crate::progress::{CancelFlag, IndexingProgress};

/// Tunable knobs for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Newline-delimited JSON metadata log produced by the scraper.
    pub metadata_path: PathBuf,
    /// Root directory relative image references resolve against.
    pub image_root: PathBuf,
    /// Conventional subdirectory searched (by file name) when a relative
    /// reference is not found at its primary location.
    pub fallback_subdir: String,
    /// Bound on each remote image fetch.
    pub fetch_timeout: Duration,
    /// Fixed pause between per-image operations, polite to remote hosts
    /// and to the embedding hardware.
    pub image_throttle: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            metadata_path: PathBuf::from("data/popular_items_full.jsonl"),
            image_root: PathBuf::from("data"),
            fallback_subdir: "raw_images".to_string(),
            fetch_timeout: Duration::from_secs(10),
            image_throttle: Duration::from_millis(10),
        }
    }
}

/// Counters summarizing a finished ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Metadata lines that parsed as listing records.
    pub listings_seen: usize,
    /// Listings whose images were processed.
    pub listings_indexed: usize,
    /// Listings skipped: incomplete records or within-run duplicates.
    pub listings_skipped: usize,
    /// Images upserted into the index.
    pub images_indexed: usize,
    /// Images skipped after a per-image failure.
    pub images_skipped: usize,
    /// Whether the run stopped early on the cancel flag.
    pub cancelled: bool,
}

/// Runs one ingestion pass over the metadata log.
///
/// A missing log is a no-op, not an error. Malformed lines, unresolvable
/// image files, failed fetches, and embedding failures are logged and
/// skipped; only an unreachable index at startup or an unreadable log is
/// fatal. The progress handle is marked complete on every exit path so
/// pollers always observe termination.
pub async fn run_ingest(
    config: &IngestConfig,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn ImageEmbedder>,
    progress: IndexingProgress,
    cancel: CancelFlag,
) -> Result<IngestReport> {
    let result = drive(config, index, embedder, &progress, &cancel).await;
    progress.mark_complete();
    if let Ok(report) = &result {
        info!(
            listings = report.listings_indexed,
            images = report.images_indexed,
            skipped_images = report.images_skipped,
            cancelled = report.cancelled,
            "ingestion finished"
        );
    }
    result
}

async fn drive(
    config: &IngestConfig,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn ImageEmbedder>,
    progress: &IndexingProgress,
    cancel: &CancelFlag,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    if !config.metadata_path.exists() {
        info!(path = %config.metadata_path.display(), "no metadata log, nothing to ingest");
        return Ok(report);
    }

    index
        .ensure_ready()
        .await
        .context("vector index unavailable")?;

    progress.set_total(count_lines(&config.metadata_path).await?);

    let fetcher = reqwest::Client::builder()
        .timeout(config.fetch_timeout)
        .build()
        .context("failed to build image fetch client")?;

    let file = tokio::fs::File::open(&config.metadata_path)
        .await
        .with_context(|| format!("failed to open {}", config.metadata_path.display()))?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut seen_urls = std::collections::HashSet::new();
    let mut line_no = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("failed to read metadata line {}", line_no + 1))?
    {
        if cancel.is_cancelled() {
            info!(line = line_no, "ingestion cancelled");
            report.cancelled = true;
            break;
        }
        line_no += 1;
        progress.set_current(line_no);
        if line.trim().is_empty() {
            continue;
        }

        let record: ListingRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!(line = line_no, %err, "skipping malformed metadata line");
                continue;
            }
        };
        report.listings_seen += 1;

        if !record.is_indexable() {
            debug!(line = line_no, "skipping incomplete listing record");
            report.listings_skipped += 1;
            continue;
        }
        // Within-run duplicate lines only; across-run duplicates are
        // absorbed by the stable-id upsert.
        let url = record.url.clone().unwrap_or_default();
        if !seen_urls.insert(url.clone()) {
            debug!(line = line_no, url, "skipping duplicate listing url");
            report.listings_skipped += 1;
            continue;
        }

        for reference in &record.images {
            sleep(config.image_throttle).await;
            match index_one_image(config, &fetcher, &index, &embedder, &record, reference).await
            {
                Ok(()) => report.images_indexed += 1,
                Err(err) => {
                    warn!(image = reference, error = format!("{err:#}"), "skipping image");
                    report.images_skipped += 1;
                }
            }
        }

        progress.set_last_item(
            record
                .title
                .clone()
                .unwrap_or_else(|| url.clone()),
        );
        report.listings_indexed += 1;
        yield_now().await;
    }

    Ok(report)
}

/// Resolves, decodes, embeds, and upserts a single image reference.
/// Any error here is a per-image skip for the caller.
async fn index_one_image(
    config: &IngestConfig,
    fetcher: &reqwest::Client,
    index: &Arc<dyn VectorIndex>,
    embedder: &Arc<dyn ImageEmbedder>,
    record: &ListingRecord,
    reference: &str,
) -> Result<()> {
    let (bytes, thumbnail_url) = if is_remote(reference) {
        let response = fetcher
            .get(reference)
            .send()
            .await
            .with_context(|| format!("failed to fetch {reference}"))?;
        anyhow::ensure!(
            response.status().is_success(),
            "remote image fetch returned {}",
            response.status()
        );
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {reference}"))?;
        (bytes.to_vec(), reference.to_string())
    } else {
        let path = resolve_local(config, reference)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| reference.to_string());
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        (bytes, format!("/api/images/{file_name}"))
    };

    // The id comes from the original reference string, never from the
    // resolved path: the same logical image must hash identically no
    // matter which fallback location the file was found at.
    let id = stable_id(reference);
    let payload = record.payload(thumbnail_url);

    let embedder = Arc::clone(embedder);
    let vector = tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&bytes)
            .context("failed to decode image bytes")?
            .to_rgb8();
        embedder.embed(&image)
    })
    .await
    .context("embedding task join error")??;

    index
        .upsert(IndexPoint {
            id,
            vector,
            payload,
        })
        .await
}

fn is_remote(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Primary location first, then the conventional fallback subdirectory by
/// bare file name.
fn resolve_local(config: &IngestConfig, reference: &str) -> Result<PathBuf> {
    let primary = config.image_root.join(reference);
    if primary.exists() {
        return Ok(primary);
    }
    if let Some(file_name) = Path::new(reference).file_name() {
        let fallback = config
            .image_root
            .join(&config.fallback_subdir)
            .join(file_name);
        if fallback.exists() {
            return Ok(fallback);
        }
    }
    anyhow::bail!("image file not found for reference {reference}")
}

async fn count_lines(path: &Path) -> Result<usize> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut total = 0usize;
    while lines.next_line().await?.is_some() {
        total += 1;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use crate::index::FilterSpec;
    use image::RgbImage;
    use std::io::Write;

    const DIMS: usize = 4;

    /// Deterministic stand-in for the CLIP service.
    #[derive(Clone)]
    struct StubEmbedder;

    impl ImageEmbedder for StubEmbedder {
        fn dimensions(&self) -> usize {
            DIMS
        }

        fn embed(&self, image: &RgbImage) -> Result<Vec<f32>> {
            // First pixel steers the vector so tests can distinguish images.
            let lead = image.get_pixel(0, 0)[0] as f32 / 255.0;
            let mut vector = vec![0.0; DIMS];
            vector[0] = 1.0;
            vector[1] = lead;
            let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            Ok(vector.into_iter().map(|x| x / norm).collect())
        }
    }

    fn write_png(path: &Path, shade: u8) {
        let mut image = RgbImage::new(2, 2);
        for pixel in image.pixels_mut() {
            *pixel = image::Rgb([shade, shade, shade]);
        }
        image.save(path).expect("write png");
    }

    fn write_log(path: &Path, lines: &[&str]) {
        let mut file = std::fs::File::create(path).expect("create log");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
    }

    fn config(root: &Path) -> IngestConfig {
        IngestConfig {
            metadata_path: root.join("metadata.jsonl"),
            image_root: root.to_path_buf(),
            fallback_subdir: "raw_images".to_string(),
            fetch_timeout: Duration::from_secs(1),
            image_throttle: Duration::ZERO,
        }
    }

    async fn run(
        config: &IngestConfig,
        index: &Arc<MemoryIndex>,
    ) -> (IngestReport, IndexingProgress) {
        let progress = IndexingProgress::new();
        let report = run_ingest(
            config,
            Arc::clone(index) as Arc<dyn VectorIndex>,
            Arc::new(StubEmbedder),
            progress.clone(),
            CancelFlag::new(),
        )
        .await
        .expect("ingest run");
        (report, progress)
    }

    #[tokio::test]
    async fn missing_log_is_a_completed_noop() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryIndex::new(DIMS));
        let (report, progress) = run(&config(dir.path()), &index).await;

        assert_eq!(report, IngestReport::default());
        assert!(progress.snapshot().is_complete);
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_lines_do_not_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 10);
        write_png(&dir.path().join("b.png"), 200);
        write_log(
            &dir.path().join("metadata.jsonl"),
            &[
                r#"{"url": "https://booth.example/items/1", "title": "One", "images": ["a.png"]}"#,
                "{ this is not json",
                r#"{"url": "https://booth.example/items/2", "title": "Two", "images": ["b.png"]}"#,
            ],
        );

        let index = Arc::new(MemoryIndex::new(DIMS));
        let (report, progress) = run(&config(dir.path()), &index).await;

        assert_eq!(report.listings_indexed, 2);
        assert_eq!(report.images_indexed, 2);
        assert_eq!(index.count().await.unwrap(), 2);

        let snap = progress.snapshot();
        assert!(snap.is_complete);
        assert_eq!(snap.total, 3);
        assert_eq!(snap.current, 3);
        assert_eq!(snap.last_item.as_deref(), Some("Two"));
    }

    #[tokio::test]
    async fn rerunning_does_not_grow_the_index() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 10);
        write_png(&dir.path().join("b.png"), 90);
        write_log(
            &dir.path().join("metadata.jsonl"),
            &[
                r#"{"url": "https://booth.example/items/1", "images": ["a.png", "b.png"]}"#,
            ],
        );

        let index = Arc::new(MemoryIndex::new(DIMS));
        let cfg = config(dir.path());
        let (first, _) = run(&cfg, &index).await;
        assert_eq!(first.images_indexed, 2);
        let after_first = index.count().await.unwrap();

        let (second, _) = run(&cfg, &index).await;
        assert_eq!(second.images_indexed, 2);
        assert_eq!(index.count().await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn duplicate_listing_urls_skipped_within_run() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 10);
        write_png(&dir.path().join("b.png"), 90);
        write_log(
            &dir.path().join("metadata.jsonl"),
            &[
                r#"{"url": "https://booth.example/items/1", "images": ["a.png"]}"#,
                r#"{"url": "https://booth.example/items/1", "images": ["b.png"]}"#,
            ],
        );

        let index = Arc::new(MemoryIndex::new(DIMS));
        let (report, _) = run(&config(dir.path()), &index).await;

        assert_eq!(report.listings_indexed, 1);
        assert_eq!(report.listings_skipped, 1);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incomplete_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 10);
        write_log(
            &dir.path().join("metadata.jsonl"),
            &[
                r#"{"title": "no url", "images": ["a.png"]}"#,
                r#"{"url": "https://booth.example/items/1", "images": []}"#,
                r#"{"url": "https://booth.example/items/2", "images": ["a.png"]}"#,
            ],
        );

        let index = Arc::new(MemoryIndex::new(DIMS));
        let (report, _) = run(&config(dir.path()), &index).await;

        assert_eq!(report.listings_skipped, 2);
        assert_eq!(report.listings_indexed, 1);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fallback_directory_is_searched_and_id_uses_the_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("raw_images")).unwrap();
        // The reference names a directory that does not exist; the file is
        // only present under raw_images/ by bare file name.
        write_png(&dir.path().join("raw_images").join("x.png"), 50);
        write_log(
            &dir.path().join("metadata.jsonl"),
            &[r#"{"url": "https://booth.example/items/9", "images": ["imgs/x.png"]}"#],
        );

        let index = Arc::new(MemoryIndex::new(DIMS));
        let (report, _) = run(&config(dir.path()), &index).await;
        assert_eq!(report.images_indexed, 1);

        let hits = index
            .query(&[1.0, 0.0, 0.0, 0.0], &FilterSpec::new(), 1)
            .await
            .unwrap();
        assert_eq!(hits[0].id, stable_id("imgs/x.png"));
        assert_eq!(hits[0].payload.thumbnail_url, "/api/images/x.png");
    }

    #[tokio::test]
    async fn missing_image_only_skips_that_image() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 10);
        write_log(
            &dir.path().join("metadata.jsonl"),
            &[r#"{"url": "https://booth.example/items/1", "images": ["gone.png", "a.png"]}"#],
        );

        let index = Arc::new(MemoryIndex::new(DIMS));
        let (report, _) = run(&config(dir.path()), &index).await;

        assert_eq!(report.images_skipped, 1);
        assert_eq!(report.images_indexed, 1);
        assert_eq!(report.listings_indexed, 1);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 10);
        write_log(
            &dir.path().join("metadata.jsonl"),
            &[r#"{"url": "https://booth.example/items/1", "images": ["a.png"]}"#],
        );

        let index = Arc::new(MemoryIndex::new(DIMS));
        let progress = IndexingProgress::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = run_ingest(
            &config(dir.path()),
            Arc::clone(&index) as Arc<dyn VectorIndex>,
            Arc::new(StubEmbedder),
            progress.clone(),
            cancel,
        )
        .await
        .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.images_indexed, 0);
        assert!(progress.snapshot().is_complete);
    }
}
