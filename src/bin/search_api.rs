use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use boothlens::embedder::clip::ClipHttpEmbedder;
use boothlens::embedder::ImageEmbedder;
use boothlens::ident::stable_content_id;
use boothlens::index::memory::MemoryIndex;
use boothlens::index::qdrant::QdrantIndex;
use boothlens::{
    run_ingest, CancelFlag, FilterSpec, IndexingProgress, IngestConfig, ProgressSnapshot,
    ScoredPoint, SearchError, SearchService, VectorIndex, DEFAULT_SEARCH_LIMIT,
    EMBEDDING_DIMENSIONS,
};
use clap::Parser;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "boothlens-api",
    about = "HTTP API for visual similarity search over indexed listings"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "BOOTHLENS_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Qdrant cluster URL; omitted = ephemeral in-process index.
    #[arg(long, env = "QDRANT_CLOUD_URL")]
    qdrant_url: Option<String>,

    /// API key for Qdrant Cloud clusters.
    #[arg(long, env = "QDRANT_CLOUD_API_KEY")]
    qdrant_api_key: Option<String>,

    /// Collection holding the image points.
    #[arg(long, env = "BOOTHLENS_COLLECTION", default_value = "booth_items")]
    collection: String,

    /// Seconds before Qdrant requests time out.
    #[arg(long, env = "BOOTHLENS_QDRANT_TIMEOUT_SECS", default_value_t = 30)]
    qdrant_timeout_secs: u64,

    /// CLIP image-embedding inference endpoint.
    #[arg(
        long,
        env = "BOOTHLENS_EMBED_ENDPOINT",
        default_value = "http://127.0.0.1:8100/embed/image"
    )]
    embed_endpoint: String,

    /// Optional bearer token for the embedding endpoint.
    #[arg(long, env = "BOOTHLENS_EMBED_API_KEY")]
    embed_api_key: Option<String>,

    /// Seconds before embedding requests time out.
    #[arg(long, env = "BOOTHLENS_EMBED_TIMEOUT_SECS", default_value_t = 30)]
    embed_timeout_secs: u64,

    /// Retry attempts for transient embedding errors.
    #[arg(long, env = "BOOTHLENS_EMBED_MAX_RETRIES", default_value_t = 3)]
    embed_max_retries: usize,

    /// Default result count when the client does not override it.
    #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
    default_limit: usize,

    /// Maximum result count allowed per request.
    #[arg(long, default_value_t = 50)]
    max_limit: usize,

    /// Newline-delimited file of opted-out shop names, applied to every
    /// search. The relational store owning opt-outs is external; this file
    /// is its hand-off.
    #[arg(long, env = "BOOTHLENS_OPT_OUT_FILE")]
    opt_out_file: Option<PathBuf>,

    /// Max cached query embeddings kept in-memory (0 disables caching).
    #[arg(long, default_value_t = 1024)]
    embedding_cache_size: usize,

    /// Max requests per minute allowed (0 disables rate limiting).
    #[arg(long, default_value_t = 120)]
    max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly).
    #[arg(long, default_value_t = 12)]
    rate_limit_burst: u32,

    /// Run a background ingestion of the metadata log at startup.
    #[arg(long, default_value_t = false)]
    seed: bool,

    /// Metadata log for `--seed` runs.
    #[arg(
        long,
        env = "BOOTHLENS_METADATA",
        default_value = "data/popular_items_full.jsonl"
    )]
    metadata: PathBuf,

    /// Image root for `--seed` runs.
    #[arg(long, env = "BOOTHLENS_IMAGE_ROOT", default_value = "data")]
    image_root: PathBuf,
}

#[derive(Clone)]
struct AppState {
    service: SearchService,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<ClipHttpEmbedder>,
    excluded_shops: Arc<Vec<String>>,
    default_limit: usize,
    max_limit: usize,
    embedding_cache: Option<Arc<Mutex<LruCache<Uuid, Vec<f32>>>>>,
    rate_limiter: Option<RateLimiter>,
    progress: IndexingProgress,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    category: Option<String>,
    /// Comma-separated avatar facet values.
    #[serde(default)]
    avatars: Option<String>,
    /// Comma-separated color facet values.
    #[serde(default)]
    colors: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    results: Vec<ScoredPoint>,
    meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
struct ResponseMeta {
    limit: usize,
    latency_ms: f64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    indexing: ProgressSnapshot,
    points: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = ApiCli::parse();

    let index: Arc<dyn VectorIndex> = match &cli.qdrant_url {
        Some(url) => Arc::new(QdrantIndex::new(
            url,
            cli.qdrant_api_key.as_deref(),
            &cli.collection,
            EMBEDDING_DIMENSIONS,
            Duration::from_secs(cli.qdrant_timeout_secs.max(1)),
        )?),
        None => {
            info!("no Qdrant URL configured, serving from an ephemeral in-process index");
            Arc::new(MemoryIndex::new(EMBEDDING_DIMENSIONS))
        }
    };
    index
        .ensure_ready()
        .await
        .context("vector index unavailable at startup")?;

    let embedder = Arc::new(ClipHttpEmbedder::new(
        cli.embed_endpoint.clone(),
        cli.embed_api_key.clone(),
        EMBEDDING_DIMENSIONS,
        Duration::from_secs(cli.embed_timeout_secs.max(1)),
        cli.embed_max_retries.max(1),
    )?);
    let excluded_shops = Arc::new(load_opt_outs(cli.opt_out_file.as_deref())?);
    if !excluded_shops.is_empty() {
        info!(shops = excluded_shops.len(), "loaded shop opt-out set");
    }

    let progress = IndexingProgress::new();
    let cancel = CancelFlag::new();
    if cli.seed {
        let config = IngestConfig {
            metadata_path: cli.metadata.clone(),
            image_root: cli.image_root.clone(),
            ..IngestConfig::default()
        };
        let index = Arc::clone(&index);
        let embedder = Arc::clone(&embedder) as Arc<dyn ImageEmbedder>;
        let progress = progress.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = run_ingest(&config, index, embedder, progress, cancel).await {
                error!(error = format!("{err:#}"), "background seeding failed");
            }
        });
    } else {
        // No run in this process; pollers should not wait on one.
        progress.mark_complete();
    }

    let state = AppState {
        service: SearchService::new(Arc::clone(&index)),
        index,
        embedder,
        excluded_shops,
        default_limit: cli.default_limit.max(1),
        max_limit: cli.max_limit.max(1),
        embedding_cache: build_cache(cli.embedding_cache_size),
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
        progress,
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status_handler))
        .route("/v1/search", post(search_handler))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    println!("boothlens-api listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        })
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let points = state.index.count().await.map_err(service_unavailable)?;
    Ok(Json(StatusResponse {
        indexing: state.progress.snapshot(),
        points,
    }))
}

async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
    body: Bytes,
) -> Result<Json<SearchResponse>, ApiError> {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.acquire().await {
            return Err(too_many_requests("rate limit exceeded"));
        }
    }
    if body.is_empty() {
        return Err(bad_request("request body must contain an image"));
    }
    let limit = params
        .limit
        .unwrap_or(state.default_limit)
        .clamp(1, state.max_limit);
    let start = Instant::now();

    let vector = embed_upload(&state, body)
        .await
        .map_err(|err| bad_request(format!("could not embed uploaded image: {err:#}")))?;

    let mut filter = FilterSpec::new().exclude_shops(state.excluded_shops.iter().cloned());
    if let Some(category) = params.category.filter(|c| !c.trim().is_empty()) {
        filter = filter.category(category.trim());
    }
    filter = filter
        .avatars(split_facet(params.avatars.as_deref()))
        .colors(split_facet(params.colors.as_deref()));

    let results = state
        .service
        .search(&vector, limit, &filter)
        .await
        .map_err(|err| match err {
            SearchError::BadVector { .. } => internal_error(anyhow!(err)),
            SearchError::Unavailable(inner) => service_unavailable(inner),
        })?;

    Ok(Json(SearchResponse {
        results,
        meta: ResponseMeta {
            limit,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        },
    }))
}

/// Embeds the uploaded image bytes, consulting the content-addressed cache
/// first so repeated uploads of the same photo skip the model round trip.
async fn embed_upload(state: &AppState, body: Bytes) -> Result<Vec<f32>> {
    let content_id = stable_content_id(&body);
    if let Some(cache) = &state.embedding_cache {
        if let Some(hit) = {
            let mut guard = cache.lock().await;
            guard.get(&content_id).cloned()
        } {
            return Ok(hit);
        }
    }

    let embedder = Arc::clone(&state.embedder);
    let vector = tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&body)
            .context("body is not a decodable image")?
            .to_rgb8();
        embedder.embed(&image)
    })
    .await
    .map_err(|err| anyhow!("embedding task join error: {err}"))??;

    if let Some(cache) = &state.embedding_cache {
        let mut guard = cache.lock().await;
        guard.put(content_id, vector.clone());
    }
    Ok(vector)
}

fn split_facet(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn load_opt_outs(path: Option<&std::path::Path>) -> Result<Vec<String>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read opt-out file {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn internal_error(err: anyhow::Error) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
}

fn service_unavailable(err: anyhow::Error) -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            message: format!("{err:#}"),
        }),
    )
}

fn too_many_requests(message: impl Into<String>) -> ApiError {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn build_cache(size: usize) -> Option<Arc<Mutex<LruCache<Uuid, Vec<f32>>>>> {
    NonZeroUsize::new(size).map(|capacity| Arc::new(Mutex::new(LruCache::new(capacity))))
}

#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        let capacity = burst as f64;
        let refill_per_sec = max_per_minute as f64 / 60.0;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec,
        })
    }

    async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
