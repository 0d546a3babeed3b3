#![warn(missing_docs)]
//! Core library for the boothlens visual-similarity search service:
//! idempotent image ingestion into a vector index plus filtered,
//! listing-deduplicated search.

pub mod embedder;
pub mod ident;
pub mod index;
pub mod ingest;
pub mod listing;
pub mod progress;
pub mod search;

pub use ident::stable_id;
pub use index::{FilterSpec, VectorIndex, FACET_FIELDS};
pub use ingest::{run_ingest, IngestConfig, IngestReport};
pub use listing::{IndexPoint, ListingRecord, PointPayload, ScoredPoint};
pub use progress::{CancelFlag, IndexingProgress, ProgressSnapshot};
pub use search::{SearchError, SearchService, DEFAULT_SEARCH_LIMIT, OVERFETCH_FACTOR};

/// Vector width of the CLIP ViT-B/32 image embeddings the index stores.
/// Collection creation and every upsert/query must agree on it.
pub const EMBEDDING_DIMENSIONS: usize = 512;
