//! Filtered similarity search with per-listing deduplication.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::index::{FilterSpec, VectorIndex};
use crate::listing::ScoredPoint;

/// Default number of unique listings a search returns.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Over-fetch multiplier applied before deduplication. A listing often
/// contributes several top-ranked images, so fetching exactly `limit`
/// candidates would under-fill results; 3x is a safety margin, not a
/// guarantee of a full page.
pub const OVERFETCH_FACTOR: usize = 3;

/// Errors surfaced by the search path.
#[derive(Debug)]
pub enum SearchError {
    /// The caller supplied a vector of the wrong width. Never retried.
    BadVector {
        /// Width the index was created with.
        expected: usize,
        /// Width the caller supplied.
        got: usize,
    },
    /// The index store could not serve the query; the caller should treat
    /// this as service-unavailable rather than an empty result.
    Unavailable(anyhow::Error),
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::BadVector { expected, got } => {
                write!(f, "query vector has {got} dimensions, index expects {expected}")
            }
            SearchError::Unavailable(err) => write!(f, "vector index unavailable: {err:#}"),
        }
    }
}

impl std::error::Error for SearchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SearchError::BadVector { .. } => None,
            SearchError::Unavailable(err) => Some(err.as_ref()),
        }
    }
}

/// Stateless query front over a vector index. Safe to share and call
/// concurrently, including while an ingestion run is writing.
#[derive(Clone)]
pub struct SearchService {
    index: Arc<dyn VectorIndex>,
}

impl SearchService {
    /// Wraps an index in the search contract.
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }

    /// Width query vectors must have.
    pub fn dimensions(&self) -> usize {
        self.index.dimensions()
    }

    /// Returns up to `limit` unique listings, best match first.
    ///
    /// Over-fetches [`OVERFETCH_FACTOR`] times the limit, keeps the first
    /// (highest-ranked) candidate per listing URL, and truncates. May
    /// return fewer than `limit` results when listing fan-out is high
    /// relative to the candidate pool.
    pub async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &FilterSpec,
    ) -> Result<Vec<ScoredPoint>, SearchError> {
        let expected = self.index.dimensions();
        if vector.len() != expected {
            return Err(SearchError::BadVector {
                expected,
                got: vector.len(),
            });
        }
        let limit = limit.max(1);
        let candidates = self
            .index
            .query(vector, filter, limit * OVERFETCH_FACTOR)
            .await
            .map_err(SearchError::Unavailable)?;

        let mut seen_urls = HashSet::new();
        let mut unique = Vec::with_capacity(limit);
        for hit in candidates {
            if seen_urls.insert(hit.payload.booth_url.clone()) {
                unique.push(hit);
            }
            if unique.len() >= limit {
                break;
            }
        }
        Ok(unique)
    }
}
