//! Qdrant REST adapter for the vector index contract.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use super::{FilterSpec, VectorIndex, FACET_FIELDS};
use crate::listing::{IndexPoint, PointPayload, ScoredPoint};

/// Async client for a Qdrant collection, cloud or self-hosted.
///
/// Talks plain REST: collection bootstrap, keyword payload indexes on the
/// facet fields, single-point upserts, and filtered `points/query` searches.
pub struct QdrantIndex {
    http: Client,
    base_url: String,
    collection: String,
    dimensions: usize,
}

impl QdrantIndex {
    /// Builds a new Qdrant client.
    ///
    /// # Arguments
    /// * `base_url` - Cluster URL, e.g. `https://cluster-id.cloud.qdrant.io`
    /// * `api_key` - Optional value for the `api-key` header (cloud clusters)
    /// * `collection` - Collection holding the image points
    /// * `dimensions` - Vector width the collection is created with
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        collection: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "Qdrant URL must be an http(s) URL"
        );
        anyhow::ensure!(!collection.trim().is_empty(), "missing collection name");
        anyhow::ensure!(dimensions > 0, "vector dimensionality must be positive");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            headers.insert(
                "api-key",
                HeaderValue::from_str(key.trim()).context("invalid Qdrant API key")?,
            );
        }
        let http = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Qdrant HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            dimensions,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    async fn collection_exists(&self) -> Result<bool> {
        let response = self
            .http
            .get(self.collection_url(""))
            .send()
            .await
            .context("failed to reach Qdrant")?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => {
                let body = body_or_placeholder(response).await;
                anyhow::bail!("Qdrant collection lookup failed ({status}): {body}")
            }
        }
    }

    async fn create_collection(&self) -> Result<()> {
        let body = json!({
            "vectors": { "size": self.dimensions, "distance": "Cosine" }
        });
        let response = self
            .http
            .put(self.collection_url(""))
            .json(&body)
            .send()
            .await
            .context("failed to reach Qdrant")?;
        let status = response.status();
        anyhow::ensure!(
            status.is_success(),
            "Qdrant collection create failed ({status}): {}",
            body_or_placeholder(response).await
        );
        Ok(())
    }

    async fn create_payload_index(&self, field: &str) -> Result<()> {
        let body = json!({ "field_name": field, "field_schema": "keyword" });
        let response = self
            .http
            .put(self.collection_url("/index"))
            .json(&body)
            .send()
            .await
            .context("failed to reach Qdrant")?;
        if !response.status().is_success() {
            // An index that already exists is fine; anything else is worth
            // surfacing but must not block ingestion.
            warn!(
                field,
                status = %response.status(),
                "payload index creation not acknowledged"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn ensure_ready(&self) -> Result<()> {
        if !self.collection_exists().await? {
            self.create_collection().await?;
            for field in FACET_FIELDS {
                self.create_payload_index(field).await?;
            }
        }
        Ok(())
    }

    async fn upsert(&self, point: IndexPoint) -> Result<()> {
        anyhow::ensure!(
            point.vector.len() == self.dimensions,
            "point {} has {} dimensions, collection expects {}",
            point.id,
            point.vector.len(),
            self.dimensions
        );
        let body = json!({
            "points": [{
                "id": point.id,
                "vector": point.vector,
                "payload": point.payload,
            }]
        });
        let response = self
            .http
            .put(self.collection_url("/points?wait=true"))
            .json(&body)
            .send()
            .await
            .context("failed to reach Qdrant")?;
        let status = response.status();
        anyhow::ensure!(
            status.is_success(),
            "Qdrant upsert of {} failed ({status}): {}",
            point.id,
            body_or_placeholder(response).await
        );
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &FilterSpec,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        anyhow::ensure!(
            vector.len() == self.dimensions,
            "query vector has {} dimensions, collection expects {}",
            vector.len(),
            self.dimensions
        );
        let mut body = json!({
            "query": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter_expression(filter) {
            body["filter"] = filter;
        }
        let response = self
            .http
            .post(self.collection_url("/points/query"))
            .json(&body)
            .send()
            .await
            .context("failed to reach Qdrant")?;
        let status = response.status();
        anyhow::ensure!(
            status.is_success(),
            "Qdrant query failed ({status}): {}",
            body_or_placeholder(response).await
        );
        let parsed: QueryResponse = response
            .json()
            .await
            .context("failed to parse Qdrant query response")?;
        Ok(parsed
            .result
            .points
            .into_iter()
            .map(|hit| ScoredPoint {
                id: hit.id,
                score: hit.score,
                payload: hit.payload,
            })
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        let response = self
            .http
            .post(self.collection_url("/points/count"))
            .json(&json!({ "exact": true }))
            .send()
            .await
            .context("failed to reach Qdrant")?;
        let status = response.status();
        anyhow::ensure!(
            status.is_success(),
            "Qdrant count failed ({status}): {}",
            body_or_placeholder(response).await
        );
        let parsed: CountResponse = response
            .json()
            .await
            .context("failed to parse Qdrant count response")?;
        Ok(parsed.result.count)
    }
}

/// Composes the store-native filter expression, or `None` when the filter is
/// unconstrained. Facet types land in `must` (AND), values within a facet in
/// a single `any` match (OR), and each excluded shop becomes a `must_not`
/// equality.
fn filter_expression(filter: &FilterSpec) -> Option<Value> {
    if filter.is_empty() {
        return None;
    }
    let mut must = Vec::new();
    let mut must_not = Vec::new();
    for shop in &filter.exclude_shops {
        must_not.push(json!({ "key": "shopName", "match": { "value": shop } }));
    }
    if let Some(category) = &filter.category {
        must.push(json!({ "key": "category", "match": { "value": category } }));
    }
    if !filter.avatars.is_empty() {
        must.push(json!({ "key": "avatars", "match": { "any": filter.avatars } }));
    }
    if !filter.colors.is_empty() {
        must.push(json!({ "key": "colors", "match": { "any": filter.colors } }));
    }
    let mut expression = serde_json::Map::new();
    if !must.is_empty() {
        expression.insert("must".to_string(), Value::Array(must));
    }
    if !must_not.is_empty() {
        expression.insert("must_not".to_string(), Value::Array(must_not));
    }
    Some(Value::Object(expression))
}

async fn body_or_placeholder(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string())
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    points: Vec<QueryHit>,
}

#[derive(Debug, Deserialize)]
struct QueryHit {
    id: Uuid,
    score: f32,
    payload: PointPayload,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}
