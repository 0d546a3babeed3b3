//! Exact-scan in-process index used for tests and endpoint-less runs.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{FilterSpec, VectorIndex};
use crate::listing::{IndexPoint, ScoredPoint};

/// Brute-force cosine index over a hash map.
///
/// Stands in for the remote store when no endpoint is configured, the same
/// way the original stack fell back to an ephemeral local collection. Scans
/// every point per query, so it is only suitable for small corpora.
pub struct MemoryIndex {
    points: RwLock<HashMap<Uuid, IndexPoint>>,
    dimensions: usize,
}

impl MemoryIndex {
    /// Creates an empty index with a fixed vector width.
    pub fn new(dimensions: usize) -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
            dimensions,
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, point: IndexPoint) -> Result<()> {
        anyhow::ensure!(
            point.vector.len() == self.dimensions,
            "point {} has {} dimensions, index expects {}",
            point.id,
            point.vector.len(),
            self.dimensions
        );
        self.points.write().await.insert(point.id, point);
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
            "query vector has {} dimensions, index expects {}",
            vector.len(),
            self.dimensions
        );
        let points = self.points.read().await;
        let mut scored: Vec<ScoredPoint> = points
            .values()
            .filter(|point| filter.matches(&point.payload))
            .map(|point| ScoredPoint {
                id: point.id,
                score: cosine_similarity(vector, &point.vector),
                payload: point.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.points.read().await.len())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::stable_id;
    use crate::listing::PointPayload;

    fn point(reference: &str, vector: Vec<f32>, shop: &str) -> IndexPoint {
        IndexPoint {
            id: stable_id(reference),
            vector,
            payload: PointPayload {
                title: reference.to_string(),
                price: "Unknown".to_string(),
                shop_name: shop.to_string(),
                booth_url: format!("https://booth.example/items/{reference}"),
                thumbnail_url: format!("/api/images/{reference}"),
                category: "Unknown".to_string(),
                avatars: Vec::new(),
                colors: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn upsert_replaces_instead_of_duplicating() {
        let index = MemoryIndex::new(3);
        index
            .upsert(point("a.png", vec![1.0, 0.0, 0.0], "ShopA"))
            .await
            .unwrap();
        index
            .upsert(point("a.png", vec![0.0, 1.0, 0.0], "ShopA"))
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 1);

        let hits = index
            .query(&[0.0, 1.0, 0.0], &FilterSpec::new(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn query_orders_by_similarity() {
        let index = MemoryIndex::new(2);
        index
            .upsert(point("near.png", vec![1.0, 0.0], "s"))
            .await
            .unwrap();
        index
            .upsert(point("far.png", vec![0.0, 1.0], "s"))
            .await
            .unwrap();

        let hits = index
            .query(&[1.0, 0.1], &FilterSpec::new(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload.title, "near.png");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn rejects_mismatched_dimensions() {
        let index = MemoryIndex::new(4);
        assert!(index
            .upsert(point("a.png", vec![1.0, 0.0], "s"))
            .await
            .is_err());
        assert!(index.query(&[1.0], &FilterSpec::new(), 5).await.is_err());
    }
}
