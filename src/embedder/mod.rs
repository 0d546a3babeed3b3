//! Embedding provider boundary.
//!
//! Exactly one vector type crosses this seam: a fixed-width, L2-normalized
//! `Vec<f32>`. Whatever shape a concrete model server answers with, its
//! adapter is responsible for coercing and normalizing before returning.

pub mod clip;

use anyhow::Result;
use image::RgbImage;

/// Computes normalized feature vectors for decoded RGB images.
///
/// Implementations block; async callers hand calls to a blocking task. They
/// must be `Clone + Send + Sync` so one configured provider can serve both
/// the ingestion job and concurrent query embedding.
pub trait ImageEmbedder: Send + Sync {
    /// Output vector width.
    fn dimensions(&self) -> usize;

    /// Embeds one image into an L2-normalized vector of exactly
    /// [`dimensions`](Self::dimensions) components.
    fn embed(&self, image: &RgbImage) -> Result<Vec<f32>>;
}
