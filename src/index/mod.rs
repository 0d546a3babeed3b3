//! Vector index contract plus the adapters that implement it.

pub mod memory;
pub mod qdrant;

use anyhow::Result;
use async_trait::async_trait;

use crate::listing::{IndexPoint, PointPayload, ScoredPoint};

/// Payload fields that must carry keyword indexes for query-time filtering.
pub const FACET_FIELDS: [&str; 4] = ["shopName", "category", "avatars", "colors"];

/// Explicit facet-filter specification for a search query.
///
/// Every field is independently optional (empty means "no constraint").
/// Semantics are fixed by the contract: conditions AND across facet types,
/// while within a facet type a point matches if it carries *any* of the
/// requested values. `exclude_shops` is a negated equality per shop name.
/// Only index adapters translate this into a store-native filter expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSpec {
    /// Shops whose points must never appear in results.
    pub exclude_shops: Vec<String>,
    /// Required category, exact match.
    pub category: Option<String>,
    /// Avatar facet values; a point matches with any one of them.
    pub avatars: Vec<String>,
    /// Color facet values; a point matches with any one of them.
    pub colors: Vec<String>,
}

impl FilterSpec {
    /// An unconstrained filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds shop names to exclude.
    pub fn exclude_shops<I, S>(mut self, shops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_shops.extend(shops.into_iter().map(Into::into));
        self
    }

    /// Requires an exact category match.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Adds avatar facet values (any-of within the facet).
    pub fn avatars<I, S>(mut self, avatars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.avatars.extend(avatars.into_iter().map(Into::into));
        self
    }

    /// Adds color facet values (any-of within the facet).
    pub fn colors<I, S>(mut self, colors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.colors.extend(colors.into_iter().map(Into::into));
        self
    }

    /// Whether the filter constrains anything at all.
    pub fn is_empty(&self) -> bool {
        self.exclude_shops.is_empty()
            && self.category.is_none()
            && self.avatars.is_empty()
            && self.colors.is_empty()
    }

    /// Evaluates the filter against a payload. Reference semantics for the
    /// in-memory adapter; remote adapters must compose an equivalent native
    /// expression.
    pub fn matches(&self, payload: &PointPayload) -> bool {
        if self
            .exclude_shops
            .iter()
            .any(|shop| *shop == payload.shop_name)
        {
            return false;
        }
        if let Some(category) = &self.category {
            if *category != payload.category {
                return false;
            }
        }
        if !self.avatars.is_empty()
            && !self.avatars.iter().any(|a| payload.avatars.contains(a))
        {
            return false;
        }
        if !self.colors.is_empty() && !self.colors.iter().any(|c| payload.colors.contains(c)) {
            return false;
        }
        true
    }
}

/// Contract the core requires from a vector database.
///
/// `upsert` is insert-or-replace keyed by the point id, so re-ingesting the
/// same reference overwrites instead of duplicating. `query` returns up to
/// `limit` candidates ordered by descending cosine similarity, restricted by
/// the filter. Per-point operations are assumed atomic; no multi-point
/// transactions are required.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Fixed vector width every upsert and query must match.
    fn dimensions(&self) -> usize;

    /// Creates the collection and facet payload indexes if absent.
    async fn ensure_ready(&self) -> Result<()>;

    /// Inserts or replaces one point.
    async fn upsert(&self, point: IndexPoint) -> Result<()>;

    /// Filtered approximate nearest-neighbor search, best candidates first.
    async fn query(
        &self,
        vector: &[f32],
        filter: &FilterSpec,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>>;

    /// Total number of stored points.
    async fn count(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(shop: &str, category: &str, avatars: &[&str], colors: &[&str]) -> PointPayload {
        PointPayload {
            title: "item".to_string(),
            price: "100 JPY".to_string(),
            shop_name: shop.to_string(),
            booth_url: "https://booth.example/items/1".to_string(),
            thumbnail_url: "/api/images/a.png".to_string(),
            category: category.to_string(),
            avatars: avatars.iter().map(|s| s.to_string()).collect(),
            colors: colors.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = FilterSpec::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&payload("ShopA", "outfit", &[], &[])));
    }

    #[test]
    fn excluded_shop_never_matches() {
        let filter = FilterSpec::new().exclude_shops(["ShopA"]);
        assert!(!filter.matches(&payload("ShopA", "outfit", &[], &[])));
        assert!(filter.matches(&payload("ShopB", "outfit", &[], &[])));
    }

    #[test]
    fn any_of_within_a_facet() {
        let filter = FilterSpec::new().avatars(["X", "Y"]);
        assert!(filter.matches(&payload("s", "c", &["X"], &[])));
        assert!(filter.matches(&payload("s", "c", &["Y"], &[])));
        assert!(!filter.matches(&payload("s", "c", &["Z"], &[])));
    }

    #[test]
    fn and_across_facet_types() {
        let filter = FilterSpec::new().avatars(["X"]).category("outfit");
        assert!(filter.matches(&payload("s", "outfit", &["X"], &[])));
        assert!(!filter.matches(&payload("s", "outfit", &["Y"], &[])));
        assert!(!filter.matches(&payload("s", "prop", &["X"], &[])));
    }
}
