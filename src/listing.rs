//! Shared data model flowing between the metadata log, the ingestion
//! pipeline, and the vector index.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One scraped product listing as it appears in the metadata JSONL log.
///
/// The log is produced by the scraper and is read-only here. Scraped rows
/// are frequently incomplete, so every field is optional at the wire level;
/// [`ListingRecord::is_indexable`] decides whether a row carries enough to
/// index.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingRecord {
    /// Canonical listing URL, the listing's identity.
    #[serde(default)]
    pub url: Option<String>,
    /// Listing title shown in search results.
    #[serde(default)]
    pub title: Option<String>,
    /// Display price string (currency formatting is the scraper's problem).
    #[serde(default)]
    pub price: Option<String>,
    /// Shop name, used for opt-out filtering.
    #[serde(default)]
    pub shop: Option<String>,
    /// Image references: absolute URLs or paths relative to the image root.
    #[serde(default)]
    pub images: Vec<String>,
    /// Listing category facet.
    #[serde(default)]
    pub category: Option<String>,
    /// Avatar-compatibility facet values.
    #[serde(default)]
    pub avatars: Vec<String>,
    /// Color facet values.
    #[serde(default)]
    pub colors: Vec<String>,
}

impl ListingRecord {
    /// Whether the record has the minimum shape required for indexing:
    /// a listing URL plus at least one image reference.
    pub fn is_indexable(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.is_empty()) && !self.images.is_empty()
    }

    /// Builds the denormalized point payload for one of this listing's
    /// images. Missing display fields fall back to `"Unknown"` so the
    /// payload is always fully populated.
    pub fn payload(&self, thumbnail_url: String) -> PointPayload {
        let or_unknown =
            |field: &Option<String>| field.clone().unwrap_or_else(|| "Unknown".to_string());
        PointPayload {
            title: or_unknown(&self.title),
            price: or_unknown(&self.price),
            shop_name: or_unknown(&self.shop),
            booth_url: self.url.clone().unwrap_or_else(|| "#".to_string()),
            thumbnail_url,
            category: or_unknown(&self.category),
            avatars: self.avatars.clone(),
            colors: self.colors.clone(),
        }
    }
}

/// Denormalized listing fields stored alongside each point.
///
/// Field names serialize in camelCase to stay wire-compatible with the
/// existing collection (`shopName`, `boothUrl`, ...). The facet fields
/// (`shopName`, `category`, `avatars`, `colors`) are the ones the index
/// keeps keyword indexes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointPayload {
    /// Listing title.
    pub title: String,
    /// Display price string.
    pub price: String,
    /// Shop name facet.
    pub shop_name: String,
    /// Canonical listing URL; search results are deduplicated on this.
    pub booth_url: String,
    /// URL the caller can load to display the matched image.
    pub thumbnail_url: String,
    /// Category facet.
    pub category: String,
    /// Avatar facet values.
    pub avatars: Vec<String>,
    /// Color facet values.
    pub colors: Vec<String>,
}

/// One point as written into the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPoint {
    /// Stable id derived from the image reference string.
    pub id: Uuid,
    /// L2-normalized embedding, exactly the index dimensionality.
    pub vector: Vec<f32>,
    /// Denormalized listing fields.
    pub payload: PointPayload,
}

/// One search candidate returned by the index, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPoint {
    /// Point id.
    pub id: Uuid,
    /// Cosine similarity against the query vector; higher is closer.
    pub score: f32,
    /// Denormalized listing fields.
    pub payload: PointPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_incomplete_records() {
        let record: ListingRecord =
            serde_json::from_str(r#"{"title": "orphan", "images": ["a.png"]}"#).unwrap();
        assert!(!record.is_indexable());

        let record: ListingRecord =
            serde_json::from_str(r#"{"url": "https://booth.example/items/1"}"#).unwrap();
        assert!(!record.is_indexable());
    }

    #[test]
    fn payload_fills_missing_fields() {
        let record: ListingRecord = serde_json::from_str(
            r#"{"url": "https://booth.example/items/1", "images": ["a.png"]}"#,
        )
        .unwrap();
        let payload = record.payload("/api/images/a.png".to_string());
        assert_eq!(payload.title, "Unknown");
        assert_eq!(payload.shop_name, "Unknown");
        assert_eq!(payload.booth_url, "https://booth.example/items/1");
        assert!(payload.avatars.is_empty());
    }

    #[test]
    fn payload_serializes_camel_case() {
        let record: ListingRecord = serde_json::from_str(
            r#"{"url": "u", "images": ["a.png"], "shop": "ShopA", "avatars": ["X"]}"#,
        )
        .unwrap();
        let value = serde_json::to_value(record.payload("t".to_string())).unwrap();
        assert_eq!(value["shopName"], "ShopA");
        assert_eq!(value["boothUrl"], "u");
        assert_eq!(value["thumbnailUrl"], "t");
        assert_eq!(value["avatars"][0], "X");
    }
}
