//! HTTP client for a CLIP image-embedding service.

use std::io::Cursor;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;

use super::ImageEmbedder;

/// Blocking client that posts PNG-encoded images to a CLIP inference
/// endpoint and returns normalized 512-wide vectors.
#[derive(Clone)]
pub struct ClipHttpEmbedder {
    client: Client,
    endpoint: String,
    dimensions: usize,
    max_retries: usize,
}

impl ClipHttpEmbedder {
    /// Builds a new CLIP embeddings client.
    ///
    /// # Arguments
    /// * `endpoint` - Full inference endpoint, e.g. `http://127.0.0.1:8100/embed/image`
    /// * `api_key` - Optional bearer token for hosted inference services
    /// * `dimensions` - Vector width the model emits (512 for ViT-B/32)
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        dimensions: usize,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        anyhow::ensure!(
            endpoint.starts_with("http://") || endpoint.starts_with("https://"),
            "embedding endpoint must be an http(s) URL"
        );
        anyhow::ensure!(dimensions > 0, "embedding dimensionality must be positive");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
        if let Some(key) = api_key {
            let auth = format!("Bearer {}", key.trim());
            headers.insert(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid embedding API key")?,
            );
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            dimensions,
            max_retries: max_retries.max(1),
        })
    }

    fn post_image(&self, png: &[u8]) -> Result<Vec<f32>> {
        let mut attempt = 0usize;
        loop {
            let response = self.client.post(&self.endpoint).body(png.to_vec()).send();
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: EmbedResponse =
                            resp.json().context("failed to parse embedding response")?;
                        return parsed.into_vector();
                    }
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    anyhow::bail!("embedding request failed ({status}): {body}");
                }
                Err(err) => {
                    if (err.is_connect() || err.is_timeout() || err.is_request() || err.is_body())
                        && attempt + 1 < self.max_retries
                    {
                        attempt += 1;
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

impl ImageEmbedder for ClipHttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(image.clone())
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("failed to encode image for embedding")?;
        let vector = self.post_image(&png)?;
        anyhow::ensure!(
            vector.len() == self.dimensions,
            "embedding service returned {} dimensions, expected {}",
            vector.len(),
            self.dimensions
        );
        Ok(l2_normalize(vector))
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

/// Inference servers answer either a bare vector object or an OpenAI-style
/// data array; both collapse to one vector here.
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    data: Vec<EmbedData>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

impl EmbedResponse {
    fn into_vector(self) -> Result<Vec<f32>> {
        if !self.embedding.is_empty() {
            return Ok(self.embedding);
        }
        self.data
            .into_iter()
            .next()
            .map(|entry| entry.embedding)
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| anyhow!("embedding response missing vector payload"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_yields_unit_length() {
        let vector = l2_normalize(vec![3.0, 4.0]);
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((vector[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_survives_normalization() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn parses_both_response_shapes() {
        let bare: EmbedResponse = serde_json::from_str(r#"{"embedding": [0.1, 0.2]}"#).unwrap();
        assert_eq!(bare.into_vector().unwrap(), vec![0.1, 0.2]);

        let wrapped: EmbedResponse =
            serde_json::from_str(r#"{"data": [{"embedding": [0.3]}]}"#).unwrap();
        assert_eq!(wrapped.into_vector().unwrap(), vec![0.3]);

        let empty: EmbedResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(empty.into_vector().is_err());
    }

    #[test]
    fn invalid_endpoint_rejected() {
        assert!(ClipHttpEmbedder::new(
            "localhost:8100".to_string(),
            None,
            512,
            Duration::from_secs(10),
            3,
        )
        .is_err());
    }
}
