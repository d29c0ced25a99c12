//! Face feature extraction.
//!
//! Detection and encoding run out of process; [`HttpEncoder`] talks to an
//! embedding sidecar. Everything else goes through [`FaceEncoder`] so the
//! pipeline can be driven by any extractor.

use crate::config::ExtractorConfig;
use crate::embedding::Embedding;
use crate::error::{Error, Result};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait FaceEncoder: Send + Sync {
    /// Raw, not necessarily normalized, feature vector of the most prominent
    /// face in `image`.
    async fn extract(&self, image: &[u8]) -> Result<Vec<f32>>;
}

/// Extract and L2-normalize. Used by both matching and enrollment so stored
/// and probe vectors are always comparable by dot product.
pub async fn extract_normalized(encoder: &dyn FaceEncoder, image: &[u8]) -> Result<Embedding> {
    let raw = encoder.extract(image).await?;
    let dim = raw.len();
    Embedding::normalized(raw)
        .ok_or_else(|| Error::Extractor(format!("degenerate embedding of dimension {dim}")))
}

pub struct HttpEncoder {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    faces: Vec<FaceEntry>,
}

#[derive(Debug, Deserialize)]
struct FaceEntry {
    embedding: Vec<f32>,
}

impl HttpEncoder {
    pub fn new(cfg: &ExtractorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: cfg.url.clone(),
        })
    }
}

#[async_trait]
impl FaceEncoder for HttpEncoder {
    async fn extract(&self, image: &[u8]) -> Result<Vec<f32>> {
        let image = image.to_vec();
        // full decode is CPU bound, keep it off the runtime workers
        let image = tokio::task::spawn_blocking(move || ensure_decodable(&image).map(|()| image))
            .await
            .map_err(|e| Error::Extractor(e.to_string()))??;

        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image)
            .send()
            .await
            .map_err(|e| Error::Extractor(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return Err(Error::InvalidImage);
        }
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Extractor(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Extractor(format!("{status}: {body}")));
        }
        parse_faces(&body)
    }
}

/// Reject bytes that are not an image before paying for a round trip.
pub fn ensure_decodable(image: &[u8]) -> Result<()> {
    image::load_from_memory(image)
        .map(|img| debug!("decoded {}x{} image", img.width(), img.height()))
        .map_err(|_| Error::InvalidImage)
}

/// The sidecar lists faces by detection score; the first one is used.
fn parse_faces(body: &str) -> Result<Vec<f32>> {
    let resp: EmbedResponse =
        serde_json::from_str(body).map_err(|e| Error::Extractor(format!("bad response: {e}")))?;
    resp.faces
        .into_iter()
        .next()
        .map(|face| face.embedding)
        .ok_or(Error::NoFaceDetected)
}
