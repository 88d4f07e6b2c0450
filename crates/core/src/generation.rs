use crate::error::GenerationError;
use crate::models::{BoundingBox, RetryPolicy};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;
use url::Url;

#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, GenerationError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionRequest {
    pub source_path: String,
    pub page_number: u32,
    pub region_id: String,
    pub bbox: BoundingBox,
}

#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    async fn embed_region(&self, request: &RegionRequest) -> Result<Vec<f32>, GenerationError>;
}

pub async fn with_retry<F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<Vec<f32>, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<f32>, GenerationError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(vector)) if vector.is_empty() => Err(GenerationError::EmptyVector),
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(policy.timeout.as_millis())),
        };

        match outcome {
            Ok(vector) => return Ok(vector),
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                warn!(operation, attempt, error = %error, "generation call failed, retrying");
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
            Err(error) => return Err(error),
        }
    }
}

pub struct HttpEmbeddingClient {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    dimensions: Option<usize>,
}

impl HttpEmbeddingClient {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        dimensions: Option<usize>,
    ) -> Result<Self, GenerationError> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(GenerationError::Unavailable("missing embedding model name".to_string()));
        }

        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        Ok(Self {
            client: Client::new(),
            endpoint: base.join("embeddings")?,
            model,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            dimensions,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

fn first_embedding(mut response: EmbeddingResponse) -> Option<Vec<f32>> {
    response.data.sort_by_key(|entry| entry.index);
    response.data.into_iter().next().map(|entry| entry.embedding)
}

#[async_trait]
impl TextEmbedder for HttpEmbeddingClient {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
            dimensions: self.dimensions,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?.error_for_status()?;
        let parsed: EmbeddingResponse = response.json().await?;

        first_embedding(parsed).ok_or_else(|| GenerationError::InvalidResponse {
            backend: self.endpoint.to_string(),
            details: "response carried no embeddings".to_string(),
        })
    }
}

pub struct HttpImageEmbedder {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpImageEmbedder {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self, GenerationError> {
        Ok(Self {
            client: Client::new(),
            endpoint: Url::parse(endpoint)?,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RegionEmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl ImageEmbedder for HttpImageEmbedder {
    async fn embed_region(&self, region: &RegionRequest) -> Result<Vec<f32>, GenerationError> {
        let mut request = self.client.post(self.endpoint.clone()).json(region);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?.error_for_status()?;
        let parsed: RegionEmbeddingResponse = response.json().await?;
        Ok(parsed.embedding)
    }
}
