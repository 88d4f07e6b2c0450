use crate::error::PersistenceError;
use crate::models::{PageScore, TextEmbedding};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(endpoint: impl Into<String>, collection: impl Into<String>, vector_size: usize) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        }
    }

    pub async fn ensure_collection(&self) -> Result<(), PersistenceError> {
        let url = format!("{}/collections/{}", self.endpoint, self.collection);
        let response = self.client.get(&url).send().await?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status()));
        }

        let response = self
            .client
            .put(&url)
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Cosine" }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }
        Ok(())
    }
}

fn backend_error(status: StatusCode) -> PersistenceError {
    PersistenceError::Backend {
        backend: "qdrant".to_string(),
        details: status.to_string(),
    }
}

fn point_id(document_id: &str, page_number: u32) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page_number.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn parse_page_scores(parsed: &Value) -> Vec<PageScore> {
    parsed
        .pointer("/result")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let page_number = hit
                        .pointer("/payload/page_number")
                        .and_then(Value::as_u64)
                        .and_then(|value| u32::try_from(value).ok())?;
                    let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
                    Some(PageScore { page_number, score })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn index_page_embeddings(
        &self,
        document_id: &str,
        embeddings: &[TextEmbedding],
    ) -> Result<(), PersistenceError> {
        let points = embeddings
            .iter()
            .map(|embedding| {
                if embedding.vector.len() != self.vector_size {
                    return Err(PersistenceError::InvalidArgument(format!(
                        "embedding dimension {} != {}",
                        embedding.vector.len(),
                        self.vector_size
                    )));
                }

                Ok(json!({
                    "id": point_id(document_id, embedding.page_number),
                    "vector": embedding.vector,
                    "payload": {
                        "document_id": document_id,
                        "page_number": embedding.page_number,
                    },
                }))
            })
            .collect::<Result<Vec<_>, PersistenceError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        Ok(())
    }

    async fn rank_pages(
        &self,
        document_id: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageScore>, PersistenceError> {
        if query_vector.len() != self.vector_size {
            return Err(PersistenceError::InvalidArgument(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                self.vector_size
            )));
        }

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.endpoint, self.collection
            ))
            .json(&json!({
                "vector": query_vector,
                "limit": limit,
                "with_payload": true,
                "filter": {
                    "must": [{ "key": "document_id", "match": { "value": document_id } }]
                },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let parsed: Value = response.json().await?;
        Ok(parse_page_scores(&parsed))
    }
}
