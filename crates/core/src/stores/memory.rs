use crate::error::PersistenceError;
use crate::models::{
    DocumentRecord, ImageEmbedding, PageRecord, PageScore, TextEmbedding, TextPage, VisualRegion,
};
use crate::traits::{DocumentStore, VectorIndex};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct StoredDocument {
    record: Option<DocumentRecord>,
    pages: BTreeMap<u32, PageRecord>,
    text_pages: BTreeMap<u32, TextPage>,
    regions: Vec<VisualRegion>,
    page_embeddings: BTreeMap<u32, Vec<f32>>,
    image_embeddings: Vec<ImageEmbedding>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document_ids(&self) -> Vec<String> {
        let documents = self.documents.read().await;
        let mut ids = documents
            .iter()
            .filter(|(_, stored)| stored.record.is_some())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub async fn image_embedding_count(&self, document_id: &str) -> usize {
        self.documents
            .read()
            .await
            .get(document_id)
            .map(|stored| stored.image_embeddings.len())
            .unwrap_or(0)
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let (mut dot, mut left_norm, mut right_norm) = (0f64, 0f64, 0f64);
    for (a, b) in left.iter().zip(right.iter()) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, document: &DocumentRecord) -> Result<(), PersistenceError> {
        let mut documents = self.documents.write().await;
        documents
            .entry(document.document_id.clone())
            .or_default()
            .record = Some(document.clone());
        Ok(())
    }

    async fn find_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, PersistenceError> {
        Ok(self
            .documents
            .read()
            .await
            .get(document_id)
            .and_then(|stored| stored.record.clone()))
    }

    async fn create_pages(
        &self,
        document_id: &str,
        pages: &[PageRecord],
    ) -> Result<(), PersistenceError> {
        let mut documents = self.documents.write().await;
        let stored = documents.entry(document_id.to_string()).or_default();
        for page in pages {
            stored.pages.insert(page.page_number, *page);
        }
        Ok(())
    }

    async fn create_text_pages(
        &self,
        document_id: &str,
        pages: &[TextPage],
    ) -> Result<(), PersistenceError> {
        let mut documents = self.documents.write().await;
        let stored = documents.entry(document_id.to_string()).or_default();
        for page in pages {
            stored.text_pages.insert(page.page_number, page.clone());
        }
        Ok(())
    }

    async fn find_text_pages(&self, document_id: &str) -> Result<Vec<TextPage>, PersistenceError> {
        Ok(self
            .documents
            .read()
            .await
            .get(document_id)
            .map(|stored| stored.text_pages.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_regions(
        &self,
        document_id: &str,
        regions: &[VisualRegion],
    ) -> Result<(), PersistenceError> {
        let mut documents = self.documents.write().await;
        let stored = documents.entry(document_id.to_string()).or_default();
        stored.regions.extend_from_slice(regions);
        Ok(())
    }

    async fn find_regions(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<Vec<VisualRegion>, PersistenceError> {
        let documents = self.documents.read().await;
        let mut regions = documents
            .get(document_id)
            .map(|stored| {
                stored
                    .regions
                    .iter()
                    .filter(|region| region.page_number == page_number)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        regions.sort_by(|left, right| left.bbox.y0.total_cmp(&right.bbox.y0));
        Ok(regions)
    }

    async fn create_image_embeddings(
        &self,
        document_id: &str,
        embeddings: &[ImageEmbedding],
    ) -> Result<(), PersistenceError> {
        let mut documents = self.documents.write().await;
        let stored = documents.entry(document_id.to_string()).or_default();
        stored.image_embeddings.extend_from_slice(embeddings);
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for MemoryStore {
    async fn index_page_embeddings(
        &self,
        document_id: &str,
        embeddings: &[TextEmbedding],
    ) -> Result<(), PersistenceError> {
        let mut documents = self.documents.write().await;
        let stored = documents.entry(document_id.to_string()).or_default();
        for embedding in embeddings {
            stored
                .page_embeddings
                .insert(embedding.page_number, embedding.vector.clone());
        }
        Ok(())
    }

    async fn rank_pages(
        &self,
        document_id: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageScore>, PersistenceError> {
        let documents = self.documents.read().await;
        let Some(stored) = documents.get(document_id) else {
            return Ok(Vec::new());
        };

        let mut scored = stored
            .page_embeddings
            .iter()
            .map(|(page_number, vector)| PageScore {
                page_number: *page_number,
                score: cosine_similarity(query_vector, vector),
            })
            .collect::<Vec<_>>();
        scored.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.page_number.cmp(&right.page_number))
        });
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, RegionKind};

    fn region(id: &str, page_number: u32, y0: f32) -> VisualRegion {
        VisualRegion {
            id: id.to_string(),
            page_number,
            kind: RegionKind::Other,
            bbox: BoundingBox {
                x0: 0.1,
                y0,
                x1: 0.9,
                y1: y0 + 0.02,
            },
        }
    }

    #[test]
    fn cosine_similarity_handles_degenerate_vectors() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn ranks_pages_of_one_document_best_first() {
        let store = MemoryStore::new();
        store
            .index_page_embeddings(
                "doc-1",
                &[
                    TextEmbedding { page_number: 1, vector: vec![0.0, 1.0] },
                    TextEmbedding { page_number: 2, vector: vec![1.0, 0.1] },
                    TextEmbedding { page_number: 3, vector: vec![1.0, 1.0] },
                ],
            )
            .await
            .unwrap();
        store
            .index_page_embeddings("doc-2", &[TextEmbedding { page_number: 9, vector: vec![1.0, 0.0] }])
            .await
            .unwrap();

        let ranked = store.rank_pages("doc-1", &[1.0, 0.0], 2).await.unwrap();
        let pages = ranked.iter().map(|hit| hit.page_number).collect::<Vec<_>>();
        assert_eq!(pages, vec![2, 3]);
        assert!(store.rank_pages("missing", &[1.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn regions_come_back_in_reading_order_per_page() {
        let store = MemoryStore::new();
        store
            .create_regions(
                "doc-1",
                &[region("c", 1, 0.7), region("a", 1, 0.1), region("x", 2, 0.0), region("b", 1, 0.4)],
            )
            .await
            .unwrap();

        let regions = store.find_regions("doc-1", 1).await.unwrap();
        let ids = regions.iter().map(|region| region.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
