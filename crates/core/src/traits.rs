use crate::error::PersistenceError;
use crate::models::{
    DocumentRecord, ImageEmbedding, PageRecord, PageScore, TextEmbedding, TextPage, VisualRegion,
};
use async_trait::async_trait;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, document: &DocumentRecord) -> Result<(), PersistenceError>;

    async fn find_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, PersistenceError>;

    async fn create_pages(
        &self,
        document_id: &str,
        pages: &[PageRecord],
    ) -> Result<(), PersistenceError>;

    async fn create_text_pages(
        &self,
        document_id: &str,
        pages: &[TextPage],
    ) -> Result<(), PersistenceError>;

    async fn find_text_pages(&self, document_id: &str) -> Result<Vec<TextPage>, PersistenceError>;

    async fn create_regions(
        &self,
        document_id: &str,
        regions: &[VisualRegion],
    ) -> Result<(), PersistenceError>;

    // Regions of one page ordered by ascending top edge.
    async fn find_regions(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<Vec<VisualRegion>, PersistenceError>;

    async fn create_image_embeddings(
        &self,
        document_id: &str,
        embeddings: &[ImageEmbedding],
    ) -> Result<(), PersistenceError>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn index_page_embeddings(
        &self,
        document_id: &str,
        embeddings: &[TextEmbedding],
    ) -> Result<(), PersistenceError>;

    async fn rank_pages(
        &self,
        document_id: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageScore>, PersistenceError>;
}
