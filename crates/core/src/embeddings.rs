use crate::error::GenerationError;
use crate::generation::{with_retry, ImageEmbedder, RegionRequest, TextEmbedder};
use crate::models::{ImageEmbedding, LayoutPage, RetryPolicy, TextEmbedding, TextPage, VisualRegion};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl TextEmbedder for CharacterNgramEmbedder {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        Ok(self.embed(text))
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

pub fn visual_regions(layout: &[LayoutPage]) -> Vec<&VisualRegion> {
    layout
        .iter()
        .flat_map(|page| page.regions.iter())
        .filter(|region| region.kind.is_visual())
        .collect()
}

pub struct EmbeddingGenerator {
    text: Arc<dyn TextEmbedder>,
    image: Option<Arc<dyn ImageEmbedder>>,
    max_chars: usize,
    retry: RetryPolicy,
}

impl EmbeddingGenerator {
    pub fn new(
        text: Arc<dyn TextEmbedder>,
        image: Option<Arc<dyn ImageEmbedder>>,
        max_chars: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            text,
            image,
            max_chars,
            retry,
        }
    }

    pub fn has_image_backend(&self) -> bool {
        self.image.is_some()
    }

    // Blank pages are reported as progress but produce no embedding.
    pub async fn embed_pages<P>(
        &self,
        pages: &[TextPage],
        mut on_progress: P,
    ) -> Result<Vec<TextEmbedding>, GenerationError>
    where
        P: FnMut(usize, usize) + Send,
    {
        let total = pages.len();
        let mut embeddings = Vec::with_capacity(total);

        for (index, page) in pages.iter().enumerate() {
            let content = truncate_chars(&page.text, self.max_chars);
            if !content.trim().is_empty() {
                let vector =
                    with_retry(&self.retry, "embed_page", || self.text.embed_text(content)).await?;

                embeddings.push(TextEmbedding {
                    page_number: page.page_number,
                    vector,
                });
            }

            debug!(page = page.page_number, completed = index + 1, total, "page embedded");
            on_progress(index + 1, total);
        }

        Ok(embeddings)
    }

    pub async fn embed_regions<P>(
        &self,
        source_path: &str,
        regions: &[&VisualRegion],
        mut on_progress: P,
    ) -> Result<Vec<ImageEmbedding>, GenerationError>
    where
        P: FnMut(usize, usize) + Send,
    {
        let Some(image) = &self.image else {
            return Ok(Vec::new());
        };

        let total = regions.len();
        let mut embeddings = Vec::with_capacity(total);

        for (index, region) in regions.iter().enumerate() {
            let request = RegionRequest {
                source_path: source_path.to_string(),
                page_number: region.page_number,
                region_id: region.id.clone(),
                bbox: region.bbox,
            };

            let vector = with_retry(&self.retry, "embed_region", || image.embed_region(&request)).await?;
            embeddings.push(ImageEmbedding {
                region_id: region.id.clone(),
                page_number: region.page_number,
                vector,
            });

            debug!(region = %region.id, completed = index + 1, total, "region embedded");
            on_progress(index + 1, total);
        }

        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, RegionKind};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEmbedder {
        inputs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextEmbedder for RecordingEmbedder {
        async fn embed_text(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
            self.inputs.lock().unwrap().push(text.to_string());
            Ok(vec![text.chars().count() as f32])
        }
    }

    struct ConstantImageEmbedder;

    #[async_trait]
    impl ImageEmbedder for ConstantImageEmbedder {
        async fn embed_region(&self, request: &RegionRequest) -> Result<Vec<f32>, GenerationError> {
            Ok(vec![request.page_number as f32])
        }
    }

    fn page(number: u32, text: &str) -> TextPage {
        TextPage {
            page_number: number,
            width: 612.0,
            height: 792.0,
            text: text.to_string(),
        }
    }

    fn region(id: &str, kind: RegionKind) -> VisualRegion {
        VisualRegion {
            id: id.to_string(),
            page_number: 1,
            kind,
            bbox: BoundingBox {
                x0: 0.1,
                y0: 0.1,
                x1: 0.5,
                y1: 0.2,
            },
        }
    }

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow");
        let second = embedder.embed("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("abc");
        assert_eq!(vector.len(), 32);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars(&"x".repeat(9_000), 8_000).len(), 8_000);
    }

    #[tokio::test]
    async fn pages_are_truncated_and_embedded_in_order() {
        let recorder = Arc::new(RecordingEmbedder::default());
        let generator = EmbeddingGenerator::new(recorder.clone(), None, 5, RetryPolicy::default());
        let pages = vec![page(1, "abcdefgh"), page(2, "   "), page(3, "xyz")];

        let mut progress = Vec::new();
        let embeddings = generator
            .embed_pages(&pages, |done, total| progress.push((done, total)))
            .await
            .unwrap();

        assert_eq!(*recorder.inputs.lock().unwrap(), vec!["abcde".to_string(), "xyz".to_string()]);
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].page_number, 1);
        assert_eq!(embeddings[1].page_number, 3);
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn region_stage_is_a_no_op_without_backend() {
        let generator = EmbeddingGenerator::new(
            Arc::new(CharacterNgramEmbedder::default()),
            None,
            8_000,
            RetryPolicy::default(),
        );
        let figure = region("r1", RegionKind::Figure);
        let mut calls = 0;

        let embeddings = generator
            .embed_regions("doc.pdf", &[&figure], |_, _| calls += 1)
            .await
            .unwrap();

        assert!(embeddings.is_empty());
        assert_eq!(calls, 0);
        assert!(!generator.has_image_backend());
    }

    #[tokio::test]
    async fn visual_regions_are_embedded_with_backend() {
        let generator = EmbeddingGenerator::new(
            Arc::new(CharacterNgramEmbedder::default()),
            Some(Arc::new(ConstantImageEmbedder)),
            8_000,
            RetryPolicy::default(),
        );
        let layout = vec![LayoutPage {
            page_number: 1,
            width: 612.0,
            height: 792.0,
            regions: vec![
                region("text", RegionKind::Other),
                region("table", RegionKind::Table),
                region("chart", RegionKind::Chart),
                region("figure", RegionKind::Figure),
            ],
        }];

        let selected = visual_regions(&layout);
        let ids = selected.iter().map(|region| region.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["table", "figure"]);

        let mut progress = Vec::new();
        let embeddings = generator
            .embed_regions("doc.pdf", &selected, |done, total| progress.push((done, total)))
            .await
            .unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[1].region_id, "figure");
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
    }
}
