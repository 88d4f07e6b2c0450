pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod ingest;
pub mod layout;
pub mod lines;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod search;
pub mod stores;
pub mod text;
pub mod traits;

pub use embeddings::{CharacterNgramEmbedder, EmbeddingGenerator, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{GenerationError, IngestError, PersistenceError, PipelineError, SearchError};
pub use extractor::{extract_page_tokens, LopdfExtractor, PdfExtractor};
pub use generation::{
    with_retry, HttpEmbeddingClient, HttpImageEmbedder, ImageEmbedder, RegionRequest,
    TextEmbedder,
};
pub use ingest::{digest_file, discover_pdf_files, task_for_path};
pub use layout::{LayoutAnalyzer, RegionClassifier, UniformClassifier};
pub use models::{
    BoundingBox, Citation, ClusteringOptions, DocumentRecord, ImageEmbedding, IngestionOptions,
    IngestionTask, LayoutPage, NewTask, PageRecord, PageScore, PageToken, PageTokens, RegionKind,
    RetryPolicy, SearchHit, SearchOptions, SearchSource, Stage, TaskArtifacts, TextEmbedding,
    TextPage, VisualRegion,
};
pub use pipeline::{IngestionPipeline, PipelineDeps};
pub use progress::{
    BroadcastPublisher, NullPublisher, ProgressEvent, ProgressPublisher, TracingPublisher,
};
pub use search::{build_snippet, map_regions, SearchRanker};
pub use stores::{cosine_similarity, MemoryStore, QdrantStore};
pub use text::TextExtractor;
pub use traits::{DocumentStore, VectorIndex};
