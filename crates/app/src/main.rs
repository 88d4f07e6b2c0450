use chrono::Utc;
use clap::{Parser, Subcommand};
use pdf_region_core::{
    discover_pdf_files, task_for_path, CharacterNgramEmbedder, HttpEmbeddingClient,
    HttpImageEmbedder, ImageEmbedder, IngestionOptions, IngestionPipeline, LopdfExtractor,
    MemoryStore, PipelineDeps, QdrantStore, RetryPolicy, SearchRanker, Stage, TextEmbedder,
    TracingPublisher, UniformClassifier, VectorIndex, DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-region-cli", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OpenAI-compatible embeddings base URL. Without it a local n-gram embedder is used.
    #[arg(long, env = "EMBEDDING_URL")]
    embedding_url: Option<String>,

    /// Bearer token for the embeddings endpoint.
    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Embedding model name.
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Embedding dimensions requested from the backend and used for the vector collection.
    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Endpoint returning `{"embedding": [...]}` for a page region. Image stage is skipped without it.
    #[arg(long, env = "IMAGE_EMBEDDING_URL")]
    image_embedding_url: Option<String>,

    /// Qdrant base URL. Page vectors stay in memory without it.
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Qdrant collection
    #[arg(long, env = "QDRANT_COLLECTION", default_value = "pdf_pages")]
    qdrant_collection: String,

    /// Per-request timeout for embedding calls, in milliseconds.
    #[arg(long, env = "EMBEDDING_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Attempts per embedding call before the stage fails.
    #[arg(long, env = "EMBEDDING_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Run every PDF in a folder through the ingestion pipeline.
    Ingest {
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: String,
        /// Owner recorded on every task.
        #[arg(long)]
        user: String,
        /// Search each completed document for this text afterwards.
        #[arg(long)]
        query: Option<String>,
        /// Maximum hits per document.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-region-cli boot"
    );

    let options = IngestionOptions {
        retry: RetryPolicy {
            timeout: Duration::from_millis(cli.timeout_ms),
            max_attempts: cli.max_attempts.max(1),
            ..RetryPolicy::default()
        },
        ..IngestionOptions::default()
    };

    let text_embedder: Arc<dyn TextEmbedder> = match &cli.embedding_url {
        Some(url) => Arc::new(HttpEmbeddingClient::new(
            url,
            cli.embedding_model.clone(),
            cli.embedding_api_key.clone(),
            Some(cli.embedding_dimensions),
        )?),
        None => Arc::new(CharacterNgramEmbedder {
            dimensions: cli.embedding_dimensions,
        }),
    };

    let image_embedder = match &cli.image_embedding_url {
        Some(url) => Some(Arc::new(HttpImageEmbedder::new(url, cli.embedding_api_key.clone())?)
            as Arc<dyn ImageEmbedder>),
        None => None,
    };

    let documents = Arc::new(MemoryStore::new());
    let vectors: Arc<dyn VectorIndex> = match &cli.qdrant_url {
        Some(url) => {
            let store = QdrantStore::new(url, &cli.qdrant_collection, cli.embedding_dimensions);
            store.ensure_collection().await?;
            Arc::new(store)
        }
        None => documents.clone(),
    };

    let pipeline = IngestionPipeline::start(
        PipelineDeps {
            extractor: Arc::new(LopdfExtractor),
            text_embedder: Arc::clone(&text_embedder),
            image_embedder,
            documents: documents.clone(),
            vectors: Arc::clone(&vectors),
            classifier: Arc::new(UniformClassifier),
            publisher: Arc::new(TracingPublisher),
        },
        options,
    );

    match cli.command {
        Command::Ingest {
            folder,
            user,
            query,
            limit,
        } => {
            let files = discover_pdf_files(Path::new(&folder));
            if files.is_empty() {
                println!("no PDF files found under {folder}");
            }
            info!(folder = %folder, file_count = files.len(), "submitting files");

            let mut task_ids = Vec::with_capacity(files.len());
            for path in &files {
                match task_for_path(path, &user).map_err(anyhow::Error::from).and_then(|new_task| {
                    pipeline.create_task(new_task).map_err(anyhow::Error::from)
                }) {
                    Ok(task) => task_ids.push(task.id),
                    Err(error) => warn!(path = %path.display(), error = %error, "file not submitted"),
                }
            }

            let mut completed = Vec::new();
            for task_id in &task_ids {
                let task = pipeline.wait_for(task_id).await?;
                match task.stage {
                    Stage::Completed => {
                        println!(
                            "[completed] file={} document_id={} progress={:.0}",
                            task.file_name, task.document_id, task.progress
                        );
                        completed.push(task);
                    }
                    _ => println!(
                        "[{}] file={} error={}",
                        task.stage,
                        task.file_name,
                        task.error.as_deref().unwrap_or("unknown")
                    ),
                }
            }

            if let Some(query) = query {
                let ranker = SearchRanker::new(
                    documents.clone(),
                    vectors,
                    text_embedder,
                    options.search,
                    options.retry,
                );

                println!("query: {query}");
                for task in &completed {
                    let hits = ranker.search(&task.document_id, &query, limit).await;
                    println!("document: {} ({} hits)", task.file_name, hits.len());
                    for hit in hits {
                        println!(
                            "  [page {}] source={:?} score={:.4} regions={}",
                            hit.page_number,
                            hit.source,
                            hit.score,
                            hit.region_ids.join(",")
                        );
                        println!("    {}", hit.snippet.replace('\n', " "));
                    }
                }
            }
        }
    }

    pipeline.shutdown().await;

    Ok(())
}
