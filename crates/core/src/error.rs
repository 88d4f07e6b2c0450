use crate::models::Stage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<lopdf::Error> for IngestError {
    fn from(error: lopdf::Error) -> Self {
        IngestError::PdfParse(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation backend not configured: {0}")]
    Unavailable(String),

    #[error("generation request failed: {0}")]
    Request(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("generation call timed out after {0} ms")]
    Timeout(u128),

    #[error("generation backend returned an empty vector")]
    EmptyVector,

    #[error("invalid response from {backend}: {details}")]
    InvalidResponse { backend: String, details: String },
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout(_) | GenerationError::Request(_) => true,
            GenerationError::Http(error) => {
                error.is_timeout()
                    || error.is_connect()
                    || error.is_request()
                    || error
                        .status()
                        .is_some_and(|status| status.as_u16() == 429 || status.is_server_error())
            }
            GenerationError::Unavailable(_)
            | GenerationError::Url(_)
            | GenerationError::EmptyVector
            | GenerationError::InvalidResponse { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("invalid response from {backend}: {details}")]
    Backend { backend: String, details: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query embedding unavailable: {0}")]
    BackendUnavailable(#[from] GenerationError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("stage {stage} failed: {message}")]
    Stage { stage: Stage, message: String },

    #[error("task queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
