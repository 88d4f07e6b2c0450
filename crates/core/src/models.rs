use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::fmt;
use std::time::Duration;

pub const SUB_STEP_SPAN: f32 = 15.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    ExtractingText,
    LayoutAnalysis,
    GeneratingTextEmbeddings,
    GeneratingImageEmbeddings,
    WritingDatabase,
    Completed,
    Failed,
}

impl Stage {
    // Progress reported when the stage is entered. `Failed` keeps whatever
    // progress the task had reached.
    pub fn baseline(self) -> f32 {
        match self {
            Stage::Queued | Stage::Failed => 0.0,
            Stage::ExtractingText => 5.0,
            Stage::LayoutAnalysis => 25.0,
            Stage::GeneratingTextEmbeddings => 45.0,
            Stage::GeneratingImageEmbeddings => 65.0,
            Stage::WritingDatabase => 85.0,
            Stage::Completed => 100.0,
        }
    }

    pub fn progress_at(self, completed: usize, total: usize) -> f32 {
        if total == 0 {
            return self.baseline();
        }
        let fraction = completed.min(total) as f32 / total as f32;
        self.baseline() + fraction * SUB_STEP_SPAN
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::ExtractingText => "extracting_text",
            Stage::LayoutAnalysis => "layout_analysis",
            Stage::GeneratingTextEmbeddings => "generating_text_embeddings",
            Stage::GeneratingImageEmbeddings => "generating_image_embeddings",
            Stage::WritingDatabase => "writing_database",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageToken {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageTokens {
    pub number: u32,
    pub width: f32,
    pub height: f32,
    pub tokens: Vec<PageToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPage {
    pub page_number: u32,
    pub width: f32,
    pub height: f32,
    pub text: String,
}

// Normalized box with a top-left origin; every coordinate is in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn is_normalized(&self) -> bool {
        (0.0..=1.0).contains(&self.x0)
            && (0.0..=1.0).contains(&self.x1)
            && (0.0..=1.0).contains(&self.y0)
            && (0.0..=1.0).contains(&self.y1)
            && self.x0 <= self.x1
            && self.y0 <= self.y1
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Other,
    Figure,
    Table,
    Chart,
    Image,
}

impl RegionKind {
    pub fn is_visual(self) -> bool {
        matches!(self, RegionKind::Figure | RegionKind::Table | RegionKind::Image)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualRegion {
    pub id: String,
    pub page_number: u32,
    pub kind: RegionKind,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutPage {
    pub page_number: u32,
    pub width: f32,
    pub height: f32,
    pub regions: Vec<VisualRegion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEmbedding {
    pub page_number: u32,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEmbedding {
    pub region_id: String,
    pub page_number: u32,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskArtifacts {
    pub text_pages: Option<Vec<TextPage>>,
    pub layout_pages: Option<Vec<LayoutPage>>,
    pub text_embeddings: Option<Vec<TextEmbedding>>,
    pub image_embeddings: Option<Vec<ImageEmbedding>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: String,
    pub file_name: String,
    pub file_type: String,
    pub source_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionTask {
    pub id: String,
    pub user_id: String,
    pub document_id: String,
    pub file_name: String,
    pub file_type: String,
    pub source_path: String,
    pub stage: Stage,
    pub progress: f32,
    pub error: Option<String>,
    pub artifacts: TaskArtifacts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub user_id: String,
    pub file_name: String,
    pub file_type: String,
    pub source_path: String,
    pub checksum: String,
    pub page_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub page_number: u32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageScore {
    pub page_number: u32,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    Literal,
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub page_number: u32,
    pub snippet: String,
    pub region_ids: Vec<String>,
    pub score: f64,
    pub source: SearchSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub page_number: u32,
    pub region_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClusteringOptions {
    pub line_threshold_ratio: f32,
    pub vertical_padding_ratio: f32,
}

impl Default for ClusteringOptions {
    fn default() -> Self {
        Self {
            line_threshold_ratio: 0.012,
            vertical_padding_ratio: 0.004,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    pub max_attempts: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        self.base_backoff.saturating_mul(1 << capped)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchOptions {
    pub default_limit: usize,
    pub max_limit: usize,
    pub snippet_window_chars: usize,
    pub snippet_fallback_chars: usize,
}

impl SearchOptions {
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
            snippet_window_chars: 60,
            snippet_fallback_chars: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngestionOptions {
    pub clustering: ClusteringOptions,
    // Character budget applied to page text before embedding. Counts chars, not tokens.
    pub embedding_max_chars: usize,
    pub retry: RetryPolicy,
    pub search: SearchOptions,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            clustering: ClusteringOptions::default(),
            embedding_max_chars: 8_000,
            retry: RetryPolicy::default(),
            search: SearchOptions::default(),
        }
    }
}
