use crate::embeddings::{visual_regions, EmbeddingGenerator};
use crate::error::{IngestError, PipelineError};
use crate::extractor::PdfExtractor;
use crate::generation::{ImageEmbedder, TextEmbedder};
use crate::ingest::digest_file;
use crate::layout::{LayoutAnalyzer, RegionClassifier};
use crate::models::{
    DocumentRecord, IngestionOptions, IngestionTask, NewTask, PageRecord, PageTokens, Stage,
    TaskArtifacts,
};
use crate::progress::{ProgressEvent, ProgressPublisher};
use crate::text::TextExtractor;
use crate::traits::{DocumentStore, VectorIndex};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct PipelineDeps {
    pub extractor: Arc<dyn PdfExtractor>,
    pub text_embedder: Arc<dyn TextEmbedder>,
    pub image_embedder: Option<Arc<dyn ImageEmbedder>>,
    pub documents: Arc<dyn DocumentStore>,
    pub vectors: Arc<dyn VectorIndex>,
    pub classifier: Arc<dyn RegionClassifier>,
    pub publisher: Arc<dyn ProgressPublisher>,
}

#[derive(Default)]
struct TaskRegistry {
    tasks: RwLock<HashMap<String, IngestionTask>>,
    settled: Notify,
}

impl TaskRegistry {
    fn insert(&self, task: IngestionTask) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id.clone(), task);
    }

    fn get(&self, task_id: &str) -> Option<IngestionTask> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    fn update<F>(&self, task_id: &str, change: F) -> Option<(Stage, f32)>
    where
        F: FnOnce(&mut IngestionTask),
    {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let task = tasks.get_mut(task_id)?;
        change(task);
        task.updated_at = Utc::now();
        Some((task.stage, task.progress))
    }
}

struct StageContext {
    task_id: String,
    document_id: String,
    user_id: String,
    file_name: String,
    file_type: String,
    source_path: String,
    artifacts: TaskArtifacts,
    tokens: Option<Vec<PageTokens>>,
}

impl StageContext {
    fn from_task(task: &IngestionTask) -> Self {
        Self {
            task_id: task.id.clone(),
            document_id: task.document_id.clone(),
            user_id: task.user_id.clone(),
            file_name: task.file_name.clone(),
            file_type: task.file_type.clone(),
            source_path: task.source_path.clone(),
            artifacts: task.artifacts.clone(),
            tokens: None,
        }
    }
}

type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
type StageHandler = for<'a> fn(&'a StageRunner, &'a mut StageContext) -> StageFuture<'a>;

// The fixed stage order. The driver iterates this table and nothing else.
const STAGES: [(Stage, StageHandler); 5] = [
    (Stage::ExtractingText, extract_text_stage),
    (Stage::LayoutAnalysis, layout_stage),
    (Stage::GeneratingTextEmbeddings, text_embedding_stage),
    (Stage::GeneratingImageEmbeddings, image_embedding_stage),
    (Stage::WritingDatabase, write_stage),
];

fn extract_text_stage<'a>(runner: &'a StageRunner, ctx: &'a mut StageContext) -> StageFuture<'a> {
    Box::pin(runner.extract_text(ctx))
}

fn layout_stage<'a>(runner: &'a StageRunner, ctx: &'a mut StageContext) -> StageFuture<'a> {
    Box::pin(runner.analyze_layout(ctx))
}

fn text_embedding_stage<'a>(runner: &'a StageRunner, ctx: &'a mut StageContext) -> StageFuture<'a> {
    Box::pin(runner.embed_text_pages(ctx))
}

fn image_embedding_stage<'a>(runner: &'a StageRunner, ctx: &'a mut StageContext) -> StageFuture<'a> {
    Box::pin(runner.embed_image_regions(ctx))
}

fn write_stage<'a>(runner: &'a StageRunner, ctx: &'a mut StageContext) -> StageFuture<'a> {
    Box::pin(runner.write_database(ctx))
}

const WRITE_STEPS: usize = 6;

struct StageRunner {
    deps: PipelineDeps,
    registry: Arc<TaskRegistry>,
    text: TextExtractor,
    layout: LayoutAnalyzer,
    embeddings: EmbeddingGenerator,
}

impl StageRunner {
    fn new(deps: PipelineDeps, options: IngestionOptions, registry: Arc<TaskRegistry>) -> Self {
        let embeddings = EmbeddingGenerator::new(
            Arc::clone(&deps.text_embedder),
            deps.image_embedder.clone(),
            options.embedding_max_chars,
            options.retry,
        );

        Self {
            text: TextExtractor::new(options.clustering),
            layout: LayoutAnalyzer::new(options.clustering),
            embeddings,
            deps,
            registry,
        }
    }

    async fn run(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<String>) {
        while let Some(task_id) = receiver.recv().await {
            let runner = Arc::clone(&self);
            let id = task_id.clone();
            if let Err(join_error) = tokio::spawn(async move { runner.run_task(&id).await }).await {
                error!(task_id = %task_id, error = %join_error, "task run aborted");
                self.fail(&task_id, format!("task run aborted: {join_error}"));
            }
        }
        info!("task queue closed");
    }

    async fn run_task(&self, task_id: &str) {
        let Some(task) = self.registry.get(task_id) else {
            warn!(task_id, "queued task missing from registry");
            return;
        };

        let mut ctx = StageContext::from_task(&task);
        for (stage, handler) in STAGES {
            if let Some(reason) = self.skip_reason(stage, &ctx) {
                info!(task_id, stage = %stage, reason, "stage skipped");
                continue;
            }

            self.enter(task_id, stage);
            if let Err(error) = handler(self, &mut ctx).await {
                let message = match error {
                    PipelineError::Stage { message, .. } => message,
                    other => other.to_string(),
                };
                warn!(task_id, stage = %stage, error = %message, "stage failed");
                self.fail(task_id, message);
                return;
            }

            let artifacts = ctx.artifacts.clone();
            self.registry.update(task_id, |task| task.artifacts = artifacts);
        }

        self.complete(task_id);
    }

    fn skip_reason(&self, stage: Stage, ctx: &StageContext) -> Option<&'static str> {
        if stage != Stage::GeneratingImageEmbeddings {
            return None;
        }
        if !self.embeddings.has_image_backend() {
            return Some("no image embedding backend configured");
        }
        match &ctx.artifacts.layout_pages {
            None => Some("no layout data"),
            Some(pages) if visual_regions(pages).is_empty() => Some("no visual regions"),
            Some(_) => None,
        }
    }

    fn publish(&self, task_id: &str, stage: Stage, progress: f32, message: Option<String>) {
        self.deps.publisher.publish(ProgressEvent {
            task_id: task_id.to_string(),
            stage,
            progress,
            message,
        });
    }

    fn enter(&self, task_id: &str, stage: Stage) {
        let updated = self.registry.update(task_id, |task| {
            debug_assert!(stage > task.stage, "stage {stage} entered after {}", task.stage);
            task.stage = stage;
            task.progress = task.progress.max(stage.baseline());
        });

        if let Some((stage, progress)) = updated {
            info!(task_id, stage = %stage, progress, "stage started");
            self.publish(task_id, stage, progress, None);
        }
    }

    fn report(&self, task_id: &str, stage: Stage, completed: usize, total: usize, message: String) {
        let target = stage.progress_at(completed, total);
        let updated = self.registry.update(task_id, |task| {
            task.progress = task.progress.max(target);
        });

        if let Some((current, progress)) = updated {
            self.publish(task_id, current, progress, Some(message));
        }
    }

    fn complete(&self, task_id: &str) {
        let updated = self.registry.update(task_id, |task| {
            task.stage = Stage::Completed;
            task.progress = Stage::Completed.baseline();
        });
        self.registry.settled.notify_waiters();

        if let Some((stage, progress)) = updated {
            info!(task_id, "task completed");
            self.publish(task_id, stage, progress, None);
        }
    }

    fn fail(&self, task_id: &str, message: String) {
        let updated = self.registry.update(task_id, |task| {
            task.stage = Stage::Failed;
            task.error = Some(message.clone());
        });
        self.registry.settled.notify_waiters();

        if let Some((stage, progress)) = updated {
            self.publish(task_id, stage, progress, Some(message));
        }
    }

    async fn extract_text(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        let extractor = Arc::clone(&self.deps.extractor);
        let path = PathBuf::from(&ctx.source_path);
        let pages = tokio::task::spawn_blocking(move || extractor.extract_pages(&path))
            .await
            .map_err(|join_error| PipelineError::Stage {
                stage: Stage::ExtractingText,
                message: format!("pdf parsing aborted: {join_error}"),
            })??;

        let total = pages.len();
        let mut text_pages = Vec::with_capacity(total);
        for (index, page) in pages.iter().enumerate() {
            text_pages.push(self.text.extract_page(page));
            self.report(
                &ctx.task_id,
                Stage::ExtractingText,
                index + 1,
                total,
                format!("extracted page {} of {total}", index + 1),
            );
        }

        ctx.artifacts.text_pages = Some(text_pages);
        ctx.tokens = Some(pages);
        Ok(())
    }

    async fn analyze_layout(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        let pages = ctx.tokens.take().unwrap_or_default();
        let total = pages.len();
        let mut layout_pages = Vec::with_capacity(total);

        for (index, page) in pages.iter().enumerate() {
            layout_pages.push(self.layout.classify_page(page, self.deps.classifier.as_ref()));
            self.report(
                &ctx.task_id,
                Stage::LayoutAnalysis,
                index + 1,
                total,
                format!("analyzed page {} of {total}", index + 1),
            );
        }

        ctx.artifacts.layout_pages = Some(layout_pages);
        Ok(())
    }

    async fn embed_text_pages(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        let task_id = ctx.task_id.clone();
        let pages = ctx.artifacts.text_pages.as_deref().unwrap_or_default();

        let embeddings = self
            .embeddings
            .embed_pages(pages, |completed, total| {
                self.report(
                    &task_id,
                    Stage::GeneratingTextEmbeddings,
                    completed,
                    total,
                    format!("embedded page {completed} of {total}"),
                );
            })
            .await?;

        ctx.artifacts.text_embeddings = Some(embeddings);
        Ok(())
    }

    async fn embed_image_regions(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        let task_id = ctx.task_id.clone();
        let layout = ctx.artifacts.layout_pages.as_deref().unwrap_or_default();
        let regions = visual_regions(layout);

        let embeddings = self
            .embeddings
            .embed_regions(&ctx.source_path, &regions, |completed, total| {
                self.report(
                    &task_id,
                    Stage::GeneratingImageEmbeddings,
                    completed,
                    total,
                    format!("embedded region {completed} of {total}"),
                );
            })
            .await?;

        ctx.artifacts.image_embeddings = Some(embeddings);
        Ok(())
    }

    async fn write_database(&self, ctx: &mut StageContext) -> Result<(), PipelineError> {
        let path = PathBuf::from(&ctx.source_path);
        let checksum = tokio::task::spawn_blocking(move || digest_file(&path))
            .await
            .map_err(|join_error| IngestError::InvalidArgument(format!("checksum aborted: {join_error}")))??;

        let text_pages = ctx.artifacts.text_pages.as_deref().unwrap_or_default();
        let layout_pages = ctx.artifacts.layout_pages.as_deref().unwrap_or_default();
        let documents = &self.deps.documents;
        let document_id = ctx.document_id.as_str();
        let step = |completed: usize, what: &str| {
            self.report(
                &ctx.task_id,
                Stage::WritingDatabase,
                completed,
                WRITE_STEPS,
                format!("wrote {what}"),
            );
        };

        documents
            .create_document(&DocumentRecord {
                document_id: document_id.to_string(),
                user_id: ctx.user_id.clone(),
                file_name: ctx.file_name.clone(),
                file_type: ctx.file_type.clone(),
                source_path: ctx.source_path.clone(),
                checksum,
                page_count: text_pages.len() as u32,
                created_at: Utc::now(),
            })
            .await?;
        step(1, "document");

        let pages = text_pages
            .iter()
            .map(|page| PageRecord {
                page_number: page.page_number,
                width: page.width,
                height: page.height,
            })
            .collect::<Vec<_>>();
        documents.create_pages(document_id, &pages).await?;
        step(2, "pages");

        documents.create_text_pages(document_id, text_pages).await?;
        step(3, "text pages");

        let regions = layout_pages
            .iter()
            .flat_map(|page| page.regions.iter().cloned())
            .collect::<Vec<_>>();
        documents.create_regions(document_id, &regions).await?;
        step(4, "regions");

        let text_embeddings = ctx.artifacts.text_embeddings.as_deref().unwrap_or_default();
        self.deps
            .vectors
            .index_page_embeddings(document_id, text_embeddings)
            .await?;
        step(5, "page embeddings");

        let image_embeddings = ctx.artifacts.image_embeddings.as_deref().unwrap_or_default();
        documents
            .create_image_embeddings(document_id, image_embeddings)
            .await?;
        step(6, "image embeddings");

        Ok(())
    }
}

pub struct IngestionPipeline {
    registry: Arc<TaskRegistry>,
    sender: mpsc::UnboundedSender<String>,
    worker: JoinHandle<()>,
}

impl IngestionPipeline {
    // Builds the registry and spawns the run loop. Must be called inside a tokio runtime.
    pub fn start(deps: PipelineDeps, options: IngestionOptions) -> Self {
        let registry = Arc::new(TaskRegistry::default());
        let (sender, receiver) = mpsc::unbounded_channel();
        let runner = Arc::new(StageRunner::new(deps, options, Arc::clone(&registry)));
        let worker = tokio::spawn(runner.run(receiver));

        Self {
            registry,
            sender,
            worker,
        }
    }

    pub fn create_task(&self, new_task: NewTask) -> Result<IngestionTask, PipelineError> {
        if new_task.source_path.trim().is_empty() {
            return Err(IngestError::InvalidArgument("task has no source path".to_string()).into());
        }

        let now = Utc::now();
        let task = IngestionTask {
            id: Uuid::new_v4().to_string(),
            user_id: new_task.user_id,
            document_id: Uuid::new_v4().to_string(),
            file_name: new_task.file_name,
            file_type: new_task.file_type,
            source_path: new_task.source_path,
            stage: Stage::Queued,
            progress: Stage::Queued.baseline(),
            error: None,
            artifacts: TaskArtifacts::default(),
            created_at: now,
            updated_at: now,
        };

        self.registry.insert(task.clone());
        if self.sender.send(task.id.clone()).is_err() {
            self.registry.update(&task.id, |stored| {
                stored.stage = Stage::Failed;
                stored.error = Some("task queue is closed".to_string());
            });
            return Err(PipelineError::QueueClosed);
        }

        info!(task_id = %task.id, file = %task.file_name, "task queued");
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<IngestionTask, PipelineError> {
        self.registry
            .get(task_id)
            .ok_or_else(|| PipelineError::TaskNotFound(task_id.to_string()))
    }

    pub async fn wait_for(&self, task_id: &str) -> Result<IngestionTask, PipelineError> {
        loop {
            let settled = self.registry.settled.notified();
            let task = self.get_task(task_id)?;
            if task.stage.is_terminal() {
                return Ok(task);
            }
            settled.await;
        }
    }

    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(join_error) = self.worker.await {
            error!(error = %join_error, "pipeline run loop ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::{GenerationError, PersistenceError};
    use crate::generation::RegionRequest;
    use crate::layout::UniformClassifier;
    use crate::lines::token;
    use crate::models::{PageScore, RegionKind, TextEmbedding, VisualRegion};
    use crate::progress::BroadcastPublisher;
    use crate::stores::MemoryStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeExtractor {
        pages_per_file: usize,
        started: Mutex<Vec<String>>,
    }

    impl FakeExtractor {
        fn new(pages_per_file: usize) -> Self {
            Self {
                pages_per_file,
                started: Mutex::new(Vec::new()),
            }
        }
    }

    impl PdfExtractor for FakeExtractor {
        fn extract_pages(&self, path: &Path) -> Result<Vec<PageTokens>, IngestError> {
            let name = path.file_name().and_then(|name| name.to_str()).unwrap_or_default().to_string();
            self.started.lock().unwrap().push(name.clone());

            if name.contains("broken") {
                return Err(IngestError::PdfParse(format!("cannot parse {name}")));
            }

            Ok((1..=self.pages_per_file as u32)
                .map(|number| PageTokens {
                    number,
                    width: 600.0,
                    height: 800.0,
                    tokens: vec![
                        token("Section ", 50.0, 700.0),
                        token(&format!("{number}"), 110.0, 700.0),
                        token(&format!("body of {name}"), 50.0, 600.0),
                    ],
                })
                .collect())
        }
    }

    struct FailingVectors;

    #[async_trait]
    impl VectorIndex for FailingVectors {
        async fn index_page_embeddings(
            &self,
            _document_id: &str,
            _embeddings: &[TextEmbedding],
        ) -> Result<(), PersistenceError> {
            Err(PersistenceError::Backend {
                backend: "fake".to_string(),
                details: "disk full".to_string(),
            })
        }

        async fn rank_pages(
            &self,
            _document_id: &str,
            _query_vector: &[f32],
            _limit: usize,
        ) -> Result<Vec<PageScore>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    struct FailingImages;

    #[async_trait]
    impl ImageEmbedder for FailingImages {
        async fn embed_region(&self, _request: &RegionRequest) -> Result<Vec<f32>, GenerationError> {
            Err(GenerationError::Unavailable("no gpu".to_string()))
        }
    }

    struct RecordingImages {
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageEmbedder for RecordingImages {
        async fn embed_region(&self, request: &RegionRequest) -> Result<Vec<f32>, GenerationError> {
            self.requests.lock().unwrap().push(request.region_id.clone());
            Ok(vec![request.page_number as f32, 1.0])
        }
    }

    struct HeadingFigures;

    impl RegionClassifier for HeadingFigures {
        fn classify(&self, _page: &PageTokens, region: &VisualRegion) -> RegionKind {
            if region.bbox.y0 < 0.2 {
                RegionKind::Figure
            } else {
                RegionKind::Other
            }
        }
    }

    struct Harness {
        dir: TempDir,
        store: Arc<MemoryStore>,
        extractor: Arc<FakeExtractor>,
        publisher: BroadcastPublisher,
    }

    impl Harness {
        fn new(pages_per_file: usize) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                store: Arc::new(MemoryStore::new()),
                extractor: Arc::new(FakeExtractor::new(pages_per_file)),
                publisher: BroadcastPublisher::new(1_024),
            }
        }

        fn deps(&self) -> PipelineDeps {
            PipelineDeps {
                extractor: self.extractor.clone(),
                text_embedder: Arc::new(CharacterNgramEmbedder::default()),
                image_embedder: None,
                documents: self.store.clone(),
                vectors: self.store.clone(),
                classifier: Arc::new(UniformClassifier),
                publisher: Arc::new(self.publisher.clone()),
            }
        }

        fn new_task(&self, name: &str) -> NewTask {
            let path = self.dir.path().join(name);
            std::fs::write(&path, format!("%PDF-1.4 {name}")).unwrap();
            NewTask {
                user_id: "user-1".to_string(),
                file_name: name.to_string(),
                file_type: "pdf".to_string(),
                source_path: path.to_string_lossy().to_string(),
            }
        }
    }

    fn drain(receiver: &mut tokio::sync::broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn task_runs_every_stage_in_order_and_persists_results() {
        let harness = Harness::new(2);
        let mut events = harness.publisher.subscribe();
        let pipeline = IngestionPipeline::start(harness.deps(), IngestionOptions::default());

        let queued = pipeline.create_task(harness.new_task("manual.pdf")).unwrap();
        assert_eq!(queued.stage, Stage::Queued);
        assert_eq!(queued.progress, 0.0);

        let done = pipeline.wait_for(&queued.id).await.unwrap();
        assert_eq!(done.stage, Stage::Completed);
        assert_eq!(done.progress, 100.0);
        assert!(done.error.is_none());

        let text_pages = done.artifacts.text_pages.as_ref().unwrap();
        assert_eq!(text_pages.len(), 2);
        assert_eq!(text_pages[0].text, "Section 1\nbody of manual.pdf");
        assert_eq!(done.artifacts.layout_pages.as_ref().unwrap()[1].regions.len(), 2);
        assert_eq!(done.artifacts.text_embeddings.as_ref().unwrap().len(), 2);
        assert!(done.artifacts.image_embeddings.is_none());

        let record = harness.store.find_document(&done.document_id).await.unwrap().unwrap();
        assert_eq!(record.page_count, 2);
        assert_eq!(record.checksum.len(), 64);
        assert_eq!(harness.store.find_regions(&done.document_id, 1).await.unwrap().len(), 2);

        let events = drain(&mut events);
        let mut entered = Vec::new();
        for event in &events {
            if entered.last() != Some(&event.stage) {
                entered.push(event.stage);
            }
        }
        assert_eq!(
            entered,
            vec![
                Stage::ExtractingText,
                Stage::LayoutAnalysis,
                Stage::GeneratingTextEmbeddings,
                Stage::WritingDatabase,
                Stage::Completed,
            ]
        );
        for pair in events.windows(2) {
            assert!(pair[0].progress <= pair[1].progress, "{pair:?}");
        }

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn failing_task_does_not_block_the_queue() {
        let harness = Harness::new(1);
        let pipeline = IngestionPipeline::start(harness.deps(), IngestionOptions::default());

        let a = pipeline.create_task(harness.new_task("a.pdf")).unwrap();
        let b = pipeline.create_task(harness.new_task("b-broken.pdf")).unwrap();
        let c = pipeline.create_task(harness.new_task("c.pdf")).unwrap();

        let c_done = pipeline.wait_for(&c.id).await.unwrap();
        let a_done = pipeline.get_task(&a.id).unwrap();
        let b_done = pipeline.get_task(&b.id).unwrap();

        assert_eq!(a_done.stage, Stage::Completed);
        assert_eq!(c_done.stage, Stage::Completed);
        assert_eq!(b_done.stage, Stage::Failed);
        assert!(b_done.error.as_deref().is_some_and(|message| message.contains("cannot parse")));
        assert_eq!(b_done.progress, Stage::ExtractingText.baseline());
        assert!(b_done.artifacts.text_pages.is_none());

        let started = harness.extractor.started.lock().unwrap().clone();
        assert_eq!(started, vec!["a.pdf", "b-broken.pdf", "c.pdf"]);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn text_embedding_stage_reports_each_page_within_its_span() {
        let harness = Harness::new(10);
        let mut events = harness.publisher.subscribe();
        let pipeline = IngestionPipeline::start(harness.deps(), IngestionOptions::default());

        let task = pipeline.create_task(harness.new_task("long.pdf")).unwrap();
        pipeline.wait_for(&task.id).await.unwrap();

        let stage = Stage::GeneratingTextEmbeddings;
        let per_page = drain(&mut events)
            .into_iter()
            .filter(|event| event.stage == stage && event.message.is_some())
            .map(|event| event.progress)
            .collect::<Vec<_>>();

        assert_eq!(per_page.len(), 10);
        for pair in per_page.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(per_page
            .iter()
            .all(|progress| *progress >= stage.baseline() && *progress <= stage.baseline() + 15.0));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn persistence_failure_fails_the_task_at_the_write_stage() {
        let harness = Harness::new(1);
        let deps = PipelineDeps {
            vectors: Arc::new(FailingVectors),
            ..harness.deps()
        };
        let pipeline = IngestionPipeline::start(deps, IngestionOptions::default());

        let task = pipeline.create_task(harness.new_task("doc.pdf")).unwrap();
        let done = pipeline.wait_for(&task.id).await.unwrap();

        assert_eq!(done.stage, Stage::Failed);
        assert!(done.error.unwrap().contains("disk full"));
        assert!(done.progress >= Stage::WritingDatabase.baseline());
        assert!(done.artifacts.text_embeddings.is_some());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn image_stage_is_skipped_when_no_region_is_visual() {
        let harness = Harness::new(1);
        let deps = PipelineDeps {
            image_embedder: Some(Arc::new(FailingImages)),
            ..harness.deps()
        };
        let pipeline = IngestionPipeline::start(deps, IngestionOptions::default());

        let task = pipeline.create_task(harness.new_task("doc.pdf")).unwrap();
        let done = pipeline.wait_for(&task.id).await.unwrap();

        assert_eq!(done.stage, Stage::Completed);
        assert!(done.artifacts.image_embeddings.is_none());
        assert_eq!(harness.store.image_embedding_count(&done.document_id).await, 0);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn image_stage_embeds_visual_regions_and_persists_them() {
        let harness = Harness::new(3);
        let images = Arc::new(RecordingImages {
            requests: Mutex::new(Vec::new()),
        });
        let deps = PipelineDeps {
            image_embedder: Some(images.clone()),
            classifier: Arc::new(HeadingFigures),
            ..harness.deps()
        };
        let mut events = harness.publisher.subscribe();
        let pipeline = IngestionPipeline::start(deps, IngestionOptions::default());

        let task = pipeline.create_task(harness.new_task("figures.pdf")).unwrap();
        let done = pipeline.wait_for(&task.id).await.unwrap();

        assert_eq!(done.stage, Stage::Completed);
        let layout = done.artifacts.layout_pages.as_ref().unwrap();
        assert_eq!(layout[0].regions[0].kind, RegionKind::Figure);
        assert_eq!(layout[0].regions[1].kind, RegionKind::Other);

        let embedded = done.artifacts.image_embeddings.as_ref().unwrap();
        let expected_ids = layout
            .iter()
            .map(|page| page.regions[0].id.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            embedded.iter().map(|embedding| embedding.region_id.clone()).collect::<Vec<_>>(),
            expected_ids
        );
        assert_eq!(*images.requests.lock().unwrap(), expected_ids);
        assert_eq!(harness.store.image_embedding_count(&done.document_id).await, 3);

        let stage = Stage::GeneratingImageEmbeddings;
        let events = drain(&mut events);
        assert!(events.iter().any(|event| event.stage == stage && event.message.is_none()));
        let per_region = events
            .iter()
            .filter(|event| event.stage == stage && event.message.is_some())
            .map(|event| event.progress)
            .collect::<Vec<_>>();
        assert_eq!(per_region.len(), 3);
        for pair in per_region.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(per_region
            .iter()
            .all(|progress| *progress > stage.baseline() && *progress <= stage.baseline() + 15.0));
        assert!((per_region[2] - 80.0).abs() < 1e-4);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn image_backend_failure_fails_the_task_at_the_image_stage() {
        let harness = Harness::new(1);
        let deps = PipelineDeps {
            image_embedder: Some(Arc::new(FailingImages)),
            classifier: Arc::new(HeadingFigures),
            ..harness.deps()
        };
        let pipeline = IngestionPipeline::start(deps, IngestionOptions::default());

        let task = pipeline.create_task(harness.new_task("doc.pdf")).unwrap();
        let done = pipeline.wait_for(&task.id).await.unwrap();

        assert_eq!(done.stage, Stage::Failed);
        assert!(done.error.as_deref().is_some_and(|message| message.contains("no gpu")));
        assert_eq!(done.progress, Stage::GeneratingImageEmbeddings.baseline());
        assert!(done.artifacts.text_embeddings.is_some());
        assert!(done.artifacts.image_embeddings.is_none());
        assert!(harness.store.find_document(&done.document_id).await.unwrap().is_none());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_tasks_and_closed_queues_are_reported() {
        let harness = Harness::new(1);
        let pipeline = IngestionPipeline::start(harness.deps(), IngestionOptions::default());

        assert!(matches!(
            pipeline.get_task("nope"),
            Err(PipelineError::TaskNotFound(id)) if id == "nope"
        ));

        let mut blank = harness.new_task("x.pdf");
        blank.source_path = "  ".to_string();
        assert!(matches!(
            pipeline.create_task(blank),
            Err(PipelineError::Ingest(IngestError::InvalidArgument(_)))
        ));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_already_queued_tasks() {
        let harness = Harness::new(1);
        let pipeline = IngestionPipeline::start(harness.deps(), IngestionOptions::default());
        let registry = Arc::clone(&pipeline.registry);

        let ids = ["one.pdf", "two.pdf"]
            .iter()
            .map(|name| pipeline.create_task(harness.new_task(name)).unwrap().id)
            .collect::<Vec<_>>();

        tokio::time::timeout(Duration::from_secs(10), pipeline.shutdown())
            .await
            .unwrap();

        for id in ids {
            assert_eq!(registry.get(&id).unwrap().stage, Stage::Completed);
        }
    }

    #[test]
    fn stage_table_follows_the_fixed_order() {
        let stages = STAGES.iter().map(|(stage, _)| *stage).collect::<Vec<_>>();
        for pair in stages.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(!stages.contains(&Stage::Queued));
        assert!(!stages.iter().any(|stage| stage.is_terminal()));
    }
}
