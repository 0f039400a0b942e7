//! Dispatcher: translates upload-side requests into task enqueues.
//!
//! Single enqueues validate the options bag against the task kind before the
//! row is written. Deck analysis expands into the standard chain
//! `visual_analysis -> template_processing` with a `success_only` dependency
//! and points the deck's `current_processing_task_id` at the chain head.

use deckflow_core::models::{
    AnalyzeDeckRequest, CreateTaskRequest, DependencyMode, DependencySpec, PdfAnalysisOptions,
    Priority, ScheduleAnalysisResponse, Task, TaskKind, TaskSpec, TemplateProcessingOptions,
    VisualAnalysisOptions,
};
use deckflow_core::{AppError, QueueConfig};
use deckflow_db::{DeckRepository, TaskRepository};

#[derive(Clone)]
pub struct DispatchService {
    tasks: TaskRepository,
    decks: DeckRepository,
    queue: QueueConfig,
}

impl DispatchService {
    pub fn new(tasks: TaskRepository, decks: DeckRepository, queue: QueueConfig) -> Self {
        Self {
            tasks,
            decks,
            queue,
        }
    }

    /// Enqueue a single task. The deck pointer is advanced only when the
    /// task starts a new chain (no dependencies).
    #[tracing::instrument(skip(self, req), fields(task_kind = %req.task_kind))]
    pub async fn enqueue(&self, req: CreateTaskRequest) -> Result<Task, AppError> {
        let options = req.options.unwrap_or_else(|| serde_json::json!({}));
        validate_options(req.task_kind, &options)?;

        let dependencies = req.dependencies.unwrap_or_default();
        let is_chain_head = dependencies.is_empty();

        let spec = TaskSpec {
            deck_id: req.deck_id,
            task_kind: req.task_kind,
            priority: req.priority.unwrap_or_else(|| Priority::default().as_i32()),
            required_capabilities: req.required_capabilities.unwrap_or_default(),
            file_path: req.file_path,
            company_id: req.company_id,
            options,
            max_attempts: req.max_attempts.unwrap_or(self.queue.max_attempts),
            dependencies,
        };
        let task = self.tasks.create_task(spec).await?;

        if is_chain_head {
            if let Some(deck_id) = task.deck_id {
                self.decks.set_current_task(deck_id, task.id).await?;
            }
        }

        Ok(task)
    }

    /// Schedule the standard analysis chain for a deck.
    #[tracing::instrument(skip(self, req))]
    pub async fn schedule_deck_analysis(
        &self,
        deck_id: i64,
        req: AnalyzeDeckRequest,
    ) -> Result<ScheduleAnalysisResponse, AppError> {
        let deck = self
            .decks
            .get_deck(deck_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Deck {} not found", deck_id)))?;

        let options = req.options.unwrap_or_else(|| serde_json::json!({}));
        validate_options(TaskKind::VisualAnalysis, &options)?;
        let priority = req.priority.unwrap_or_else(|| Priority::High.as_i32());

        let visual = self
            .tasks
            .create_task(TaskSpec {
                deck_id: Some(deck.id),
                task_kind: TaskKind::VisualAnalysis,
                priority,
                required_capabilities: vec![],
                file_path: deck.file_path.clone(),
                company_id: deck.company_id.clone(),
                options: options.clone(),
                max_attempts: self.queue.max_attempts,
                dependencies: vec![],
            })
            .await?;

        let template = self
            .tasks
            .create_task(TaskSpec {
                deck_id: Some(deck.id),
                task_kind: TaskKind::TemplateProcessing,
                priority,
                required_capabilities: vec![],
                file_path: deck.file_path.clone(),
                company_id: deck.company_id.clone(),
                options,
                max_attempts: self.queue.max_attempts,
                dependencies: vec![DependencySpec {
                    depends_on_id: visual.id,
                    mode: DependencyMode::SuccessOnly,
                }],
            })
            .await?;

        self.decks.set_current_task(deck.id, visual.id).await?;

        tracing::info!(
            deck_id = deck.id,
            visual_task_id = visual.id,
            template_task_id = template.id,
            "Deck analysis chain scheduled"
        );

        Ok(ScheduleAnalysisResponse {
            deck_id: deck.id,
            head_task_id: visual.id,
            task_ids: vec![visual.id, template.id],
        })
    }
}

/// Check that the opaque options bag parses as the kind's typed options.
fn validate_options(kind: TaskKind, options: &serde_json::Value) -> Result<(), AppError> {
    if !options.is_object() {
        return Err(AppError::InvalidInput(
            "options must be a JSON object".to_string(),
        ));
    }
    let result = match kind {
        TaskKind::PdfAnalysis => {
            serde_json::from_value::<PdfAnalysisOptions>(options.clone()).map(|_| ())
        }
        TaskKind::VisualAnalysis => {
            serde_json::from_value::<VisualAnalysisOptions>(options.clone()).map(|_| ())
        }
        TaskKind::TemplateProcessing => {
            serde_json::from_value::<TemplateProcessingOptions>(options.clone()).map(|_| ())
        }
    };
    result.map_err(|e| AppError::InvalidInput(format!("invalid options for {}: {}", kind, e)))
}
