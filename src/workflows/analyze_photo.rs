//! `analyze-photo`: progress photo → body metrics for the day.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use super::WorkflowDeps;
use crate::bus::Event;
use crate::engine::{StepContext, Workflow};
use crate::error::StepError;
use crate::fitness::BodyMetric;
use crate::inference::{InferenceInput, OutputSchema, PhotoMetrics, infer_typed};
use crate::storage::media_type_for;
use crate::tasks::{TaskEvent, TaskInput, TaskResult};

pub struct AnalyzePhoto {
    deps: WorkflowDeps,
}

impl AnalyzePhoto {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Workflow for AnalyzePhoto {
    async fn run(&self, event: &Event, step: &StepContext) -> Result<serde_json::Value, StepError> {
        let request: TaskEvent = event.decode()?;
        let TaskInput::AnalyzePhoto { image_ref, taken_on } = request.input else {
            return Err(StepError::Fatal(format!(
                "analyze-photo received {} input",
                request.input.kind()
            )));
        };
        let task_id = request.task_id;
        let owner_id = request.owner_id;
        let tasks = &self.deps.tasks;
        let store = &self.deps.store;
        let storage = self.deps.storage.as_ref();
        let inference = self.deps.inference.as_ref();

        step.run("mark-processing", || async move {
            tasks.begin_processing(task_id).await?;
            Ok::<_, StepError>(())
        })
        .await?;

        let reference = image_ref.as_str();
        let encoded: String = step
            .run("fetch-image", || async move {
                let bytes = storage.fetch_bytes(reference).await?;
                Ok::<_, StepError>(STANDARD.encode(bytes))
            })
            .await?;

        let metrics: PhotoMetrics = step
            .run("analyze-image", || async move {
                let bytes = STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                    StepError::Fatal(format!("cached image is not valid base64: {e}"))
                })?;
                let input = InferenceInput::Image {
                    bytes,
                    media_type: media_type_for(reference).to_string(),
                };
                let metrics: PhotoMetrics =
                    infer_typed(inference, OutputSchema::PhotoMetrics, input).await?;
                Ok::<_, StepError>(metrics)
            })
            .await?;

        let metric_date = taken_on.unwrap_or_else(|| event.published_at.date_naive());
        let metric = BodyMetric {
            owner_id: owner_id.clone(),
            metric_date,
            body_weight_kg: metrics.body_weight_kg,
            body_fat_pct: metrics.body_fat_pct,
            notes: metrics.notes.clone(),
            source_task_id: Some(task_id),
            updated_at: Utc::now(),
        };
        step.run("upsert-metric", || async move {
            store.upsert_body_metric(&metric).await?;
            Ok::<_, StepError>(())
        })
        .await?;

        let result = TaskResult::PhotoAnalysis {
            metric_date,
            metrics: metrics.clone(),
        };
        step.run("mark-completed", || async move {
            tasks.complete(task_id, result).await?;
            Ok::<_, StepError>(())
        })
        .await?;

        info!(task_id = %task_id, owner_id = %owner_id, date = %metric_date, "Photo analyzed");
        Ok(json!({ "owner_id": owner_id, "metric_date": metric_date }))
    }
}
