//! `generate-insight`: recent activity → one insight row for one user.

use async_trait::async_trait;
use chrono::{Days, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{InsightRequest, WorkflowDeps};
use crate::bus::Event;
use crate::engine::{StepContext, Workflow};
use crate::error::StepError;
use crate::fitness::{ActivitySummary, Insight};
use crate::inference::{InferenceInput, InsightRecommendation, OutputSchema, infer_typed};
use crate::tasks::TaskResult;

pub struct GenerateInsight {
    deps: WorkflowDeps,
    default_lookback_days: u32,
}

impl GenerateInsight {
    pub fn new(deps: WorkflowDeps, default_lookback_days: u32) -> Self {
        Self {
            deps,
            default_lookback_days: default_lookback_days.max(1),
        }
    }
}

/// One insight per run, so a replayed insert is a no-op.
pub fn insight_id_for(run_id: Uuid) -> Uuid {
    Uuid::new_v5(&run_id, b"insight")
}

#[async_trait]
impl Workflow for GenerateInsight {
    async fn run(&self, event: &Event, step: &StepContext) -> Result<serde_json::Value, StepError> {
        let request: InsightRequest = event.decode()?;
        if request.owner_id.is_empty() {
            return Err(StepError::Fatal("insight request without owner_id".to_string()));
        }
        let tasks = &self.deps.tasks;
        let store = &self.deps.store;
        let inference = self.deps.inference.as_ref();
        let owner_id = request.owner_id.as_str();

        if let Some(task_id) = request.task_id {
            step.run("mark-processing", || async move {
                tasks.begin_processing(task_id).await?;
                Ok::<_, StepError>(())
            })
            .await?;
        }

        let lookback = request
            .lookback_days
            .unwrap_or(self.default_lookback_days)
            .max(1);
        let period_end = request
            .period_end
            .unwrap_or_else(|| event.published_at.date_naive());
        let period_start = period_end
            .checked_sub_days(Days::new(u64::from(lookback - 1)))
            .unwrap_or(period_end);

        let summary: ActivitySummary = step
            .run("load-activity", || async move {
                let workouts: Vec<_> = store
                    .list_workouts_since(owner_id, period_start)
                    .await?
                    .into_iter()
                    .filter(|w| w.performed_on <= period_end)
                    .collect();
                let goal = store.get_active_goal(owner_id).await?;
                let metric = store.latest_body_metric(owner_id).await?;
                Ok::<_, StepError>(ActivitySummary::build(
                    owner_id,
                    period_start,
                    period_end,
                    &workouts,
                    goal,
                    metric,
                ))
            })
            .await?;

        let context = serde_json::to_value(&summary)?;
        let recommendation: InsightRecommendation = step
            .run("synthesize", || async move {
                let rec: InsightRecommendation = infer_typed(
                    inference,
                    OutputSchema::Insight,
                    InferenceInput::Context(context),
                )
                .await?;
                Ok::<_, StepError>(rec)
            })
            .await?;

        let insight = Insight {
            id: insight_id_for(step.run_id()),
            owner_id: owner_id.to_string(),
            period_start,
            period_end,
            summary: recommendation.summary.clone(),
            recommendation: recommendation.recommendation.clone(),
            focus_areas: recommendation.focus_areas.clone(),
            run_id: step.run_id(),
            created_at: Utc::now(),
        };
        let insight_ref = &insight;
        step.run("insert-insight", || async move {
            store.insert_insight(insight_ref).await?;
            Ok::<_, StepError>(insight_ref.id)
        })
        .await?;

        if let Some(task_id) = request.task_id {
            let result = TaskResult::Report {
                insight_id: insight.id,
                recommendation,
            };
            step.run("mark-completed", || async move {
                tasks.complete(task_id, result).await?;
                Ok::<_, StepError>(())
            })
            .await?;
        }

        info!(
            owner_id = %owner_id,
            insight_id = %insight.id,
            workouts = summary.workout_count,
            "Insight generated"
        );
        Ok(json!({ "owner_id": owner_id, "insight_id": insight.id }))
    }
}
