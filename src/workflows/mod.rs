//! The five application workflows and their registration table.
//!
//! | workflow              | trigger                                        |
//! |-----------------------|------------------------------------------------|
//! | `parse-workout`       | `workout/text.submitted`                       |
//! | `analyze-photo`       | `photo/uploaded`                               |
//! | `generate-insight`    | `insight/generate`                             |
//! | `weekly-report`       | cron (`cron/weekly-report`)                    |
//! | `inactivity-reminder` | cron, or `reminder/inactivity.check` on demand |
//!
//! `weekly-report` emits the event `generate-insight` subscribes to; that is
//! the only coupling between workflows.

pub mod analyze_photo;
pub mod inactivity;
pub mod insight;
pub mod parse_workout;
pub mod weekly_report;

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::WorkflowSettings;
use crate::engine::{RegistryBuilder, WorkflowDef};
use crate::inference::Inference;
use crate::storage::BlobStorage;
use crate::store::Database;
use crate::tasks::{TaskEvent, TaskInput, TaskRecord, TaskStore};

pub use analyze_photo::AnalyzePhoto;
pub use inactivity::InactivityReminder;
pub use insight::GenerateInsight;
pub use parse_workout::ParseWorkout;
pub use weekly_report::WeeklyReport;

// Event names
pub const WORKOUT_TEXT_SUBMITTED: &str = "workout/text.submitted";
pub const PHOTO_UPLOADED: &str = "photo/uploaded";
pub const INSIGHT_GENERATE: &str = "insight/generate";
pub const INACTIVITY_CHECK: &str = "reminder/inactivity.check";

// Workflow names
pub const PARSE_WORKOUT: &str = "parse-workout";
pub const ANALYZE_PHOTO: &str = "analyze-photo";
pub const GENERATE_INSIGHT: &str = "generate-insight";
pub const WEEKLY_REPORT: &str = "weekly-report";
pub const INACTIVITY_REMINDER: &str = "inactivity-reminder";

/// Collaborators shared by every workflow.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub tasks: TaskStore,
    pub store: Arc<dyn Database>,
    pub inference: Arc<dyn Inference>,
    pub storage: Arc<dyn BlobStorage>,
}

/// Payload of `insight/generate`. Sent by the task surface (with a task id)
/// and by the weekly fan-out (without one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRequest {
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_days: Option<u32>,
    /// Last day of the reported period. Defaults to the event's publish date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end: Option<NaiveDate>,
}

/// Payload of cron firings. Manual triggers may omit every field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledRun {
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Inactivity threshold override for manual checks.
    #[serde(default)]
    pub inactivity_days: Option<u32>,
}

/// The event that starts processing of a freshly created Task Record.
pub fn task_trigger(record: &TaskRecord) -> Result<(&'static str, serde_json::Value), serde_json::Error> {
    match &record.input {
        TaskInput::ParseWorkout { .. } => Ok((WORKOUT_TEXT_SUBMITTED, task_event(record)?)),
        TaskInput::AnalyzePhoto { .. } => Ok((PHOTO_UPLOADED, task_event(record)?)),
        TaskInput::GenerateReport { lookback_days } => Ok((
            INSIGHT_GENERATE,
            serde_json::to_value(InsightRequest {
                owner_id: record.owner_id.clone(),
                task_id: Some(record.id),
                lookback_days: Some(*lookback_days),
                period_end: None,
            })?,
        )),
    }
}

fn task_event(record: &TaskRecord) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(TaskEvent {
        task_id: record.id,
        owner_id: record.owner_id.clone(),
        input: record.input.clone(),
    })
}

/// Register all five workflows with their deployment settings.
pub fn register_workflows(
    builder: RegistryBuilder,
    deps: &WorkflowDeps,
    settings: &WorkflowSettings,
) -> RegistryBuilder {
    builder
        .register(
            WorkflowDef::new(PARSE_WORKOUT, Arc::new(ParseWorkout::new(deps.clone())))
                .on_event(WORKOUT_TEXT_SUBMITTED)
                .concurrency(settings.parse_workout_concurrency),
        )
        .register(
            WorkflowDef::new(ANALYZE_PHOTO, Arc::new(AnalyzePhoto::new(deps.clone())))
                .on_event(PHOTO_UPLOADED)
                .concurrency(settings.analyze_photo_concurrency),
        )
        .register(
            WorkflowDef::new(
                GENERATE_INSIGHT,
                Arc::new(GenerateInsight::new(
                    deps.clone(),
                    settings.report_lookback_days,
                )),
            )
            .on_event(INSIGHT_GENERATE)
            .concurrency(settings.insight_concurrency),
        )
        .register(
            WorkflowDef::new(
                WEEKLY_REPORT,
                Arc::new(WeeklyReport::new(
                    deps.clone(),
                    settings.fanout_page_size,
                    settings.report_lookback_days,
                )),
            )
            .on_cron(settings.weekly_report_schedule.clone()),
        )
        .register(
            WorkflowDef::new(
                INACTIVITY_REMINDER,
                Arc::new(InactivityReminder::new(
                    deps.clone(),
                    settings.inactivity_days,
                    settings.fanout_page_size,
                )),
            )
            .on_event(INACTIVITY_CHECK)
            .on_cron(settings.inactivity_schedule.clone()),
        )
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_inputs_map_to_trigger_events() {
        let parse = TaskRecord::new(
            "u1",
            TaskInput::ParseWorkout {
                text: "Bench 100 5 5 5".into(),
                performed_on: None,
            },
        );
        let (name, payload) = task_trigger(&parse).unwrap();
        assert_eq!(name, WORKOUT_TEXT_SUBMITTED);
        let event: TaskEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.task_id, parse.id);

        let report = TaskRecord::new("u1", TaskInput::GenerateReport { lookback_days: 14 });
        let (name, payload) = task_trigger(&report).unwrap();
        assert_eq!(name, INSIGHT_GENERATE);
        let request: InsightRequest = serde_json::from_value(payload).unwrap();
        assert_eq!(request.task_id, Some(report.id));
        assert_eq!(request.lookback_days, Some(14));
    }

    #[tokio::test]
    async fn default_settings_register_cleanly() {
        let h = testing::harness().await;
        let registry = h.engine.registry();
        assert_eq!(registry.len(), 5);
        assert_eq!(
            registry.for_event("cron/weekly-report").unwrap().name,
            WEEKLY_REPORT
        );
        assert_eq!(
            registry.for_event(INACTIVITY_CHECK).unwrap().name,
            INACTIVITY_REMINDER
        );
        assert_eq!(registry.cron_workflows().count(), 2);
        assert_eq!(registry.get(PARSE_WORKOUT).unwrap().concurrency, 4);
    }
}
