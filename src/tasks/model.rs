//! Task Record types.
//!
//! A task record tracks one unit of user-submitted work through
//! `pending → processing → {completed | failed}`.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inference::schema::{InsightRecommendation, ParsedExercise, PhotoMetrics};

/// Lifecycle status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether `self → target` lies on the forward path.
    ///
    /// `failed → processing` is only reachable through an explicit retry and
    /// is deliberately absent here.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Which workflow handles a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ParseWorkout,
    AnalyzePhoto,
    GenerateReport,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseWorkout => "parse_workout",
            Self::AnalyzePhoto => "analyze_photo",
            Self::GenerateReport => "generate_report",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parse_workout" => Ok(Self::ParseWorkout),
            "analyze_photo" => Ok(Self::AnalyzePhoto),
            "generate_report" => Ok(Self::GenerateReport),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// Kind-specific input payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "input", rename_all = "snake_case")]
pub enum TaskInput {
    /// Free-text workout log, e.g. `"Bench 100 5 5 5"`.
    ParseWorkout {
        text: String,
        #[serde(default)]
        performed_on: Option<NaiveDate>,
    },
    /// Progress photo held in blob storage.
    AnalyzePhoto {
        image_ref: String,
        #[serde(default)]
        taken_on: Option<NaiveDate>,
    },
    /// On-demand insight report for the owner.
    GenerateReport {
        #[serde(default = "default_lookback_days")]
        lookback_days: u32,
    },
}

fn default_lookback_days() -> u32 {
    7
}

impl TaskInput {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::ParseWorkout { .. } => TaskKind::ParseWorkout,
            Self::AnalyzePhoto { .. } => TaskKind::AnalyzePhoto,
            Self::GenerateReport { .. } => TaskKind::GenerateReport,
        }
    }

    /// Reject inputs no workflow could make progress on.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::ParseWorkout { text, .. } if text.trim().is_empty() => {
                Err("workout text is empty".to_string())
            }
            Self::AnalyzePhoto { image_ref, .. } if image_ref.trim().is_empty() => {
                Err("image reference is empty".to_string())
            }
            Self::GenerateReport { lookback_days } if *lookback_days == 0 => {
                Err("lookback_days must be at least 1".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Kind-specific structured output of a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult {
    ParsedWorkout {
        workout_id: Uuid,
        exercises: Vec<ParsedExercise>,
    },
    PhotoAnalysis {
        metric_date: NaiveDate,
        metrics: PhotoMetrics,
    },
    Report {
        insight_id: Uuid,
        recommendation: InsightRecommendation,
    },
}

/// A persisted task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub kind: TaskKind,
    pub input: TaskInput,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh `pending` record.
    pub fn new(owner_id: impl Into<String>, input: TaskInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            kind: input.kind(),
            input,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            processed_at: None,
            updated_at: now,
        }
    }

    pub fn status_view(&self) -> TaskStatusView {
        TaskStatusView {
            task_id: self.id,
            kind: self.kind,
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            processed_at: self.processed_at,
        }
    }
}

/// What the status surface returns to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// The terminal payload written alongside a transition.
#[derive(Debug, Clone)]
pub enum Outcome {
    None,
    Result(TaskResult),
    Error(String),
}

/// Payload of events that drive a task-backed workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub owner_id: String,
    pub input: TaskInput,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_only() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn status_display_parse() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn input_is_tagged_by_kind() {
        let input = TaskInput::ParseWorkout {
            text: "Bench 100 5 5 5".to_string(),
            performed_on: None,
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["kind"], "parse_workout");
        assert_eq!(json["input"]["text"], "Bench 100 5 5 5");
        assert_eq!(input.kind(), TaskKind::ParseWorkout);
    }

    #[test]
    fn report_input_defaults_lookback() {
        let input: TaskInput =
            serde_json::from_value(serde_json::json!({"kind": "generate_report", "input": {}}))
                .unwrap();
        assert_eq!(input, TaskInput::GenerateReport { lookback_days: 7 });
    }

    #[test]
    fn validate_rejects_empty_text() {
        let input = TaskInput::ParseWorkout {
            text: "   ".to_string(),
            performed_on: None,
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn new_record_is_pending() {
        let record = TaskRecord::new(
            "user-1",
            TaskInput::AnalyzePhoto {
                image_ref: "u1/2024-05-01.jpg".to_string(),
                taken_on: None,
            },
        );
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.kind, TaskKind::AnalyzePhoto);
        assert!(record.processed_at.is_none());
    }
}
