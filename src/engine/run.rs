//! Persisted run state.
//!
//! `triggered → running → {succeeded | retrying → running | failed}`.
//! Only `running`, `succeeded` and `failed` ever surface on a Task Record.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Triggered,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Triggered => "triggered",
            RunState::Running => "running",
            RunState::Retrying => "retrying",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triggered" => Ok(RunState::Triggered),
            "running" => Ok(RunState::Running),
            "retrying" => Ok(RunState::Retrying),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// A single execution of a workflow for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Derived from `(event_id, workflow)`; a redelivered event resumes the
    /// same run.
    pub id: Uuid,
    pub workflow: String,
    pub event_id: Uuid,
    pub event_name: String,
    pub state: RunState,
    /// Attempts started so far (1-based once running).
    pub attempt: u32,
    pub last_error: Option<String>,
    pub output: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn triggered(id: Uuid, workflow: &str, event_id: Uuid, event_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow: workflow.to_string(),
            event_id,
            event_name: event_name.to_string(),
            state: RunState::Triggered,
            attempt: 0,
            last_error: None,
            output: None,
            started_at: now,
            finished_at: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parse_display() {
        for state in [
            RunState::Triggered,
            RunState::Running,
            RunState::Retrying,
            RunState::Succeeded,
            RunState::Failed,
        ] {
            assert_eq!(state.to_string().parse::<RunState>().unwrap(), state);
        }
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Retrying.is_terminal());
    }
}
