//! `parse-workout`: free-text workout log → structured workout rows.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::WorkflowDeps;
use crate::bus::Event;
use crate::engine::{StepContext, Workflow};
use crate::error::StepError;
use crate::fitness::Workout;
use crate::inference::{InferenceInput, OutputSchema, ParsedWorkout, infer_typed};
use crate::tasks::{TaskEvent, TaskInput, TaskResult};

pub struct ParseWorkout {
    deps: WorkflowDeps,
}

impl ParseWorkout {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }
}

/// One workout per task, so a replayed insert is a no-op.
pub fn workout_id_for(task_id: Uuid) -> Uuid {
    Uuid::new_v5(&task_id, b"workout")
}

#[async_trait]
impl Workflow for ParseWorkout {
    async fn run(&self, event: &Event, step: &StepContext) -> Result<serde_json::Value, StepError> {
        let request: TaskEvent = event.decode()?;
        let TaskInput::ParseWorkout { text, performed_on } = request.input else {
            return Err(StepError::Fatal(format!(
                "parse-workout received {} input",
                request.input.kind()
            )));
        };
        let task_id = request.task_id;
        let tasks = &self.deps.tasks;
        let store = &self.deps.store;
        let inference = self.deps.inference.as_ref();

        step.run("mark-processing", || async move {
            tasks.begin_processing(task_id).await?;
            Ok::<_, StepError>(())
        })
        .await?;

        let parsed: ParsedWorkout = step
            .run("structure-workout", || async move {
                let parsed: ParsedWorkout =
                    infer_typed(inference, OutputSchema::Workout, InferenceInput::Text(text))
                        .await?;
                Ok::<_, StepError>(parsed)
            })
            .await?;

        if parsed.exercises.iter().all(|e| e.sets.is_empty()) {
            return Err(StepError::Permanent(
                "no exercises recognized in workout log".to_string(),
            ));
        }

        let workout = Workout {
            id: workout_id_for(task_id),
            owner_id: request.owner_id.clone(),
            task_id: Some(task_id),
            performed_on: performed_on.unwrap_or_else(|| event.published_at.date_naive()),
            exercises: parsed.exercises,
            created_at: event.published_at,
        };
        let sets = workout.set_count();

        let workout_ref = &workout;
        step.run("insert-workout", || async move {
            store.insert_workout(workout_ref).await?;
            Ok::<_, StepError>(workout_ref.id)
        })
        .await?;

        let result = TaskResult::ParsedWorkout {
            workout_id: workout.id,
            exercises: workout.exercises.clone(),
        };
        step.run("mark-completed", || async move {
            tasks.complete(task_id, result).await?;
            Ok::<_, StepError>(())
        })
        .await?;

        info!(
            task_id = %task_id,
            workout_id = %workout.id,
            exercises = workout.exercises.len(),
            sets,
            "Workout parsed"
        );
        Ok(json!({ "workout_id": workout.id, "sets": sets }))
    }
}
