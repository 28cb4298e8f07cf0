//! Task Records: the client-visible state of asynchronous work.
//!
//! Every status change goes through a conditional update, so two writers
//! racing on the same record cannot both win, and every winning change is
//! pushed to the notifier.

pub mod model;
pub mod notifier;
pub mod routes;
pub mod service;

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::TaskError;
use crate::store::Database;

pub use model::{Outcome, TaskEvent, TaskInput, TaskKind, TaskRecord, TaskResult, TaskStatus};
pub use notifier::{TaskNotifier, TaskStatusChange};
pub use service::TaskService;

/// Persistence plus notification for Task Records.
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<dyn Database>,
    notifier: TaskNotifier,
}

impl TaskStore {
    pub fn new(db: Arc<dyn Database>, notifier: TaskNotifier) -> Self {
        Self { db, notifier }
    }

    pub fn notifier(&self) -> &TaskNotifier {
        &self.notifier
    }

    /// Create a `pending` record for `owner_id`.
    pub async fn create(&self, owner_id: &str, input: TaskInput) -> Result<TaskRecord, TaskError> {
        if owner_id.trim().is_empty() {
            return Err(TaskError::InvalidInput("owner_id is empty".to_string()));
        }
        input.validate().map_err(TaskError::InvalidInput)?;

        self.db.upsert_user(owner_id).await?;
        let record = TaskRecord::new(owner_id, input);
        self.db.insert_task(&record).await?;

        info!(task_id = %record.id, owner_id = %owner_id, kind = %record.kind, "Task created");
        self.notifier.notify(TaskStatusChange::from_record(&record));
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<TaskRecord, TaskError> {
        self.db
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    /// Move a record from `from` to `to`, writing `outcome`.
    ///
    /// Fails with `Conflict` when the record is no longer in `from`.
    pub async fn transition(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        outcome: Outcome,
    ) -> Result<TaskRecord, TaskError> {
        if !from.can_transition_to(to) {
            return Err(TaskError::InvalidTransition { id, from, to });
        }
        self.apply(id, from, to, outcome).await
    }

    async fn apply(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        outcome: Outcome,
    ) -> Result<TaskRecord, TaskError> {
        if !self.db.transition_task(id, from, to, &outcome).await? {
            let current = self.get(id).await?;
            return Err(TaskError::Conflict {
                id,
                expected: from,
                actual: current.status,
            });
        }

        let record = self.get(id).await?;
        debug!(task_id = %id, from = %from, to = %to, "Task transitioned");
        self.notifier.notify(TaskStatusChange::from_record(&record));
        Ok(record)
    }

    /// `pending → processing`. A record already processing is left alone so
    /// a redelivered event can carry on.
    pub async fn begin_processing(&self, id: Uuid) -> Result<(), TaskError> {
        match self
            .transition(id, TaskStatus::Pending, TaskStatus::Processing, Outcome::None)
            .await
        {
            Ok(_) => Ok(()),
            Err(TaskError::Conflict {
                actual: TaskStatus::Processing,
                ..
            }) => {
                debug!(task_id = %id, "Task already processing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `processing → completed`. A no-op if the record already finished.
    pub async fn complete(&self, id: Uuid, result: TaskResult) -> Result<(), TaskError> {
        match self
            .transition(
                id,
                TaskStatus::Processing,
                TaskStatus::Completed,
                Outcome::Result(result),
            )
            .await
        {
            Ok(_) => {
                info!(task_id = %id, "Task completed");
                Ok(())
            }
            Err(TaskError::Conflict { actual, .. }) if actual.is_terminal() => {
                debug!(task_id = %id, status = %actual, "Task already finished, keeping first outcome");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Mark a record failed with a user-visible message. A `pending` record
    /// passes through `processing` first; a finished one is left alone.
    pub async fn fail(&self, id: Uuid, error: &str) -> Result<(), TaskError> {
        let outcome = Outcome::Error(error.to_string());
        match self
            .transition(id, TaskStatus::Processing, TaskStatus::Failed, outcome.clone())
            .await
        {
            Ok(_) => {}
            Err(TaskError::Conflict {
                actual: TaskStatus::Pending,
                ..
            }) => {
                self.begin_processing(id).await?;
                self.transition(id, TaskStatus::Processing, TaskStatus::Failed, outcome)
                    .await?;
            }
            Err(TaskError::Conflict { actual, .. }) if actual.is_terminal() => {
                debug!(task_id = %id, status = %actual, "Task already finished, not failing it");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        info!(task_id = %id, error, "Task failed");
        Ok(())
    }

    /// Operator retry: `failed → processing`, clearing the error.
    pub async fn retry(&self, id: Uuid) -> Result<TaskRecord, TaskError> {
        let record = self
            .apply(id, TaskStatus::Failed, TaskStatus::Processing, Outcome::None)
            .await?;
        info!(task_id = %id, "Task reopened for retry");
        Ok(record)
    }

    pub async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self.db.list_tasks_for_owner(owner_id, limit).await?)
    }

    pub async fn count_by_status(&self, status: TaskStatus) -> Result<u64, TaskError> {
        Ok(self.db.count_tasks_by_status(status).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::schema::InsightRecommendation;
    use crate::store::LibSqlBackend;

    async fn store() -> TaskStore {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        TaskStore::new(db, TaskNotifier::new(64))
    }

    fn report_input() -> TaskInput {
        TaskInput::GenerateReport { lookback_days: 7 }
    }

    fn report_result() -> TaskResult {
        TaskResult::Report {
            insight_id: Uuid::new_v4(),
            recommendation: InsightRecommendation {
                summary: "Two sessions".into(),
                recommendation: "Add a third".into(),
                focus_areas: vec![],
            },
        }
    }

    #[tokio::test]
    async fn create_validates_input() {
        let tasks = store().await;
        let err = tasks
            .create(
                "u1",
                TaskInput::ParseWorkout {
                    text: "   ".into(),
                    performed_on: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));
        assert!(matches!(
            tasks.create("", report_input()).await.unwrap_err(),
            TaskError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn happy_path_notifies_each_step() {
        let tasks = store().await;
        let mut rx = tasks.notifier().subscribe();

        let record = tasks.create("u1", report_input()).await.unwrap();
        tasks.begin_processing(record.id).await.unwrap();
        tasks.complete(record.id, report_result()).await.unwrap();

        let statuses: Vec<TaskStatus> = (0..3).map(|_| rx.try_recv().unwrap().status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Pending,
                TaskStatus::Processing,
                TaskStatus::Completed
            ]
        );

        let stored = tasks.get(record.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.result.is_some());
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let tasks = store().await;
        let record = tasks.create("u1", report_input()).await.unwrap();
        let err = tasks
            .transition(
                record.id,
                TaskStatus::Pending,
                TaskStatus::Completed,
                Outcome::None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn concurrent_transitions_one_wins() {
        let tasks = store().await;
        let record = tasks.create("u1", report_input()).await.unwrap();

        let a = tasks.transition(
            record.id,
            TaskStatus::Pending,
            TaskStatus::Processing,
            Outcome::None,
        );
        let b = tasks.transition(
            record.id,
            TaskStatus::Pending,
            TaskStatus::Processing,
            Outcome::None,
        );
        let (a, b) = tokio::join!(a, b);

        let wins = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(wins, 1);
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(
            loser,
            Err(TaskError::Conflict {
                actual: TaskStatus::Processing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn complete_keeps_first_outcome() {
        let tasks = store().await;
        let record = tasks.create("u1", report_input()).await.unwrap();
        tasks.begin_processing(record.id).await.unwrap();
        tasks.complete(record.id, report_result()).await.unwrap();

        tasks.fail(record.id, "late failure").await.unwrap();
        let stored = tasks.get(record.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn fail_from_pending_passes_through_processing() {
        let tasks = store().await;
        let record = tasks.create("u1", report_input()).await.unwrap();
        tasks.fail(record.id, "bad payload").await.unwrap();

        let stored = tasks.get(record.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("bad payload"));
    }

    #[tokio::test]
    async fn retry_reopens_failed_task() {
        let tasks = store().await;
        let record = tasks.create("u1", report_input()).await.unwrap();
        tasks.fail(record.id, "provider down").await.unwrap();

        let reopened = tasks.retry(record.id).await.unwrap();
        assert_eq!(reopened.status, TaskStatus::Processing);
        assert!(reopened.error.is_none());

        assert!(matches!(
            tasks.retry(record.id).await.unwrap_err(),
            TaskError::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let tasks = store().await;
        assert!(matches!(
            tasks.begin_processing(Uuid::new_v4()).await.unwrap_err(),
            TaskError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn counts_and_listing() {
        let tasks = store().await;
        tasks.create("u1", report_input()).await.unwrap();
        tasks.create("u1", report_input()).await.unwrap();
        tasks.create("u2", report_input()).await.unwrap();

        assert_eq!(tasks.list_for_owner("u1", 10).await.unwrap().len(), 2);
        assert_eq!(tasks.count_by_status(TaskStatus::Pending).await.unwrap(), 3);
    }
}
