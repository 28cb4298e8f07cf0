//! Trigger and status surface consumed by the UI layer.

use tracing::{error, info, warn};
use uuid::Uuid;

use super::TaskStore;
use super::model::{TaskInput, TaskRecord, TaskStatusView};
use crate::bus::EventBus;
use crate::error::TaskError;
use crate::workflows::task_trigger;

/// Creates Task Records and publishes the events that process them.
#[derive(Clone)]
pub struct TaskService {
    tasks: TaskStore,
    bus: EventBus,
}

impl TaskService {
    pub fn new(tasks: TaskStore, bus: EventBus) -> Self {
        Self { tasks, bus }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// Create a `pending` record, then publish its trigger event.
    ///
    /// The record is written first so a worker never sees an event for a
    /// record that doesn't exist. If the publish fails the record is marked
    /// failed rather than left pending forever.
    pub async fn submit_task(&self, owner_id: &str, input: TaskInput) -> Result<Uuid, TaskError> {
        let record = self.tasks.create(owner_id, input).await?;
        if let Err(e) = self.publish_trigger(&record).await {
            error!(task_id = %record.id, "Failed to publish task event: {e}");
            self.mark_unqueued(record.id).await;
            return Err(e);
        }
        Ok(record.id)
    }

    pub async fn get_task_status(&self, id: Uuid) -> Result<TaskStatusView, TaskError> {
        Ok(self.tasks.get(id).await?.status_view())
    }

    /// Reopen a failed task and publish a fresh trigger event for it.
    pub async fn retry_task(&self, id: Uuid) -> Result<TaskStatusView, TaskError> {
        let record = self.tasks.retry(id).await?;
        if let Err(e) = self.publish_trigger(&record).await {
            error!(task_id = %id, "Failed to publish retry event: {e}");
            self.mark_unqueued(record.id).await;
            return Err(e);
        }
        info!(task_id = %id, "Task retry published");
        Ok(record.status_view())
    }

    /// Fail a record whose trigger never reached the bus. A failure here
    /// leaves the record `pending`; the publish error is still returned.
    async fn mark_unqueued(&self, id: Uuid) {
        if let Err(e) = self
            .tasks
            .fail(id, "could not enqueue task for processing")
            .await
        {
            warn!(task_id = %id, "Could not mark unqueued task failed: {e}");
        }
    }

    pub async fn list_tasks(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskStatusView>, TaskError> {
        Ok(self
            .tasks
            .list_for_owner(owner_id, limit)
            .await?
            .iter()
            .map(TaskRecord::status_view)
            .collect())
    }

    async fn publish_trigger(&self, record: &TaskRecord) -> Result<Uuid, TaskError> {
        let (name, payload) =
            task_trigger(record).map_err(|e| TaskError::Publish(e.to_string()))?;
        let event_id = self
            .bus
            .publish(name, payload)
            .await
            .map_err(|e| TaskError::Publish(e.to_string()))?;
        info!(task_id = %record.id, event_id = %event_id, event = name, "Task event published");
        Ok(event_id)
    }
}
