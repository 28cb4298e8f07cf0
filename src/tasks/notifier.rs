//! Client notifier: pushes task status changes to connected clients.
//!
//! Best effort. A client that misses a push (lagged, disconnected) re-reads
//! the record, so nothing here is persisted.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;
use uuid::Uuid;

use super::model::{TaskRecord, TaskResult, TaskStatus};

/// One observed status change of a Task Record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusChange {
    pub task_id: Uuid,
    pub owner_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskStatusChange {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id,
            owner_id: record.owner_id.clone(),
            status: record.status,
            result: record.result.clone(),
            error: record.error.clone(),
            at: record.updated_at,
        }
    }
}

/// Fan-out of status changes to every subscriber.
#[derive(Clone)]
pub struct TaskNotifier {
    tx: broadcast::Sender<TaskStatusChange>,
}

impl TaskNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn notify(&self, change: TaskStatusChange) {
        // No subscribers is fine.
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskStatusChange> {
        self.tx.subscribe()
    }

    /// Changes for one owner's tasks only.
    pub fn stream_for_owner(
        &self,
        owner_id: impl Into<String>,
    ) -> impl Stream<Item = TaskStatusChange> + Send + 'static {
        let owner_id = owner_id.into();
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| match item {
            Ok(change) if change.owner_id == owner_id => Some(change),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!(owner_id = %owner_id, missed = n, "Status subscriber lagged");
                None
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for TaskNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}
