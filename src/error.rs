//! Error types for the task pipeline.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task Record Store errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    /// The conditional update lost: the record was not in the expected state.
    #[error("Task {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid task input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Event publish failed: {0}")]
    Publish(String),
}

/// Workflow engine errors (registration and dispatch).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Workflow {0} is already registered")]
    DuplicateWorkflow(String),

    #[error("Event {event} already handled by workflow {existing}")]
    DuplicateSubscription { event: String, existing: String },

    #[error("Workflow {0} has no event or cron trigger")]
    NoTrigger(String),

    #[error("Invalid cron schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("Invalid concurrency limit for {workflow}: {limit}")]
    InvalidConcurrency { workflow: String, limit: usize },

    #[error("No workflow subscribed to event {0}")]
    UnknownEvent(String),

    #[error("Unknown workflow {0}")]
    UnknownWorkflow(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Inference collaborator errors.
///
/// Transient failures are retried by the engine; permanent ones fail the run
/// immediately.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference provider {provider} failed (transient): {reason}")]
    Transient { provider: String, reason: String },

    #[error("Inference provider {provider} rejected input: {reason}")]
    Permanent { provider: String, reason: String },
}

impl InferenceError {
    pub fn transient(provider: &str, reason: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn permanent(provider: &str, reason: impl Into<String>) -> Self {
        Self::Permanent {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Blob storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage HTTP error: {0}")]
    Http(String),
}

/// Errors raised by a workflow step or a workflow body.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Step {step} timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    /// Programmer error or malformed event: never retried.
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StepError {
    /// Whether the engine should spend another attempt on this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout { .. } | Self::Database(_)
        )
    }
}

impl From<InferenceError> for StepError {
    fn from(e: InferenceError) -> Self {
        if e.is_transient() {
            StepError::Transient(e.to_string())
        } else {
            StepError::Permanent(e.to_string())
        }
    }
}

impl From<StorageError> for StepError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) | StorageError::InvalidReference(_) => {
                StepError::Permanent(e.to_string())
            }
            StorageError::Io(_) | StorageError::Http(_) => StepError::Transient(e.to_string()),
        }
    }
}

impl From<TaskError> for StepError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::Database(db) => StepError::Database(db),
            TaskError::Publish(reason) => StepError::Transient(reason),
            other => StepError::Fatal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        StepError::Serialization(e.to_string())
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
