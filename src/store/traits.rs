//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::bus::{Event, EventStatus};
use crate::engine::run::WorkflowRun;
use crate::error::DatabaseError;
use crate::fitness::{BodyMetric, Goal, InactiveUser, Insight, Reminder, Workout};
use crate::tasks::model::{Outcome, TaskRecord, TaskStatus};

/// Backend-agnostic database trait covering the pipeline and the fitness rows
/// its workflows touch.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Conditionally move a task from `from` to `to`, writing `outcome`.
    ///
    /// Returns `false` when the row exists but is not in `from` (or doesn't
    /// exist); the caller decides which.
    async fn transition_task(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        outcome: &Outcome,
    ) -> Result<bool, DatabaseError>;

    /// Most recent tasks for an owner, newest first.
    async fn list_tasks_for_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    async fn count_tasks_by_status(&self, status: TaskStatus) -> Result<u64, DatabaseError>;

    // ── Event outbox ────────────────────────────────────────────────

    /// Insert a queued event. Returns `false` if the id is already present.
    async fn insert_event(&self, event: &Event) -> Result<bool, DatabaseError>;

    async fn get_event_status(&self, id: Uuid) -> Result<Option<EventStatus>, DatabaseError>;

    async fn mark_event_dispatched(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Record a failed delivery; returns the new attempt count.
    async fn record_delivery_failure(&self, id: Uuid, error: &str) -> Result<u32, DatabaseError>;

    async fn mark_event_dead(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError>;

    /// Every event that still needs a run, oldest first: queued ones, plus
    /// dispatched ones whose run never reached a terminal state.
    async fn list_recoverable_events(&self) -> Result<Vec<Event>, DatabaseError>;

    async fn count_events_by_name(&self, name: &str) -> Result<u64, DatabaseError>;

    // ── Workflow runs ───────────────────────────────────────────────

    async fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRun>, DatabaseError>;

    async fn upsert_run(&self, run: &WorkflowRun) -> Result<(), DatabaseError>;

    /// Recent runs of a workflow, newest first.
    async fn list_runs(
        &self,
        workflow: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, DatabaseError>;

    // ── Step results ────────────────────────────────────────────────

    async fn get_step_result(
        &self,
        run_id: Uuid,
        step: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn save_step_result(
        &self,
        run_id: Uuid,
        step: &str,
        output: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Delete cached steps of finished runs older than `keep_days`.
    async fn prune_step_results(&self, keep_days: u32) -> Result<usize, DatabaseError>;

    // ── Cron state ──────────────────────────────────────────────────

    /// Last slot fired for a cron workflow.
    async fn get_cron_slot(&self, workflow: &str) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Compare-and-set the last fired slot. `previous = None` only succeeds when
    /// no state exists yet. Returns `true` if this caller won.
    async fn advance_cron_slot(
        &self,
        workflow: &str,
        previous: Option<DateTime<Utc>>,
        slot: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    async fn upsert_user(&self, user_id: &str) -> Result<(), DatabaseError>;

    /// User ids in ascending order, strictly after `after`.
    async fn list_user_ids(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError>;

    // ── Workouts ────────────────────────────────────────────────────

    /// Insert a workout and all of its sets. Idempotent on `workout.id`.
    async fn insert_workout(&self, workout: &Workout) -> Result<(), DatabaseError>;

    async fn get_workout(&self, id: Uuid) -> Result<Option<Workout>, DatabaseError>;

    /// Workouts performed on or after `since`, oldest first.
    async fn list_workouts_since(
        &self,
        owner_id: &str,
        since: NaiveDate,
    ) -> Result<Vec<Workout>, DatabaseError>;

    /// Users whose last workout predates `cutoff`, or who never logged one and
    /// joined before it. Keyset-paginated by user id.
    async fn list_inactive_users(
        &self,
        cutoff: NaiveDate,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InactiveUser>, DatabaseError>;

    // ── Body metrics ────────────────────────────────────────────────

    /// Insert or replace the metric for `(owner_id, metric_date)`.
    async fn upsert_body_metric(&self, metric: &BodyMetric) -> Result<(), DatabaseError>;

    async fn get_body_metric(
        &self,
        owner_id: &str,
        date: NaiveDate,
    ) -> Result<Option<BodyMetric>, DatabaseError>;

    async fn latest_body_metric(&self, owner_id: &str)
    -> Result<Option<BodyMetric>, DatabaseError>;

    // ── Goals ───────────────────────────────────────────────────────

    async fn insert_goal(&self, goal: &Goal) -> Result<(), DatabaseError>;

    /// Most recently created active goal.
    async fn get_active_goal(&self, owner_id: &str) -> Result<Option<Goal>, DatabaseError>;

    // ── Insights ────────────────────────────────────────────────────

    /// Returns `false` if an insight with this id already exists.
    async fn insert_insight(&self, insight: &Insight) -> Result<bool, DatabaseError>;

    async fn list_insights(&self, owner_id: &str) -> Result<Vec<Insight>, DatabaseError>;

    // ── Reminders ───────────────────────────────────────────────────

    /// Insert all reminders in one statement, skipping ids already present.
    /// Returns the number of new rows.
    async fn insert_reminders(&self, reminders: &[Reminder]) -> Result<usize, DatabaseError>;

    async fn list_reminders(&self, owner_id: &str) -> Result<Vec<Reminder>, DatabaseError>;
}
