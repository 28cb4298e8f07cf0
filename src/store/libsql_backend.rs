//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is shared
//! by every caller; multi-row writes go out as one statement so each is atomic
//! without holding a transaction open on the shared connection.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{Event, EventStatus};
use crate::engine::run::{RunState, WorkflowRun};
use crate::error::DatabaseError;
use crate::fitness::{BodyMetric, Goal, InactiveUser, Insight, Reminder, Workout};
use crate::inference::schema::{ParsedExercise, ParsedSet};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::model::{Outcome, TaskKind, TaskRecord, TaskStatus};

/// Rows per multi-row INSERT, well under SQLite's bound-parameter limit.
const INSERT_CHUNK_ROWS: usize = 200;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Raw connection for tests that need to break the schema.
    #[cfg(test)]
    pub(crate) fn raw_conn(&self) -> &Connection {
        &self.conn
    }

    async fn load_sets(&self, workout_id: &str) -> Result<Vec<ParsedExercise>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT exercise, reps, weight FROM workout_sets WHERE workout_id = ?1 ORDER BY position",
                params![workout_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_sets: {e}")))?;

        let mut exercises: Vec<ParsedExercise> = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let name: String = row.get(0).unwrap_or_default();
            let reps: i64 = row.get(1).unwrap_or_default();
            let weight = parse_decimal(&row.get::<String>(2).unwrap_or_default());
            let set = ParsedSet::new(reps.max(0) as u32, weight);

            // Sets are stored flat in order; consecutive rows regroup.
            match exercises.last_mut() {
                Some(last) if last.name == name => last.sets.push(set),
                _ => exercises.push(ParsedExercise {
                    name,
                    sets: vec![set],
                }),
            }
        }
        Ok(exercises)
    }

    async fn query_workouts(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Workout>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut heads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            heads.push(row_to_workout_head(&row)?);
        }

        let mut workouts = Vec::with_capacity(heads.len());
        for mut workout in heads {
            workout.exercises = self.load_sets(&workout.id.to_string()).await?;
            workouts.push(workout);
        }
        Ok(workouts)
    }

    /// Execute a multi-row `INSERT OR IGNORE` in chunks, returning rows added.
    async fn insert_rows(
        &self,
        head: &str,
        columns: usize,
        rows: Vec<Vec<libsql::Value>>,
        op: &str,
    ) -> Result<usize, DatabaseError> {
        let mut inserted = 0usize;
        let placeholder = format!("({})", vec!["?"; columns].join(", "));

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let sql = format!("{head} VALUES {}", vec![placeholder.as_str(); chunk.len()].join(", "));
            let values: Vec<libsql::Value> = chunk.iter().flatten().cloned().collect();
            let n = self
                .conn()
                .execute(&sql, libsql::params::Params::Positional(values))
                .await
                .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
            inserted += n as usize;
        }
        Ok(inserted)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width so text ordering matches time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_date(s: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("bad date '{s}': {e}")))
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn row_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op} row parse: {e}"))
}

/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let err = row_err("task");
    let id_str: String = row.get(0).map_err(&err)?;
    let owner_id: String = row.get(1).map_err(&err)?;
    let kind_str: String = row.get(2).map_err(&err)?;
    let input_str: String = row.get(3).map_err(&err)?;
    let status_str: String = row.get(4).map_err(&err)?;
    let result_str: Option<String> = row.get(5).ok();
    let error: Option<String> = row.get(6).ok();
    let created_str: String = row.get(7).map_err(&err)?;
    let processed_str: Option<String> = row.get(8).ok();
    let updated_str: String = row.get(9).map_err(&err)?;

    let kind = TaskKind::from_str(&kind_str).map_err(DatabaseError::Serialization)?;
    let status = TaskStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?;
    let input = serde_json::from_str(&input_str)
        .map_err(|e| DatabaseError::Serialization(format!("task input: {e}")))?;
    let result = match result_str {
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("task result: {e}")))?,
        ),
        None => None,
    };

    Ok(TaskRecord {
        id: parse_uuid(&id_str)?,
        owner_id,
        kind,
        input,
        status,
        result,
        error,
        created_at: parse_datetime(&created_str),
        processed_at: parse_optional_datetime(&processed_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Column order matches EVENT_COLUMNS.
fn row_to_event(row: &libsql::Row) -> Result<Event, DatabaseError> {
    let err = row_err("event");
    let id_str: String = row.get(0).map_err(&err)?;
    let name: String = row.get(1).map_err(&err)?;
    let payload_str: String = row.get(2).map_err(&err)?;
    let attempts: i64 = row.get(3).unwrap_or(0);
    let published_str: String = row.get(4).map_err(&err)?;

    Ok(Event {
        id: parse_uuid(&id_str)?,
        name,
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| DatabaseError::Serialization(format!("event payload: {e}")))?,
        attempts: attempts.max(0) as u32,
        published_at: parse_datetime(&published_str),
    })
}

/// Column order matches RUN_COLUMNS.
fn row_to_run(row: &libsql::Row) -> Result<WorkflowRun, DatabaseError> {
    let err = row_err("run");
    let id_str: String = row.get(0).map_err(&err)?;
    let workflow: String = row.get(1).map_err(&err)?;
    let event_id_str: String = row.get(2).map_err(&err)?;
    let event_name: String = row.get(3).map_err(&err)?;
    let state_str: String = row.get(4).map_err(&err)?;
    let attempt: i64 = row.get(5).unwrap_or(0);
    let last_error: Option<String> = row.get(6).ok();
    let output_str: Option<String> = row.get(7).ok();
    let started_str: String = row.get(8).map_err(&err)?;
    let finished_str: Option<String> = row.get(9).ok();
    let updated_str: String = row.get(10).map_err(&err)?;

    Ok(WorkflowRun {
        id: parse_uuid(&id_str)?,
        workflow,
        event_id: parse_uuid(&event_id_str)?,
        event_name,
        state: RunState::from_str(&state_str).map_err(DatabaseError::Serialization)?,
        attempt: attempt.max(0) as u32,
        last_error,
        output: output_str.and_then(|s| serde_json::from_str(&s).ok()),
        started_at: parse_datetime(&started_str),
        finished_at: parse_optional_datetime(&finished_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Workout row without its sets. Column order matches WORKOUT_COLUMNS.
fn row_to_workout_head(row: &libsql::Row) -> Result<Workout, DatabaseError> {
    let err = row_err("workout");
    let id_str: String = row.get(0).map_err(&err)?;
    let owner_id: String = row.get(1).map_err(&err)?;
    let task_id_str: Option<String> = row.get(2).ok();
    let performed_str: String = row.get(3).map_err(&err)?;
    let created_str: String = row.get(4).map_err(&err)?;

    Ok(Workout {
        id: parse_uuid(&id_str)?,
        owner_id,
        task_id: task_id_str.and_then(|s| Uuid::parse_str(&s).ok()),
        performed_on: parse_date(&performed_str)?,
        exercises: Vec::new(),
        created_at: parse_datetime(&created_str),
    })
}

/// Column order matches METRIC_COLUMNS.
fn row_to_metric(row: &libsql::Row) -> Result<BodyMetric, DatabaseError> {
    let err = row_err("body_metric");
    let owner_id: String = row.get(0).map_err(&err)?;
    let date_str: String = row.get(1).map_err(&err)?;
    let weight: Option<String> = row.get(2).ok();
    let fat: Option<String> = row.get(3).ok();
    let notes: Option<String> = row.get(4).ok();
    let source: Option<String> = row.get(5).ok();
    let updated_str: String = row.get(6).map_err(&err)?;

    Ok(BodyMetric {
        owner_id,
        metric_date: parse_date(&date_str)?,
        body_weight_kg: weight.and_then(|s| Decimal::from_str(&s).ok()),
        body_fat_pct: fat.and_then(|s| Decimal::from_str(&s).ok()),
        notes,
        source_task_id: source.and_then(|s| Uuid::parse_str(&s).ok()),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Column order matches GOAL_COLUMNS.
fn row_to_goal(row: &libsql::Row) -> Result<Goal, DatabaseError> {
    let err = row_err("goal");
    let id_str: String = row.get(0).map_err(&err)?;
    let owner_id: String = row.get(1).map_err(&err)?;
    let description: String = row.get(2).map_err(&err)?;
    let target: Option<String> = row.get(3).ok();
    let active: i64 = row.get(4).unwrap_or(0);
    let created_str: String = row.get(5).map_err(&err)?;

    Ok(Goal {
        id: parse_uuid(&id_str)?,
        owner_id,
        description,
        target_date: target.and_then(|s| parse_date(&s).ok()),
        active: active != 0,
        created_at: parse_datetime(&created_str),
    })
}

/// Column order matches INSIGHT_COLUMNS.
fn row_to_insight(row: &libsql::Row) -> Result<Insight, DatabaseError> {
    let err = row_err("insight");
    let id_str: String = row.get(0).map_err(&err)?;
    let owner_id: String = row.get(1).map_err(&err)?;
    let start_str: String = row.get(2).map_err(&err)?;
    let end_str: String = row.get(3).map_err(&err)?;
    let summary: String = row.get(4).map_err(&err)?;
    let recommendation: String = row.get(5).map_err(&err)?;
    let focus_str: String = row.get(6).unwrap_or_else(|_| "[]".into());
    let run_id_str: String = row.get(7).map_err(&err)?;
    let created_str: String = row.get(8).map_err(&err)?;

    Ok(Insight {
        id: parse_uuid(&id_str)?,
        owner_id,
        period_start: parse_date(&start_str)?,
        period_end: parse_date(&end_str)?,
        summary,
        recommendation,
        focus_areas: serde_json::from_str(&focus_str).unwrap_or_default(),
        run_id: parse_uuid(&run_id_str)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_reminder(row: &libsql::Row) -> Result<Reminder, DatabaseError> {
    let err = row_err("reminder");
    let id_str: String = row.get(0).map_err(&err)?;
    let owner_id: String = row.get(1).map_err(&err)?;
    let message: String = row.get(2).map_err(&err)?;
    let created_str: String = row.get(3).map_err(&err)?;

    Ok(Reminder {
        id: parse_uuid(&id_str)?,
        owner_id,
        message,
        created_at: parse_datetime(&created_str),
    })
}

async fn read_count(rows: &mut libsql::Rows, op: &str) -> Result<u64, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

// ── Trait implementation ────────────────────────────────────────────

const TASK_COLUMNS: &str =
    "id, owner_id, kind, input, status, result, error, created_at, processed_at, updated_at";

const EVENT_COLUMNS: &str = "id, name, payload, attempts, published_at";

const RUN_COLUMNS: &str = "id, workflow, event_id, event_name, state, attempt, last_error, output, started_at, finished_at, updated_at";

const WORKOUT_COLUMNS: &str = "id, owner_id, task_id, performed_on, created_at";

const METRIC_COLUMNS: &str =
    "owner_id, metric_date, body_weight_kg, body_fat_pct, notes, source_task_id, updated_at";

const GOAL_COLUMNS: &str = "id, owner_id, description, target_date, active, created_at";

const INSIGHT_COLUMNS: &str = "id, owner_id, period_start, period_end, summary, recommendation, focus_areas, run_id, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
        let input = serde_json::to_string(&task.input)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let result = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    task.id.to_string(),
                    task.owner_id.clone(),
                    task.kind.as_str(),
                    input,
                    task.status.as_str(),
                    opt_text(result),
                    opt_text(task.error.clone()),
                    ts(&task.created_at),
                    opt_text(task.processed_at.as_ref().map(ts)),
                    ts(&task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        debug!(task_id = %task.id, kind = %task.kind, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn transition_task(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        outcome: &Outcome,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let (result, error) = match outcome {
            Outcome::None => (None, None),
            Outcome::Result(r) => (
                Some(
                    serde_json::to_string(r)
                        .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                ),
                None,
            ),
            Outcome::Error(e) => (None, Some(e.clone())),
        };
        let processed_at = to.is_terminal().then(|| ts(&now));

        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, result = ?2, error = ?3, processed_at = ?4, updated_at = ?5 WHERE id = ?6 AND status = ?7",
                params![
                    to.as_str(),
                    opt_text(result),
                    opt_text(error),
                    opt_text(processed_at),
                    ts(&now),
                    id.to_string(),
                    from.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_task: {e}")))?;

        Ok(affected == 1)
    }

    async fn list_tasks_for_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![owner_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_for_owner: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn count_tasks_by_status(&self, status: TaskStatus) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tasks_by_status: {e}")))?;
        read_count(&mut rows, "count_tasks_by_status").await
    }

    // ── Event outbox ────────────────────────────────────────────────

    async fn insert_event(&self, event: &Event) -> Result<bool, DatabaseError> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let published = ts(&event.published_at);

        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO events (id, name, payload, status, attempts, published_at, updated_at) VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?5)",
                params![
                    event.id.to_string(),
                    event.name.clone(),
                    payload,
                    event.attempts as i64,
                    published,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_event: {e}")))?;

        Ok(affected == 1)
    }

    async fn get_event_status(&self, id: Uuid) -> Result<Option<EventStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM events WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_event_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let s: String = row.get(0).unwrap_or_default();
                Ok(Some(
                    EventStatus::from_str(&s).map_err(DatabaseError::Serialization)?,
                ))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_event_status: {e}"))),
        }
    }

    async fn mark_event_dispatched(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE events SET status = 'dispatched', updated_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_event_dispatched: {e}")))?;
        Ok(())
    }

    async fn record_delivery_failure(&self, id: Uuid, error: &str) -> Result<u32, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE events SET attempts = attempts + 1, last_error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_delivery_failure: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "SELECT attempts FROM events WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_delivery_failure: {e}")))?;
        Ok(read_count(&mut rows, "record_delivery_failure").await? as u32)
    }

    async fn mark_event_dead(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE events SET status = 'dead', last_error = ?1, updated_at = ?2 WHERE id = ?3",
                params![reason, ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_event_dead: {e}")))?;
        Ok(())
    }

    async fn list_recoverable_events(&self) -> Result<Vec<Event>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE status = 'queued'
                        OR (status = 'dispatched' AND id IN (
                            SELECT event_id FROM workflow_runs
                            WHERE state NOT IN ('succeeded', 'failed')))
                     ORDER BY published_at, rowid"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recoverable_events: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_event(&row) {
                Ok(ev) => events.push(ev),
                Err(e) => tracing::warn!("Skipping event row: {e}"),
            }
        }
        Ok(events)
    }

    async fn count_events_by_name(&self, name: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM events WHERE name = ?1", params![name])
            .await
            .map_err(|e| DatabaseError::Query(format!("count_events_by_name: {e}")))?;
        read_count(&mut rows, "count_events_by_name").await
    }

    // ── Workflow runs ───────────────────────────────────────────────

    async fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_run: {e}"))),
        }
    }

    async fn upsert_run(&self, run: &WorkflowRun) -> Result<(), DatabaseError> {
        let output = run
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO workflow_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT (id) DO UPDATE SET state = ?5, attempt = ?6, last_error = ?7, output = ?8, finished_at = ?10, updated_at = ?11"
                ),
                params![
                    run.id.to_string(),
                    run.workflow.clone(),
                    run.event_id.to_string(),
                    run.event_name.clone(),
                    run.state.as_str(),
                    run.attempt as i64,
                    opt_text(run.last_error.clone()),
                    opt_text(output),
                    ts(&run.started_at),
                    opt_text(run.finished_at.as_ref().map(ts)),
                    ts(&run.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_run: {e}")))?;
        Ok(())
    }

    async fn list_runs(
        &self,
        workflow: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2"
                ),
                params![workflow, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_run(&row) {
                Ok(r) => runs.push(r),
                Err(e) => tracing::warn!("Skipping run row: {e}"),
            }
        }
        Ok(runs)
    }

    // ── Step results ────────────────────────────────────────────────

    async fn get_step_result(
        &self,
        run_id: Uuid,
        step: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT output FROM step_results WHERE run_id = ?1 AND step = ?2",
                params![run_id.to_string(), step],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_step_result: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let s: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_step_result row parse: {e}")))?;
                let value = serde_json::from_str(&s)
                    .map_err(|e| DatabaseError::Serialization(format!("step {step}: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_step_result: {e}"))),
        }
    }

    async fn save_step_result(
        &self,
        run_id: Uuid,
        step: &str,
        output: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let output = serde_json::to_string(output)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        // First successful result wins.
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO step_results (run_id, step, output, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![run_id.to_string(), step, output, ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_step_result: {e}")))?;
        Ok(())
    }

    async fn prune_step_results(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(keep_days as i64);
        let affected = self
            .conn()
            .execute(
                "DELETE FROM step_results WHERE created_at < ?1 AND run_id IN (SELECT id FROM workflow_runs WHERE state IN ('succeeded', 'failed'))",
                params![ts(&cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_step_results: {e}")))?;
        Ok(affected as usize)
    }

    // ── Cron state ──────────────────────────────────────────────────

    async fn get_cron_slot(&self, workflow: &str) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT last_slot FROM cron_state WHERE workflow = ?1",
                params![workflow],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cron_slot: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let s: String = row.get(0).unwrap_or_default();
                Ok(Some(parse_datetime(&s)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_cron_slot: {e}"))),
        }
    }

    async fn advance_cron_slot(
        &self,
        workflow: &str,
        previous: Option<DateTime<Utc>>,
        slot: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let now = ts(&Utc::now());
        let affected = match previous {
            None => self
                .conn()
                .execute(
                    "INSERT OR IGNORE INTO cron_state (workflow, last_slot, updated_at) VALUES (?1, ?2, ?3)",
                    params![workflow, ts(&slot), now],
                )
                .await,
            Some(prev) => self
                .conn()
                .execute(
                    "UPDATE cron_state SET last_slot = ?1, updated_at = ?2 WHERE workflow = ?3 AND last_slot = ?4",
                    params![ts(&slot), now, workflow, ts(&prev)],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("advance_cron_slot: {e}")))?;

        Ok(affected == 1)
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn upsert_user(&self, user_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
                params![user_id, ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_user: {e}")))?;
        Ok(())
    }

    async fn list_user_ids(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM users WHERE id > ?1 ORDER BY id LIMIT ?2",
                params![after.unwrap_or(""), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_user_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<String>(0) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    // ── Workouts ────────────────────────────────────────────────────

    async fn insert_workout(&self, workout: &Workout) -> Result<(), DatabaseError> {
        let workout_id = workout.id.to_string();

        let set_rows: Vec<Vec<libsql::Value>> = workout
            .exercises
            .iter()
            .flat_map(|e| e.sets.iter().map(move |s| (e.name.as_str(), s)))
            .enumerate()
            .map(|(position, (name, set))| {
                vec![
                    libsql::Value::Text(workout_id.clone()),
                    libsql::Value::Integer(position as i64),
                    libsql::Value::Text(name.to_string()),
                    libsql::Value::Integer(set.reps as i64),
                    libsql::Value::Text(set.weight.to_string()),
                ]
            })
            .collect();

        // Sets first: the workout row is what makes them visible to readers.
        self.insert_rows(
            "INSERT OR IGNORE INTO workout_sets (workout_id, position, exercise, reps, weight)",
            5,
            set_rows,
            "insert_workout sets",
        )
        .await?;

        self.conn()
            .execute(
                &format!("INSERT OR IGNORE INTO workouts ({WORKOUT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    workout_id.clone(),
                    workout.owner_id.clone(),
                    opt_text(workout.task_id.map(|id| id.to_string())),
                    workout.performed_on.to_string(),
                    ts(&workout.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_workout: {e}")))?;

        debug!(workout_id = %workout.id, sets = workout.set_count(), "Workout inserted");
        Ok(())
    }

    async fn get_workout(&self, id: Uuid) -> Result<Option<Workout>, DatabaseError> {
        let mut found = self
            .query_workouts(
                &format!("SELECT {WORKOUT_COLUMNS} FROM workouts WHERE id = ?1"),
                params![id.to_string()],
                "get_workout",
            )
            .await?;
        Ok(found.pop())
    }

    async fn list_workouts_since(
        &self,
        owner_id: &str,
        since: NaiveDate,
    ) -> Result<Vec<Workout>, DatabaseError> {
        self.query_workouts(
            &format!(
                "SELECT {WORKOUT_COLUMNS} FROM workouts WHERE owner_id = ?1 AND performed_on >= ?2 ORDER BY performed_on, created_at"
            ),
            params![owner_id, since.to_string()],
            "list_workouts_since",
        )
        .await
    }

    async fn list_inactive_users(
        &self,
        cutoff: NaiveDate,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InactiveUser>, DatabaseError> {
        let cutoff_ts = cutoff
            .and_hms_opt(0, 0, 0)
            .map(|dt| ts(&dt.and_utc()))
            .unwrap_or_else(|| cutoff.to_string());
        let mut rows = self
            .conn()
            .query(
                "SELECT u.id, MAX(w.performed_on) AS last_on
                 FROM users u LEFT JOIN workouts w ON w.owner_id = u.id
                 WHERE u.id > ?1
                 GROUP BY u.id
                 HAVING (last_on IS NULL AND u.created_at < ?2) OR last_on < ?3
                 ORDER BY u.id
                 LIMIT ?4",
                params![
                    after.unwrap_or(""),
                    cutoff_ts,
                    cutoff.to_string(),
                    limit as i64
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_inactive_users: {e}")))?;

        let mut users = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let user_id: String = row.get(0).unwrap_or_default();
            let last: Option<String> = row.get(1).ok();
            users.push(InactiveUser {
                user_id,
                last_workout_on: last.and_then(|s| parse_date(&s).ok()),
            });
        }
        Ok(users)
    }

    // ── Body metrics ────────────────────────────────────────────────

    async fn upsert_body_metric(&self, metric: &BodyMetric) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO body_metrics ({METRIC_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (owner_id, metric_date) DO UPDATE SET body_weight_kg = ?3, body_fat_pct = ?4, notes = ?5, source_task_id = ?6, updated_at = ?7"
                ),
                params![
                    metric.owner_id.clone(),
                    metric.metric_date.to_string(),
                    opt_text(metric.body_weight_kg.map(|d| d.to_string())),
                    opt_text(metric.body_fat_pct.map(|d| d.to_string())),
                    opt_text(metric.notes.clone()),
                    opt_text(metric.source_task_id.map(|id| id.to_string())),
                    ts(&metric.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_body_metric: {e}")))?;
        Ok(())
    }

    async fn get_body_metric(
        &self,
        owner_id: &str,
        date: NaiveDate,
    ) -> Result<Option<BodyMetric>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {METRIC_COLUMNS} FROM body_metrics WHERE owner_id = ?1 AND metric_date = ?2"
                ),
                params![owner_id, date.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_body_metric: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_metric(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_body_metric: {e}"))),
        }
    }

    async fn latest_body_metric(
        &self,
        owner_id: &str,
    ) -> Result<Option<BodyMetric>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {METRIC_COLUMNS} FROM body_metrics WHERE owner_id = ?1 ORDER BY metric_date DESC LIMIT 1"
                ),
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_body_metric: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_metric(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_body_metric: {e}"))),
        }
    }

    // ── Goals ───────────────────────────────────────────────────────

    async fn insert_goal(&self, goal: &Goal) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO goals ({GOAL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    goal.id.to_string(),
                    goal.owner_id.clone(),
                    goal.description.clone(),
                    opt_text(goal.target_date.map(|d| d.to_string())),
                    goal.active as i64,
                    ts(&goal.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_goal: {e}")))?;
        Ok(())
    }

    async fn get_active_goal(&self, owner_id: &str) -> Result<Option<Goal>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {GOAL_COLUMNS} FROM goals WHERE owner_id = ?1 AND active = 1 ORDER BY created_at DESC LIMIT 1"
                ),
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_goal: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_goal(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_active_goal: {e}"))),
        }
    }

    // ── Insights ────────────────────────────────────────────────────

    async fn insert_insight(&self, insight: &Insight) -> Result<bool, DatabaseError> {
        let focus = serde_json::to_string(&insight.focus_areas)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let affected = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO insights ({INSIGHT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    insight.id.to_string(),
                    insight.owner_id.clone(),
                    insight.period_start.to_string(),
                    insight.period_end.to_string(),
                    insight.summary.clone(),
                    insight.recommendation.clone(),
                    focus,
                    insight.run_id.to_string(),
                    ts(&insight.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_insight: {e}")))?;

        Ok(affected == 1)
    }

    async fn list_insights(&self, owner_id: &str) -> Result<Vec<Insight>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INSIGHT_COLUMNS} FROM insights WHERE owner_id = ?1 ORDER BY created_at"
                ),
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_insights: {e}")))?;

        let mut insights = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_insight(&row) {
                Ok(i) => insights.push(i),
                Err(e) => tracing::warn!("Skipping insight row: {e}"),
            }
        }
        Ok(insights)
    }

    // ── Reminders ───────────────────────────────────────────────────

    async fn insert_reminders(&self, reminders: &[Reminder]) -> Result<usize, DatabaseError> {
        let rows = reminders
            .iter()
            .map(|r| {
                vec![
                    libsql::Value::Text(r.id.to_string()),
                    libsql::Value::Text(r.owner_id.clone()),
                    libsql::Value::Text(r.message.clone()),
                    libsql::Value::Text(ts(&r.created_at)),
                ]
            })
            .collect();

        self.insert_rows(
            "INSERT OR IGNORE INTO reminders (id, owner_id, message, created_at)",
            4,
            rows,
            "insert_reminders",
        )
        .await
    }

    async fn list_reminders(&self, owner_id: &str) -> Result<Vec<Reminder>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, owner_id, message, created_at FROM reminders WHERE owner_id = ?1 ORDER BY created_at",
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_reminders: {e}")))?;

        let mut reminders = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_reminder(&row) {
                Ok(r) => reminders.push(r),
                Err(e) => tracing::warn!("Skipping reminder row: {e}"),
            }
        }
        Ok(reminders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::{TaskInput, TaskResult};
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn parse_task(owner: &str) -> TaskRecord {
        TaskRecord::new(
            owner,
            TaskInput::ParseWorkout {
                text: "Bench 100 5 5 5".into(),
                performed_on: None,
            },
        )
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_task() {
        let db = test_db().await;
        let task = parse_task("u1");
        db.insert_task(&task).await.unwrap();

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.input, task.input);
        assert!(fetched.processed_at.is_none());
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let db = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conditional_transition() {
        let db = test_db().await;
        let task = parse_task("u1");
        db.insert_task(&task).await.unwrap();

        assert!(
            db.transition_task(task.id, TaskStatus::Pending, TaskStatus::Processing, &Outcome::None)
                .await
                .unwrap()
        );
        // Second identical transition loses.
        assert!(
            !db.transition_task(task.id, TaskStatus::Pending, TaskStatus::Processing, &Outcome::None)
                .await
                .unwrap()
        );

        let result = TaskResult::ParsedWorkout {
            workout_id: Uuid::new_v4(),
            exercises: vec![],
        };
        assert!(
            db.transition_task(
                task.id,
                TaskStatus::Processing,
                TaskStatus::Completed,
                &Outcome::Result(result.clone())
            )
            .await
            .unwrap()
        );

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.result, Some(result));
        assert!(fetched.processed_at.is_some());
    }

    #[tokio::test]
    async fn list_and_count_tasks() {
        let db = test_db().await;
        for _ in 0..3 {
            db.insert_task(&parse_task("u1")).await.unwrap();
        }
        db.insert_task(&parse_task("u2")).await.unwrap();

        assert_eq!(db.list_tasks_for_owner("u1", 10).await.unwrap().len(), 3);
        assert_eq!(db.list_tasks_for_owner("u1", 2).await.unwrap().len(), 2);
        assert_eq!(db.count_tasks_by_status(TaskStatus::Pending).await.unwrap(), 4);
        assert_eq!(db.count_tasks_by_status(TaskStatus::Failed).await.unwrap(), 0);
    }

    // ── Event tests ─────────────────────────────────────────────────

    fn event(name: &str) -> Event {
        Event {
            id: Uuid::new_v4(),
            name: name.into(),
            payload: serde_json::json!({"x": 1}),
            attempts: 0,
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn event_insert_is_idempotent() {
        let db = test_db().await;
        let ev = event("workout/text.submitted");
        assert!(db.insert_event(&ev).await.unwrap());
        assert!(!db.insert_event(&ev).await.unwrap());
        assert_eq!(
            db.count_events_by_name("workout/text.submitted").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn event_lifecycle() {
        let db = test_db().await;
        let a = event("a");
        let b = event("b");
        db.insert_event(&a).await.unwrap();
        db.insert_event(&b).await.unwrap();

        assert_eq!(db.list_recoverable_events().await.unwrap().len(), 2);

        db.mark_event_dispatched(a.id).await.unwrap();
        assert_eq!(
            db.get_event_status(a.id).await.unwrap(),
            Some(EventStatus::Dispatched)
        );

        assert_eq!(db.record_delivery_failure(b.id, "boom").await.unwrap(), 1);
        assert_eq!(db.record_delivery_failure(b.id, "boom").await.unwrap(), 2);
        let queued = db.list_recoverable_events().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 2);

        db.mark_event_dead(b.id, "gave up").await.unwrap();
        assert!(db.list_recoverable_events().await.unwrap().is_empty());
        assert_eq!(
            db.get_event_status(b.id).await.unwrap(),
            Some(EventStatus::Dead)
        );
    }

    #[tokio::test]
    async fn interrupted_runs_are_recoverable() {
        let db = test_db().await;
        let interrupted = event("a");
        let finished = event("b");
        for ev in [&interrupted, &finished] {
            db.insert_event(ev).await.unwrap();
            db.mark_event_dispatched(ev.id).await.unwrap();
        }

        let mut running = WorkflowRun::triggered(Uuid::new_v4(), "w", interrupted.id, "a");
        running.state = RunState::Running;
        db.upsert_run(&running).await.unwrap();

        let mut done = WorkflowRun::triggered(Uuid::new_v4(), "w", finished.id, "b");
        done.state = RunState::Succeeded;
        db.upsert_run(&done).await.unwrap();

        let recoverable = db.list_recoverable_events().await.unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].id, interrupted.id);
    }

    // ── Run + step tests ────────────────────────────────────────────

    #[tokio::test]
    async fn run_upsert_roundtrip() {
        let db = test_db().await;
        let mut run = WorkflowRun::triggered(Uuid::new_v4(), "parse-workout", Uuid::new_v4(), "e");
        db.upsert_run(&run).await.unwrap();

        run.state = RunState::Failed;
        run.attempt = 3;
        run.last_error = Some("boom".into());
        run.finished_at = Some(Utc::now());
        db.upsert_run(&run).await.unwrap();

        let fetched = db.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, RunState::Failed);
        assert_eq!(fetched.attempt, 3);
        assert_eq!(fetched.last_error.as_deref(), Some("boom"));
        assert_eq!(db.list_runs("parse-workout", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn step_results_first_write_wins() {
        let db = test_db().await;
        let run_id = Uuid::new_v4();
        assert!(db.get_step_result(run_id, "s").await.unwrap().is_none());

        db.save_step_result(run_id, "s", &serde_json::json!(1))
            .await
            .unwrap();
        db.save_step_result(run_id, "s", &serde_json::json!(2))
            .await
            .unwrap();
        assert_eq!(
            db.get_step_result(run_id, "s").await.unwrap(),
            Some(serde_json::json!(1))
        );
    }

    #[tokio::test]
    async fn prune_keeps_live_runs() {
        let db = test_db().await;
        let mut done = WorkflowRun::triggered(Uuid::new_v4(), "w", Uuid::new_v4(), "e");
        done.state = RunState::Succeeded;
        db.upsert_run(&done).await.unwrap();
        let live = WorkflowRun::triggered(Uuid::new_v4(), "w", Uuid::new_v4(), "e");
        db.upsert_run(&live).await.unwrap();

        db.save_step_result(done.id, "s", &serde_json::json!(null))
            .await
            .unwrap();
        db.save_step_result(live.id, "s", &serde_json::json!(null))
            .await
            .unwrap();

        // keep_days = 0 means anything created before now.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(db.prune_step_results(0).await.unwrap(), 1);
        assert!(db.get_step_result(live.id, "s").await.unwrap().is_some());
    }

    // ── Cron tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn cron_slot_compare_and_set() {
        let db = test_db().await;
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::hours(1);

        assert!(db.get_cron_slot("w").await.unwrap().is_none());
        assert!(db.advance_cron_slot("w", None, t0).await.unwrap());
        assert!(!db.advance_cron_slot("w", None, t0).await.unwrap());

        let stored = db.get_cron_slot("w").await.unwrap().unwrap();
        assert!(db.advance_cron_slot("w", Some(stored), t1).await.unwrap());
        // A second ticker holding the stale slot loses.
        assert!(!db.advance_cron_slot("w", Some(stored), t1).await.unwrap());
    }

    // ── Fitness tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn users_paginate() {
        let db = test_db().await;
        for id in ["c", "a", "b", "a"] {
            db.upsert_user(id).await.unwrap();
        }
        assert_eq!(db.list_user_ids(None, 2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(db.list_user_ids(Some("b"), 2).await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn workout_roundtrip_and_idempotent() {
        let db = test_db().await;
        let workout = Workout {
            id: Uuid::new_v4(),
            owner_id: "u1".into(),
            task_id: Some(Uuid::new_v4()),
            performed_on: date("2024-05-06"),
            exercises: vec![
                ParsedExercise {
                    name: "Bench Press".into(),
                    sets: vec![ParsedSet::new(5, dec!(100)); 3],
                },
                ParsedExercise {
                    name: "Pull-Up".into(),
                    sets: vec![ParsedSet::new(8, Decimal::ZERO); 2],
                },
            ],
            created_at: Utc::now(),
        };
        db.insert_workout(&workout).await.unwrap();
        db.insert_workout(&workout).await.unwrap();

        let fetched = db.get_workout(workout.id).await.unwrap().unwrap();
        assert_eq!(fetched.exercises, workout.exercises);
        assert_eq!(fetched.task_id, workout.task_id);

        let since = db
            .list_workouts_since("u1", date("2024-05-01"))
            .await
            .unwrap();
        assert_eq!(since.len(), 1);
        assert!(
            db.list_workouts_since("u1", date("2024-05-07"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn inactive_users() {
        let db = test_db().await;
        for id in ["active", "lapsed", "never"] {
            db.upsert_user(id).await.unwrap();
        }
        for (owner, day) in [("active", "2024-05-10"), ("lapsed", "2024-04-01")] {
            db.insert_workout(&Workout {
                id: Uuid::new_v4(),
                owner_id: owner.into(),
                task_id: None,
                performed_on: date(day),
                exercises: vec![],
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        // Users were created "now", so a cutoff in the past excludes "never".
        let inactive = db
            .list_inactive_users(date("2024-05-03"), None, 10)
            .await
            .unwrap();
        assert_eq!(
            inactive,
            vec![InactiveUser {
                user_id: "lapsed".into(),
                last_workout_on: Some(date("2024-04-01")),
            }]
        );

        let future = Utc::now().date_naive() + chrono::Duration::days(1);
        let ids: Vec<String> = db
            .list_inactive_users(future, None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.user_id)
            .collect();
        assert_eq!(ids, vec!["active", "lapsed", "never"]);
    }

    #[tokio::test]
    async fn body_metric_upsert_by_owner_and_date() {
        let db = test_db().await;
        let mut metric = BodyMetric {
            owner_id: "u1".into(),
            metric_date: date("2024-05-06"),
            body_weight_kg: Some(dec!(82.4)),
            body_fat_pct: None,
            notes: None,
            source_task_id: None,
            updated_at: Utc::now(),
        };
        db.upsert_body_metric(&metric).await.unwrap();
        metric.body_weight_kg = Some(dec!(82.1));
        db.upsert_body_metric(&metric).await.unwrap();

        let latest = db.latest_body_metric("u1").await.unwrap().unwrap();
        assert_eq!(latest.body_weight_kg, Some(dec!(82.1)));
        assert!(
            db.get_body_metric("u1", date("2024-05-06"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn goals_insights_reminders() {
        let db = test_db().await;
        db.insert_goal(&Goal::new("u1", "Bench 120kg")).await.unwrap();
        assert_eq!(
            db.get_active_goal("u1").await.unwrap().unwrap().description,
            "Bench 120kg"
        );
        assert!(db.get_active_goal("u2").await.unwrap().is_none());

        let insight = Insight {
            id: Uuid::new_v4(),
            owner_id: "u1".into(),
            period_start: date("2024-04-29"),
            period_end: date("2024-05-06"),
            summary: "s".into(),
            recommendation: "r".into(),
            focus_areas: vec!["Bench Press".into()],
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        assert!(db.insert_insight(&insight).await.unwrap());
        assert!(!db.insert_insight(&insight).await.unwrap());
        let listed = db.list_insights("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, insight.id);
        assert_eq!(listed[0].focus_areas, insight.focus_areas);

        let reminders: Vec<Reminder> = (0..3)
            .map(|i| Reminder {
                id: Uuid::new_v4(),
                owner_id: format!("u{i}"),
                message: "Time to move".into(),
                created_at: Utc::now(),
            })
            .collect();
        assert_eq!(db.insert_reminders(&reminders).await.unwrap(), 3);
        assert_eq!(db.insert_reminders(&reminders).await.unwrap(), 0);
        assert_eq!(db.list_reminders("u1").await.unwrap().len(), 1);
    }
}
