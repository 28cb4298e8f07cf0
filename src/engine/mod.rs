//! Workflow engine.
//!
//! Pulls events off the bus, maps each one to its subscribed workflow and
//! executes the workflow body with retries. A run is identified by
//! `(event id, workflow)`, so a redelivered event resumes the same run and
//! replays its completed steps from the step cache instead of repeating them.
//!
//! Per-workflow concurrency is a semaphore held for the whole run, backoff
//! included. Events waiting for a slot stay queued in FIFO order.

pub mod cron;
pub mod registry;
pub mod retry;
pub mod run;
pub mod step;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::bus::{Event, EventBus, EventReceiver, cron_event_id};
use crate::config::EngineConfig;
use crate::error::{EngineError, StepError};
use crate::store::Database;
use crate::tasks::TaskStore;

pub use registry::{RegisteredWorkflow, Registry, RegistryBuilder, Workflow, WorkflowDef};
pub use retry::RetryPolicy;
pub use run::{RunState, WorkflowRun};
pub use step::{OutgoingEvent, StepContext};

/// Run id for `workflow` handling event `event_id`.
pub fn run_id_for(event_id: Uuid, workflow: &str) -> Uuid {
    Uuid::new_v5(&event_id, workflow.as_bytes())
}

/// Executes registered workflows against published events.
pub struct WorkflowEngine {
    registry: Arc<Registry>,
    store: Arc<dyn Database>,
    bus: EventBus,
    tasks: TaskStore,
    config: EngineConfig,
    /// Run ids currently executing in this process.
    active: Mutex<HashSet<Uuid>>,
    running_count: Arc<AtomicUsize>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn Database>,
        bus: EventBus,
        tasks: TaskStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            tasks,
            config,
            active: Mutex::new(HashSet::new()),
            running_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Runs currently executing (holding a concurrency slot).
    pub fn running_count(&self) -> usize {
        self.running_count.load(Ordering::SeqCst)
    }

    /// Spawn the dispatcher loop. Returns when the bus is dropped.
    pub fn start(self: &Arc<Self>, mut rx: EventReceiver) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!(workflows = engine.registry.len(), "Workflow engine started");
            while let Some(event) = rx.recv().await {
                engine.dispatch(event).await;
            }
            info!("Event bus closed, workflow engine stopped");
        })
    }

    /// Route one delivered event to its workflow. The run itself executes on
    /// its own task.
    pub async fn dispatch(self: &Arc<Self>, event: Event) {
        let Some(workflow) = self.registry.for_event(&event.name).cloned() else {
            warn!(event_id = %event.id, name = %event.name, "No workflow subscribed to event");
            let reason = EngineError::UnknownEvent(event.name.clone()).to_string();
            if let Err(e) = self.store.mark_event_dead(event.id, &reason).await {
                error!(event_id = %event.id, "Failed to dead-letter event: {e}");
            }
            return;
        };

        let run_id = run_id_for(event.id, &workflow.name);
        if !self.claim(run_id) {
            debug!(run_id = %run_id, event_id = %event.id, "Run already active, ignoring duplicate delivery");
            return;
        }

        let engine = Arc::clone(self);
        let span = info_span!(
            "workflow_run",
            workflow = %workflow.name,
            run_id = %run_id,
            event_id = %event.id,
        );
        tokio::spawn(
            async move {
                engine.execute(&workflow, event, run_id).await;
                engine.release(run_id);
            }
            .instrument(span),
        );
    }

    async fn execute(&self, workflow: &RegisteredWorkflow, event: Event, run_id: Uuid) {
        let mut run = match self.store.get_run(run_id).await {
            Ok(Some(run)) if run.state.is_terminal() => {
                debug!(state = %run.state, "Run already finished, acknowledging redelivery");
                self.acknowledge(&event).await;
                return;
            }
            Ok(Some(run)) => {
                info!(attempt = run.attempt, state = %run.state, "Resuming interrupted run");
                run
            }
            Ok(None) => {
                let run = WorkflowRun::triggered(run_id, &workflow.name, event.id, &event.name);
                if let Err(e) = self.store.upsert_run(&run).await {
                    self.nack(event, &e.to_string()).await;
                    return;
                }
                run
            }
            Err(e) => {
                self.nack(event, &e.to_string()).await;
                return;
            }
        };

        let permit = match Arc::clone(&workflow.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.nack(event, "concurrency limiter closed").await;
                return;
            }
        };

        if run.attempt >= workflow.retry.max_attempts {
            // Crashed during its last allowed attempt.
            let reason = run
                .last_error
                .clone()
                .unwrap_or_else(|| format!("attempts exhausted ({})", run.attempt));
            self.acknowledge(&event).await;
            self.finish_failed(&mut run, &event, reason).await;
            drop(permit);
            return;
        }

        run.attempt += 1;
        run.state = RunState::Running;
        run.updated_at = Utc::now();
        if let Err(e) = self.store.upsert_run(&run).await {
            drop(permit);
            self.nack(event, &e.to_string()).await;
            return;
        }
        self.acknowledge(&event).await;

        self.running_count.fetch_add(1, Ordering::SeqCst);
        info!(attempt = run.attempt, "Workflow run started");

        loop {
            let step = StepContext::new(
                run.id,
                &workflow.name,
                run.attempt,
                Arc::clone(&self.store),
                self.bus.clone(),
                workflow.step_timeout,
            );

            match workflow.handler.run(&event, &step).await {
                Ok(output) => {
                    run.state = RunState::Succeeded;
                    run.output = Some(output);
                    run.last_error = None;
                    let now = Utc::now();
                    run.finished_at = Some(now);
                    run.updated_at = now;
                    self.save_run(&run).await;
                    info!(attempt = run.attempt, "Workflow run succeeded");
                    break;
                }
                Err(e) if e.is_retryable() && workflow.retry.should_retry(run.attempt) => {
                    let delay = workflow.retry.backoff(run.attempt);
                    run.state = RunState::Retrying;
                    run.last_error = Some(e.to_string());
                    run.updated_at = Utc::now();
                    self.save_run(&run).await;
                    warn!(
                        attempt = run.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Workflow attempt failed, retrying"
                    );

                    tokio::time::sleep(delay).await;

                    run.attempt += 1;
                    run.state = RunState::Running;
                    run.updated_at = Utc::now();
                    self.save_run(&run).await;
                }
                Err(e) => {
                    error!(attempt = run.attempt, error = %e, "Workflow run failed");
                    self.finish_failed(&mut run, &event, terminal_reason(&e)).await;
                    break;
                }
            }
        }

        self.running_count.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
    }

    async fn finish_failed(&self, run: &mut WorkflowRun, event: &Event, reason: String) {
        run.state = RunState::Failed;
        run.last_error = Some(reason.clone());
        let now = Utc::now();
        run.finished_at = Some(now);
        run.updated_at = now;
        self.save_run(run).await;

        if let Some(task_id) = event.task_id() {
            if let Err(e) = self.tasks.fail(task_id, &reason).await {
                error!(task_id = %task_id, "Failed to record task failure: {e}");
            }
        }
    }

    async fn save_run(&self, run: &WorkflowRun) {
        if let Err(e) = self.store.upsert_run(run).await {
            error!(run_id = %run.id, state = %run.state, "Failed to persist run state: {e}");
        }
    }

    async fn acknowledge(&self, event: &Event) {
        if let Err(e) = self.store.mark_event_dispatched(event.id).await {
            // Harmless: the run is recorded, a redelivery will be skipped or resumed.
            warn!(event_id = %event.id, "Failed to acknowledge event: {e}");
        }
    }

    async fn nack(&self, event: Event, reason: &str) {
        let event_id = event.id;
        if let Err(e) = self.bus.nack(event, reason).await {
            error!(event_id = %event_id, "Failed to record delivery failure: {e}");
        }
    }

    fn claim(&self, run_id: Uuid) -> bool {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.insert(run_id)
    }

    fn release(&self, run_id: Uuid) {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.remove(&run_id);
    }

    /// Trigger a workflow by name, outside of its normal event source.
    pub async fn fire_manual(
        &self,
        workflow: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, EngineError> {
        let registered = self
            .registry
            .get(workflow)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow.to_string()))?;

        let event_id = self.bus.publish(&registered.trigger_event, payload).await?;
        info!(workflow = %workflow, event_id = %event_id, "Workflow fired manually");
        Ok(event_id)
    }

    /// Fire every cron workflow whose next slot has passed.
    pub async fn check_cron_triggers(&self) -> usize {
        self.check_cron_triggers_at(Utc::now()).await
    }

    /// Cron evaluation against an explicit clock. Returns the number of
    /// workflows fired.
    ///
    /// The first check for a workflow only records `now` as its baseline.
    /// Missed slots collapse into a single firing for the latest one, and the
    /// event id is derived from the slot, so two processes checking the same
    /// slot publish one event.
    pub async fn check_cron_triggers_at(&self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;

        for workflow in self.registry.cron_workflows() {
            let Some(schedule) = workflow.cron.as_ref() else {
                continue;
            };

            let last = match self.store.get_cron_slot(&workflow.name).await {
                Ok(last) => last,
                Err(e) => {
                    error!(workflow = %workflow.name, "Failed to read cron state: {e}");
                    continue;
                }
            };

            let Some(last) = last else {
                match self.store.advance_cron_slot(&workflow.name, None, now).await {
                    Ok(true) => {
                        info!(
                            workflow = %workflow.name,
                            schedule = schedule.expression(),
                            next = ?schedule.next_after(now),
                            "Cron schedule armed"
                        );
                    }
                    Ok(false) => {}
                    Err(e) => error!(workflow = %workflow.name, "Failed to arm cron schedule: {e}"),
                }
                continue;
            };

            let Some(slot) = schedule.latest_due(last, now) else {
                continue;
            };

            let event_id = cron_event_id(&workflow.name, slot);
            let payload = serde_json::json!({ "scheduled_for": slot });
            if let Err(e) = self
                .bus
                .publish_with_id(event_id, &workflow.trigger_event, payload)
                .await
            {
                error!(workflow = %workflow.name, slot = %slot, "Failed to publish cron event: {e}");
                continue;
            }

            match self
                .store
                .advance_cron_slot(&workflow.name, Some(last), slot)
                .await
            {
                Ok(true) => {
                    info!(workflow = %workflow.name, slot = %slot, "Cron workflow fired");
                    fired += 1;
                }
                Ok(false) => {
                    debug!(workflow = %workflow.name, slot = %slot, "Cron slot already advanced elsewhere");
                }
                Err(e) => error!(workflow = %workflow.name, "Failed to advance cron slot: {e}"),
            }
        }

        fired
    }

    /// Drop cached step outputs of runs finished more than `keep_days` ago.
    pub async fn sweep_step_cache(&self) -> usize {
        match self
            .store
            .prune_step_results(self.config.step_cache_keep_days)
            .await
        {
            Ok(0) => 0,
            Ok(n) => {
                info!(pruned = n, "Pruned cached step results");
                n
            }
            Err(e) => {
                warn!("Step cache sweep failed: {e}");
                0
            }
        }
    }
}

/// Message recorded on the run (and the Task Record) when a run gives up.
fn terminal_reason(e: &StepError) -> String {
    match e {
        StepError::Transient(reason) => format!("retries exhausted: {reason}"),
        StepError::Permanent(reason) | StepError::Fatal(reason) => reason.clone(),
        other => other.to_string(),
    }
}

/// Spawn a background task that evaluates cron triggers on an interval.
pub fn spawn_cron_ticker(
    engine: Arc<WorkflowEngine>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            engine.check_cron_triggers().await;
        }
    })
}

/// Spawn a background task that prunes the step cache once an hour.
pub fn spawn_step_cache_sweep(engine: Arc<WorkflowEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            engine.sweep_step_cache().await;
        }
    })
}
