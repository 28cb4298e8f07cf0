//! Memoized steps.
//!
//! A workflow body is a sequence of named steps. Each step's output is saved
//! under `(run_id, step name)` the first time it succeeds; when the run is
//! retried or resumed, completed steps return the saved output instead of
//! executing again. Only the step that failed (and the ones after it) run.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{EventBus, child_event_id};
use crate::error::StepError;
use crate::store::Database;

/// An event a step wants to publish.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

impl OutgoingEvent {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Per-attempt handle given to a workflow body.
pub struct StepContext {
    run_id: Uuid,
    workflow: String,
    attempt: u32,
    store: Arc<dyn Database>,
    bus: EventBus,
    step_timeout: Duration,
    /// Step names already used in this attempt.
    seen: Mutex<HashSet<String>>,
}

impl StepContext {
    pub(crate) fn new(
        run_id: Uuid,
        workflow: &str,
        attempt: u32,
        store: Arc<dyn Database>,
        bus: EventBus,
        step_timeout: Duration,
    ) -> Self {
        Self {
            run_id,
            workflow: workflow.to_string(),
            attempt,
            store,
            bus,
            step_timeout,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// 1-based attempt number of the current execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Run `f` as step `name` under the workflow's default step timeout.
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        self.run_with_timeout(name, self.step_timeout, f).await
    }

    /// Run `f` as step `name`, or return its saved output if an earlier
    /// attempt of this run already completed it.
    pub async fn run_with_timeout<T, F, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        f: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        self.claim(name)?;

        if let Some(saved) = self.store.get_step_result(self.run_id, name).await? {
            debug!(run_id = %self.run_id, step = name, "Step replayed from saved output");
            return serde_json::from_value(saved).map_err(|e| {
                StepError::Fatal(format!("saved output of step {name} does not decode: {e}"))
            });
        }

        let output = match tokio::time::timeout(timeout, f()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StepError::Timeout {
                    step: name.to_string(),
                    timeout,
                });
            }
        };

        let value = serde_json::to_value(&output)?;
        self.store
            .save_step_result(self.run_id, name, &value)
            .await?;
        debug!(run_id = %self.run_id, step = name, attempt = self.attempt, "Step completed");
        Ok(output)
    }

    /// Publish `events` as one memoized step. Each event gets an id derived
    /// from the run, the step name and its position, so a step re-executed
    /// after a partial failure never emits an event twice.
    pub async fn send_events(
        &self,
        name: &str,
        events: Vec<OutgoingEvent>,
    ) -> Result<Vec<Uuid>, StepError> {
        let bus = self.bus.clone();
        let run_id = self.run_id;
        let step = name.to_string();

        self.run(name, || async move {
            let mut ids = Vec::with_capacity(events.len());
            let mut fresh = 0usize;
            for (index, event) in events.into_iter().enumerate() {
                let id = child_event_id(run_id, &step, index);
                if bus.publish_with_id(id, &event.name, event.payload).await? {
                    fresh += 1;
                }
                ids.push(id);
            }
            debug!(run_id = %run_id, step = %step, total = ids.len(), fresh, "Events sent");
            Ok(ids)
        })
        .await
    }

    fn claim(&self, name: &str) -> Result<(), StepError> {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !seen.insert(name.to_string()) {
            return Err(StepError::Fatal(format!(
                "step name {name} used twice in workflow {}",
                self.workflow
            )));
        }
        Ok(())
    }
}
