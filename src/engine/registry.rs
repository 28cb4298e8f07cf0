//! Workflow registration.
//!
//! Registration is validated up front: a bad cron expression, a zero
//! concurrency limit or two workflows claiming the same event are rejected
//! when the registry is built, not when the first event arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::bus::Event;
use crate::config::EngineConfig;
use crate::engine::cron::CronSchedule;
use crate::engine::retry::RetryPolicy;
use crate::engine::step::StepContext;
use crate::error::{EngineError, StepError};

/// A workflow body. Side effects belong inside `step.run(...)` so that they
/// are not repeated when the run is retried.
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn run(&self, event: &Event, step: &StepContext)
    -> Result<serde_json::Value, StepError>;
}

/// Declaration of a workflow and its triggers, passed to
/// [`RegistryBuilder::register`].
pub struct WorkflowDef {
    name: String,
    event: Option<String>,
    cron: Option<String>,
    concurrency: usize,
    retry: Option<RetryPolicy>,
    step_timeout: Option<Duration>,
    handler: Arc<dyn Workflow>,
}

impl WorkflowDef {
    pub fn new(name: impl Into<String>, handler: Arc<dyn Workflow>) -> Self {
        Self {
            name: name.into(),
            event: None,
            cron: None,
            concurrency: 1,
            retry: None,
            step_timeout: None,
            handler,
        }
    }

    /// Trigger on every event with this name.
    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Trigger on a cron schedule (UTC).
    pub fn on_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron = Some(expression.into());
        self
    }

    /// Maximum simultaneous runs. Defaults to 1.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}

/// A validated workflow, ready to dispatch.
pub struct RegisteredWorkflow {
    pub name: String,
    /// Event name that starts a run. Cron-only workflows get `cron/<name>`.
    pub trigger_event: String,
    pub cron: Option<CronSchedule>,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub step_timeout: Duration,
    pub handler: Arc<dyn Workflow>,
    pub(crate) permits: Arc<Semaphore>,
}

impl RegisteredWorkflow {
    /// Runs currently holding a concurrency slot.
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }
}

impl std::fmt::Debug for RegisteredWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredWorkflow")
            .field("name", &self.name)
            .field("trigger_event", &self.trigger_event)
            .field("cron", &self.cron.as_ref().map(|c| c.expression()))
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Collects workflow definitions and validates them into a [`Registry`].
pub struct RegistryBuilder {
    defs: Vec<WorkflowDef>,
    default_retry: RetryPolicy,
    default_step_timeout: Duration,
}

impl RegistryBuilder {
    pub fn new(default_retry: RetryPolicy, default_step_timeout: Duration) -> Self {
        Self {
            defs: Vec::new(),
            default_retry,
            default_step_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.retry.clone(), config.step_timeout)
    }

    pub fn register(mut self, def: WorkflowDef) -> Self {
        self.defs.push(def);
        self
    }

    pub fn build(self) -> Result<Arc<Registry>, EngineError> {
        let mut workflows = Vec::with_capacity(self.defs.len());
        let mut by_name = HashMap::new();
        let mut by_event: HashMap<String, usize> = HashMap::new();

        for def in self.defs {
            if by_name.contains_key(&def.name) {
                return Err(EngineError::DuplicateWorkflow(def.name));
            }
            if def.event.is_none() && def.cron.is_none() {
                return Err(EngineError::NoTrigger(def.name));
            }
            if def.concurrency == 0 {
                return Err(EngineError::InvalidConcurrency {
                    workflow: def.name,
                    limit: def.concurrency,
                });
            }
            let cron = def.cron.as_deref().map(CronSchedule::parse).transpose()?;

            let trigger_event = def
                .event
                .clone()
                .unwrap_or_else(|| format!("cron/{}", def.name));
            if let Some(&existing) = by_event.get(&trigger_event) {
                let existing: &RegisteredWorkflow = &workflows[existing];
                return Err(EngineError::DuplicateSubscription {
                    event: trigger_event,
                    existing: existing.name.clone(),
                });
            }

            let index = workflows.len();
            by_name.insert(def.name.clone(), index);
            by_event.insert(trigger_event.clone(), index);

            tracing::info!(
                workflow = %def.name,
                event = %trigger_event,
                cron = ?def.cron,
                concurrency = def.concurrency,
                "Registered workflow"
            );

            workflows.push(RegisteredWorkflow {
                name: def.name,
                trigger_event,
                cron,
                concurrency: def.concurrency,
                retry: def.retry.unwrap_or_else(|| self.default_retry.clone()),
                step_timeout: def.step_timeout.unwrap_or(self.default_step_timeout),
                handler: def.handler,
                permits: Arc::new(Semaphore::new(def.concurrency)),
            });
        }

        Ok(Arc::new(Registry {
            workflows: workflows.into_iter().map(Arc::new).collect(),
            by_name,
            by_event,
        }))
    }
}

/// Immutable set of registered workflows.
#[derive(Debug)]
pub struct Registry {
    workflows: Vec<Arc<RegisteredWorkflow>>,
    by_name: HashMap<String, usize>,
    by_event: HashMap<String, usize>,
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredWorkflow>> {
        self.by_name.get(name).map(|&i| &self.workflows[i])
    }

    /// The workflow subscribed to `event`, if any.
    pub fn for_event(&self, event: &str) -> Option<&Arc<RegisteredWorkflow>> {
        self.by_event.get(event).map(|&i| &self.workflows[i])
    }

    pub fn workflows(&self) -> impl Iterator<Item = &Arc<RegisteredWorkflow>> {
        self.workflows.iter()
    }

    pub fn cron_workflows(&self) -> impl Iterator<Item = &Arc<RegisteredWorkflow>> {
        self.workflows.iter().filter(|w| w.cron.is_some())
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}
