//! Shared in-process pipeline for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use fit_pipeline::bus::{EventBus, RedeliveryPolicy};
use fit_pipeline::config::{EngineConfig, WorkflowSettings};
use fit_pipeline::engine::{RegistryBuilder, RetryPolicy, WorkflowEngine};
use fit_pipeline::inference::{HeuristicInference, Inference};
use fit_pipeline::storage::FsBlobStorage;
use fit_pipeline::store::{Database, LibSqlBackend};
use fit_pipeline::tasks::{TaskNotifier, TaskRecord, TaskService, TaskStore};
use fit_pipeline::workflows::{WorkflowDeps, register_workflows};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Pipeline {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<dyn Database>,
    pub tasks: TaskStore,
    pub service: TaskService,
    pub blobs: tempfile::TempDir,
}

pub async fn pipeline() -> Pipeline {
    pipeline_with(Arc::new(HeuristicInference::new()), WorkflowSettings::default()).await
}

pub async fn pipeline_with(inference: Arc<dyn Inference>, settings: WorkflowSettings) -> Pipeline {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let (bus, rx) = EventBus::new(Arc::clone(&store), RedeliveryPolicy::default());
    let tasks = TaskStore::new(Arc::clone(&store), TaskNotifier::new(1024));
    let blobs = tempfile::tempdir().unwrap();

    let deps = WorkflowDeps {
        tasks: tasks.clone(),
        store: Arc::clone(&store),
        inference,
        storage: Arc::new(FsBlobStorage::new(blobs.path())),
    };
    let config = EngineConfig {
        retry: RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
            .with_jitter(Duration::ZERO),
        ..EngineConfig::default()
    };
    let registry = register_workflows(RegistryBuilder::from_config(&config), &deps, &settings)
        .build()
        .unwrap();
    let engine = Arc::new(WorkflowEngine::new(
        registry,
        Arc::clone(&store),
        bus.clone(),
        tasks.clone(),
        config,
    ));
    engine.start(rx);

    Pipeline {
        engine,
        store,
        service: TaskService::new(tasks.clone(), bus),
        tasks,
        blobs,
    }
}

/// Poll until the task reaches a terminal status.
pub async fn wait_for_terminal(tasks: &TaskStore, id: Uuid) -> TaskRecord {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let record = tasks.get(id).await.unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not finish in time")
}

/// Poll `check` until it returns true.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
