use std::sync::Arc;

use anyhow::Context;
use fit_pipeline::bus::{EventBus, RedeliveryPolicy};
use fit_pipeline::config::PipelineConfig;
use fit_pipeline::engine::{self, RegistryBuilder, WorkflowEngine};
use fit_pipeline::inference::create_inference;
use fit_pipeline::storage::create_storage;
use fit_pipeline::store::{Database, LibSqlBackend};
use fit_pipeline::tasks::routes::task_routes;
use fit_pipeline::tasks::{TaskNotifier, TaskService, TaskStore};
use fit_pipeline::workflows::{WorkflowDeps, register_workflows};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("invalid configuration")?;

    // Initialize tracing. The guard must outlive the runtime so buffered
    // file logs get flushed.
    let _log_guard = init_tracing(&config);

    eprintln!("🏋️ Fit Pipeline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api/tasks", config.http_port);
    eprintln!("   Task WS: ws://0.0.0.0:{}/ws/tasks/{{owner_id}}", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| format!("opening database at {}", config.database_path.display()))?,
    );

    // ── Event bus + task surface ─────────────────────────────────────────
    let (bus, rx) = EventBus::new(
        Arc::clone(&db),
        RedeliveryPolicy {
            max_attempts: config.engine.max_delivery_attempts,
            backoff: config.engine.redelivery_backoff,
        },
    );
    let notifier = TaskNotifier::default();
    let tasks = TaskStore::new(Arc::clone(&db), notifier);
    let service = TaskService::new(tasks.clone(), bus.clone());

    // ── Collaborators ────────────────────────────────────────────────────
    let inference = create_inference(&config.inference).context("configuring inference")?;
    let storage = create_storage(&config.storage).context("configuring blob storage")?;
    eprintln!("   Inference: {}", inference.name());

    // ── Workflow engine ──────────────────────────────────────────────────
    let deps = WorkflowDeps {
        tasks: tasks.clone(),
        store: Arc::clone(&db),
        inference,
        storage,
    };
    let registry = register_workflows(
        RegistryBuilder::from_config(&config.engine),
        &deps,
        &config.workflows,
    )
    .build()
    .context("registering workflows")?;
    for wf in registry.workflows() {
        tracing::info!(
            workflow = %wf.name,
            trigger = %wf.trigger_event,
            concurrency = wf.concurrency,
            "Workflow registered"
        );
    }

    let engine = Arc::new(WorkflowEngine::new(
        registry,
        Arc::clone(&db),
        bus.clone(),
        tasks,
        config.engine.clone(),
    ));
    let _dispatch_handle = engine.start(rx);

    // ── Startup recovery: requeue events whose runs never finished ───────
    match bus.recover().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {n} undelivered events"),
        Err(e) => tracing::error!("Event recovery failed: {e}"),
    }

    let _cron_handle = engine::spawn_cron_ticker(Arc::clone(&engine), config.engine.cron_tick);
    let _sweep_handle = engine::spawn_step_cache_sweep(Arc::clone(&engine));

    // ── HTTP / WS server ─────────────────────────────────────────────────
    let app = task_routes(service, Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("binding port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Task server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("\nShutting down...");
        })
        .await
        .context("server error")?;

    Ok(())
}

fn init_tracing(config: &PipelineConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fit-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
