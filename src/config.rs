//! Configuration types.
//!
//! Everything is read from the environment once at startup. Unset variables
//! fall back to defaults; set-but-malformed variables are rejected so a typo in
//! a deployment never silently runs with a default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::engine::retry::RetryPolicy;
use crate::error::ConfigError;

/// Top-level configuration for the pipeline binary.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path of the libSQL database file.
    pub database_path: PathBuf,
    /// HTTP/WebSocket port for the status surface.
    pub http_port: u16,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    pub engine: EngineConfig,
    pub workflows: WorkflowSettings,
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
}

/// Workflow engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the cron ticker checks schedules.
    pub cron_tick: Duration,
    /// Default per-step timeout.
    pub step_timeout: Duration,
    /// Default retry policy for workflows that don't override it.
    pub retry: RetryPolicy,
    /// Bus redelivery attempts before an event is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Base delay between bus redeliveries.
    pub redelivery_backoff: Duration,
    /// Cached step results of finished runs are pruned after this many days.
    pub step_cache_keep_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cron_tick: Duration::from_secs(30),
            step_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            max_delivery_attempts: 5,
            redelivery_backoff: Duration::from_secs(2),
            step_cache_keep_days: 14,
        }
    }
}

/// Per-workflow settings fixed at deployment.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub parse_workout_concurrency: usize,
    pub analyze_photo_concurrency: usize,
    pub insight_concurrency: usize,
    /// Cron expression for the weekly report fan-out.
    pub weekly_report_schedule: String,
    /// Cron expression for the inactivity reminder scan.
    pub inactivity_schedule: String,
    /// Users without a workout for this many days get a reminder.
    pub inactivity_days: u32,
    /// Users enumerated per fan-out step.
    pub fanout_page_size: usize,
    /// Days of activity an insight report looks back over.
    pub report_lookback_days: u32,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            parse_workout_concurrency: 4,
            analyze_photo_concurrency: 2,
            insight_concurrency: 3,
            weekly_report_schedule: "0 8 * * MON".to_string(),
            inactivity_schedule: "0 18 * * *".to_string(),
            inactivity_days: 7,
            fanout_page_size: 500,
            report_lookback_days: 7,
        }
    }
}

/// Inference provider configuration.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// API key; the offline heuristic parser is used when absent.
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            timeout: Duration::from_secs(60),
            max_tokens: 2048,
        }
    }
}

/// Where progress photos are fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// Local directory; references are relative paths beneath it.
    Filesystem { root: PathBuf },
    /// References are absolute `http(s)://` URLs.
    Http { timeout: Duration },
}

impl PipelineConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = std::env::var("FIT_PIPELINE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/fit-pipeline.db"));
        let http_port = env_or("FIT_PIPELINE_HTTP_PORT", 8080u16)?;
        let log_dir = std::env::var("FIT_PIPELINE_LOG_DIR").ok().map(PathBuf::from);

        let defaults = EngineConfig::default();
        let retry = RetryPolicy {
            max_attempts: env_or("FIT_PIPELINE_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            initial_backoff: Duration::from_millis(env_or(
                "FIT_PIPELINE_RETRY_BACKOFF_MS",
                defaults.retry.initial_backoff.as_millis() as u64,
            )?),
            ..defaults.retry.clone()
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FIT_PIPELINE_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let engine = EngineConfig {
            cron_tick: Duration::from_secs(env_or(
                "FIT_PIPELINE_CRON_TICK_SECS",
                defaults.cron_tick.as_secs(),
            )?),
            step_timeout: Duration::from_secs(env_or(
                "FIT_PIPELINE_STEP_TIMEOUT_SECS",
                defaults.step_timeout.as_secs(),
            )?),
            retry,
            max_delivery_attempts: env_or(
                "FIT_PIPELINE_MAX_DELIVERY_ATTEMPTS",
                defaults.max_delivery_attempts,
            )?,
            redelivery_backoff: defaults.redelivery_backoff,
            step_cache_keep_days: env_or(
                "FIT_PIPELINE_STEP_CACHE_KEEP_DAYS",
                defaults.step_cache_keep_days,
            )?,
        };

        let wf = WorkflowSettings::default();
        let workflows = WorkflowSettings {
            parse_workout_concurrency: env_or(
                "FIT_PIPELINE_PARSE_CONCURRENCY",
                wf.parse_workout_concurrency,
            )?,
            analyze_photo_concurrency: env_or(
                "FIT_PIPELINE_PHOTO_CONCURRENCY",
                wf.analyze_photo_concurrency,
            )?,
            insight_concurrency: env_or("FIT_PIPELINE_INSIGHT_CONCURRENCY", wf.insight_concurrency)?,
            weekly_report_schedule: std::env::var("FIT_PIPELINE_WEEKLY_REPORT_CRON")
                .unwrap_or(wf.weekly_report_schedule),
            inactivity_schedule: std::env::var("FIT_PIPELINE_INACTIVITY_CRON")
                .unwrap_or(wf.inactivity_schedule),
            inactivity_days: env_or("FIT_PIPELINE_INACTIVITY_DAYS", wf.inactivity_days)?,
            fanout_page_size: env_or("FIT_PIPELINE_FANOUT_PAGE_SIZE", wf.fanout_page_size)?,
            report_lookback_days: env_or(
                "FIT_PIPELINE_REPORT_LOOKBACK_DAYS",
                wf.report_lookback_days,
            )?,
        };

        let inf = InferenceConfig::default();
        let inference = InferenceConfig {
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            model: std::env::var("FIT_PIPELINE_MODEL").unwrap_or(inf.model),
            timeout: Duration::from_secs(env_or(
                "FIT_PIPELINE_INFERENCE_TIMEOUT_SECS",
                inf.timeout.as_secs(),
            )?),
            max_tokens: env_or("FIT_PIPELINE_INFERENCE_MAX_TOKENS", inf.max_tokens)?,
        };

        let storage = match std::env::var("FIT_PIPELINE_STORAGE")
            .unwrap_or_else(|_| "fs".to_string())
            .as_str()
        {
            "fs" => StorageConfig::Filesystem {
                root: std::env::var("FIT_PIPELINE_STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data/blobs")),
            },
            "http" => StorageConfig::Http {
                timeout: Duration::from_secs(env_or("FIT_PIPELINE_STORAGE_TIMEOUT_SECS", 30u64)?),
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "FIT_PIPELINE_STORAGE".to_string(),
                    message: format!("expected 'fs' or 'http', got '{other}'"),
                });
            }
        };

        Ok(Self {
            database_path,
            http_port,
            log_dir,
            engine,
            workflows,
            inference,
            storage,
        })
    }
}

/// Read `key` and parse it, or return `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        Err(_) => Ok(default),
    }
}
