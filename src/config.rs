//! Environment-driven configuration.
//!
//! Every setting has a default. Values that fail to parse fall back to the
//! default with a warning instead of aborting start-up.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Log output format for the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Unknown values fall back to text.
    fn from_value(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_lowercase()).as_deref() {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                warn!(value = other, "Unknown LOG_FORMAT, using text");
                LogFormat::Text
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Maximum request body in bytes.
    pub max_content_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub name: String,
    pub concurrency: usize,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub max_tasks_per_child: u32,
    pub revoke_poll: Duration,
    pub heartbeat: Duration,
}

impl WorkerConfig {
    /// Snapshots outlive a few missed heartbeats before they expire.
    pub fn snapshot_ttl(&self) -> Duration {
        self.heartbeat.saturating_mul(3)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            concurrency: 4,
            soft_time_limit: Duration::from_secs(240),
            hard_time_limit: Duration::from_secs(300),
            max_tasks_per_child: 50,
            revoke_poll: Duration::from_millis(500),
            heartbeat: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Housekeeping is disabled when unset.
    pub dir: Option<PathBuf>,
    pub max_age_hours: u64,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api: ApiConfig,
    pub broker_url: String,
    pub result_ttl: Duration,
    pub worker: WorkerConfig,
    pub cleanup: CleanupConfig,
    pub log_format: LogFormat,
}

impl Config {
    /// Sets up logging from `LOG_FORMAT` first, then reads the rest of the
    /// environment so that fallback warnings reach the subscriber.
    pub fn load<I>(init_logging: I) -> Self
    where
        I: FnOnce(LogFormat),
    {
        Self::load_from(|key| std::env::var(key).ok(), init_logging)
    }

    pub fn load_from<F, I>(lookup: F, init_logging: I) -> Self
    where
        F: Fn(&str) -> Option<String>,
        I: FnOnce(LogFormat),
    {
        init_logging(LogFormat::from_value(lookup("LOG_FORMAT").as_deref()));
        Self::from_lookup(lookup)
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| keys.iter().find_map(|k| lookup(k).filter(|v| !v.trim().is_empty()));
        let parse = |keys: &[&str], default: u64| parse_or(keys[0], get(keys), default);

        let defaults = WorkerConfig::default();
        let mut worker = WorkerConfig {
            name: get(&["WORKER_NAME"]).unwrap_or(defaults.name),
            concurrency: parse(&["WORKER_CONCURRENCY"], 4) as usize,
            soft_time_limit: Duration::from_secs(parse(&["TASK_SOFT_TIME_LIMIT_SECS"], 240)),
            hard_time_limit: Duration::from_secs(parse(&["TASK_TIME_LIMIT_SECS"], 300)),
            max_tasks_per_child: parse(&["WORKER_MAX_TASKS_PER_CHILD"], 50) as u32,
            revoke_poll: Duration::from_millis(parse(&["REVOKE_POLL_MS"], 500)),
            heartbeat: Duration::from_secs(parse(&["HEARTBEAT_SECS"], 10)),
        };

        if worker.concurrency == 0 {
            warn!("WORKER_CONCURRENCY must be at least 1, using 1");
            worker.concurrency = 1;
        }
        if worker.max_tasks_per_child == 0 {
            warn!("WORKER_MAX_TASKS_PER_CHILD must be at least 1, using 1");
            worker.max_tasks_per_child = 1;
        }
        if worker.heartbeat.is_zero() {
            worker.heartbeat = defaults.heartbeat;
        }
        if worker.revoke_poll.is_zero() {
            worker.revoke_poll = defaults.revoke_poll;
        }
        if worker.soft_time_limit >= worker.hard_time_limit {
            warn!(
                soft_secs = worker.soft_time_limit.as_secs(),
                hard_secs = worker.hard_time_limit.as_secs(),
                "Soft time limit is not below the hard limit, it will never fire first"
            );
        }

        let port = parse_or("PORT", get(&["PORT", "PYTHON_SERVICE_PORT"]), 5000u16);
        let max_content_length = parse_or(
            "MAX_CONTENT_LENGTH",
            get(&["MAX_CONTENT_LENGTH"]),
            100 * 1024 * 1024usize,
        );

        let log_format = LogFormat::from_value(get(&["LOG_FORMAT"]).as_deref());

        Config {
            api: ApiConfig {
                bind_addr: get(&["BIND_ADDR"]).unwrap_or_else(|| "0.0.0.0".to_string()),
                port,
                max_content_length,
            },
            broker_url: get(&["BROKER_URL", "REDIS_URL"])
                .unwrap_or_else(|| "redis://127.0.0.1:6379/0".to_string()),
            result_ttl: Duration::from_secs(parse(&["RESULT_TTL_SECS"], 86_400)),
            worker,
            cleanup: CleanupConfig {
                dir: get(&["CLEANUP_DIR"]).map(PathBuf::from),
                max_age_hours: parse(&["CLEANUP_MAX_AGE_HOURS"], 24),
                interval: Duration::from_secs(parse(&["CLEANUP_INTERVAL_SECS"], 3600).max(1)),
            },
            log_format,
        }
    }

    /// `memory://` selects the in-process broker.
    pub fn uses_memory_broker(&self) -> bool {
        self.broker_url.starts_with("memory://")
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match value {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "Invalid value, using default");
                default
            }
        },
    }
}

fn default_worker_name() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("worker@{}-{}", host, std::process::id())
}
