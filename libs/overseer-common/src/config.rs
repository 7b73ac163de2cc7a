use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Worker configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub task_queue: String,
    pub results_queue: String,
    pub worker_id: String,
    pub poll_timeout_secs: f64,

    /// Host staging volume; exec and output dirs live directly under it
    pub sandbox_root: PathBuf,
    /// Fixed per worker; only one task runs per process at a time
    pub container_name: String,
    pub container_workdir: String,
    pub container_output_dir: String,
    pub container_timeout_secs: u64,
    pub container_memory_mb: u64,
    pub container_cpus: f64,

    pub dev_path_prefix: Option<PathBuf>,

    pub registry_url: Option<String>,
    pub registry_user: Option<String>,
    pub registry_token: Option<String>,

    pub metrics_port: u16,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            task_queue: env::var("TASK_QUEUE")
                .unwrap_or_else(|_| "overseer:queue:tasks".to_string()),
            results_queue: env::var("RESULTS_QUEUE")
                .unwrap_or_else(|_| "overseer:results".to_string()),
            worker_id: env::var("WORKER_ID").unwrap_or_else(|_| "default".to_string()),
            poll_timeout_secs: parsed("POLL_TIMEOUT_SECS", 5.0),
            sandbox_root: env::var("SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/overseer/sandbox")),
            container_name: env::var("CONTAINER_NAME")
                .unwrap_or_else(|_| "overseer-assessment".to_string()),
            container_workdir: env::var("CONTAINER_WORKDIR")
                .unwrap_or_else(|_| "/home/overseer/work".to_string()),
            container_output_dir: env::var("CONTAINER_OUTPUT_DIR")
                .unwrap_or_else(|_| "/home/overseer/output".to_string()),
            container_timeout_secs: parsed("CONTAINER_TIMEOUT_SECS", 300),
            container_memory_mb: parsed("CONTAINER_MEMORY_MB", 512),
            container_cpus: parsed("CONTAINER_CPUS", 1.0),
            dev_path_prefix: optional("DEV_PATH_PREFIX").map(PathBuf::from),
            registry_url: optional("DOCKER_PROXY_URL"),
            registry_user: optional("DOCKER_USER"),
            registry_token: optional("DOCKER_TOKEN"),
            metrics_port: parsed("METRICS_PORT", 9102),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }

    /// Host directory mounted as the container's working directory
    pub fn exec_dir(&self) -> PathBuf {
        self.sandbox_root.join("work")
    }

    /// Host directory mounted as the container's artifact directory
    pub fn out_dir(&self) -> PathBuf {
        self.sandbox_root.join("output")
    }

    pub fn processing_queue(&self) -> String {
        crate::redis::processing_key(&self.task_queue, &self.worker_id)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
