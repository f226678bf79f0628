//! Worker configuration

use crate::Result;
use clap::ValueEnum;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Execution discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Cooperative tasks inside this process
    #[default]
    Task,
    /// One child process per slot
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue service address
    pub queue_address: String,
    /// Worker identity; `<hostname>-<pid>` when unset
    pub worker_name: Option<String>,
    /// Queues to pop from, polled round-robin in this order
    pub queues: Vec<String>,
    pub mode: WorkerMode,
    /// Sleep between polls once every queue came back empty
    pub interval_secs: u64,
    /// Pick up jobs still leased to this worker name at startup
    pub resume: bool,
    /// Concurrent tasks in task mode
    pub tasks: usize,
    /// Child processes in process mode; CPU count when unset
    pub workers: Option<usize>,
    pub sandbox_root: PathBuf,
    pub graceful_shutdown_timeout_secs: u64,
    pub log_json: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            queue_address: "127.0.0.1:6380".to_string(),
            worker_name: None,
            queues: Vec::new(),
            mode: WorkerMode::Task,
            interval_secs: 60,
            resume: false,
            tasks: 10,
            workers: None,
            sandbox_root: PathBuf::from("./jobq-workers"),
            graceful_shutdown_timeout_secs: 60,
            log_json: false,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from an optional file and `JOBQ_` environment
    /// variables, e.g. `JOBQ_QUEUES=emails,reports`
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("JOBQ")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("queues")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn worker_name(&self) -> String {
        if let Some(name) = &self.worker_name {
            return name.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        format!("{}-{}", hostname, std::process::id())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }

    /// Child process count for process mode
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
