use jobq_core::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A child process exited without being asked to
    #[error("Child process fault: {0}")]
    ChildProcessFault(String),

    #[error("No handler for {klass} in queue {queue}")]
    WorkUnresolvable { klass: String, queue: String },

    #[error("Job raised: {0}")]
    WorkRaised(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Worker pool closed")]
    PoolClosed,
}

impl WorkerError {
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, WorkerError::Queue(e) if e.is_lease_lost())
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
