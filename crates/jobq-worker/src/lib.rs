//! Worker-side execution engine for a leased job queue.
//!
//! A worker leases jobs from a [`QueueService`](jobq_core::QueueService),
//! runs them through registered [`JobHandler`]s inside per-slot sandboxes and
//! relinquishes every lease by completing or failing the job. Two pool
//! disciplines are available: [`TaskPoolWorker`] runs jobs as tokio tasks,
//! [`ProcessPoolWorker`] runs them in child processes.

pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod job;
pub mod listener;
pub mod metrics;
pub mod process;
pub mod queue;
pub mod sandbox;
pub mod signals;
pub mod source;
pub mod supervisor;
pub mod task;

pub use config::{WorkerConfig, WorkerMode};
pub use error::{Result, WorkerError};
pub use handler::{HandlerRegistry, JobHandler};
pub use job::Job;
pub use listener::EventListener;
pub use metrics::{Outcome, WorkerMetrics};
pub use process::{ChildLauncher, CommandLauncher, ProcessPoolWorker};
pub use queue::{Queue, QueueSpec};
pub use sandbox::{Sandbox, SandboxPool};
pub use source::JobSource;
pub use supervisor::{Resume, Supervisor, Worker};
pub use task::TaskPoolWorker;
