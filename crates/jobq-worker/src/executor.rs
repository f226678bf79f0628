//! Execution boundary for a single job.
//!
//! Whatever the handler does, the job leaves here relinquished or lost:
//! success completes it, an error or a panic fails it with a descriptive
//! group, and a lost lease is only logged since the job belongs to someone
//! else by then.

use crate::handler::JobHandler;
use crate::metrics::Outcome;
use crate::{Job, WorkerError};
use futures::FutureExt;
use jobq_core::{JobState, QueueError};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Run `handler` on `job` and relinquish the lease according to the result
pub async fn execute(job: &mut Job, handler: Arc<dyn JobHandler>) -> Outcome {
    info!("Executing job {} ({}) from {}", job.jid(), job.klass(), job.queue());

    let result = AssertUnwindSafe(handler.process(job)).catch_unwind().await;

    match result {
        Ok(Ok(())) => finish(job).await,
        Ok(Err(e)) if is_lease_lost(&e) => {
            warn!("Job {} stopped, lease lost: {}", job.jid(), e);
            Outcome::Lost
        }
        Ok(Err(e)) => {
            let raised = WorkerError::WorkRaised(format!("{:?}", e));
            error!("Job {}: {}", job.jid(), raised);
            let group = format!("{}-failure", job.queue());
            fail(job, group, format!("{:?}", e)).await
        }
        Err(panic) => {
            let message = format!("panicked: {}", panic_message(panic.as_ref()));
            error!("Job {} {}", job.jid(), message);
            let group = format!("{}-failure", job.queue());
            fail(job, group, message).await
        }
    }
}

/// Fail a job whose work descriptor has no handler
pub async fn fail_unresolvable(job: &mut Job, error: &WorkerError) -> Outcome {
    error!("Job {}: {}", job.jid(), error);
    let group = format!("{}-method-missing", job.queue());
    fail(job, group, error.to_string()).await
}

async fn finish(job: &mut Job) -> Outcome {
    if job.is_completed() {
        return Outcome::Completed;
    }
    // The handler relinquished the job itself
    match job.state() {
        JobState::Running => {}
        JobState::Failed => return Outcome::Failed,
        _ => return Outcome::Lost,
    }

    match job.complete().await {
        Ok(true) => {
            info!("Completed job {}", job.jid());
            Outcome::Completed
        }
        Ok(false) => Outcome::Lost,
        Err(e) if e.is_lease_lost() => Outcome::Lost,
        Err(e) => {
            // The lease will run out and the job will be handed out again
            error!("Failed to complete job {}: {}", job.jid(), e);
            Outcome::Lost
        }
    }
}

async fn fail(job: &mut Job, group: String, message: String) -> Outcome {
    match job.fail(group.as_str(), message).await {
        Ok(Some(_)) => info!("Failed job {} in group {}", job.jid(), group),
        Ok(None) => warn!("Job {} vanished before it could be failed", job.jid()),
        Err(e) => error!("Failed to fail job {}: {}", job.jid(), e),
    }
    Outcome::Failed
}

fn is_lease_lost(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| match cause.downcast_ref::<QueueError>() {
            Some(e) => e.is_lease_lost(),
            None => cause
                .downcast_ref::<WorkerError>()
                .map_or(false, WorkerError::is_lease_lost),
        })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
