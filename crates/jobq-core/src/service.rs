//! The queue service seam.
//!
//! Everything a worker needs from the remote store goes through
//! [`QueueService`]: leasing (`pop`), renewing (`heartbeat`), relinquishing
//! (`complete`, `fail`), and the per-worker notification channel
//! (`subscribe`). Every call is keyed by job id and, where it matters, by the
//! calling worker's identity, so retries are safe.

use crate::{new_jid, JobId, JobRecord, Priority, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Create a job in a queue, or move an existing job there
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutRequest {
    pub queue: String,
    pub jid: JobId,
    pub klass: String,
    pub data: serde_json::Value,
    pub now: DateTime<Utc>,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    /// Job becomes poppable only after this delay
    pub delay: Option<Duration>,
    pub retries: Option<u32>,
}

impl PutRequest {
    /// New request with a generated jid
    pub fn new(
        queue: impl Into<String>,
        klass: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        PutRequest {
            queue: queue.into(),
            jid: new_jid(),
            klass: klass.into(),
            data,
            now: Utc::now(),
            priority: None,
            tags: Vec::new(),
            delay: None,
            retries: None,
        }
    }

    pub fn jid(mut self, jid: impl Into<JobId>) -> Self {
        self.jid = jid.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopRequest {
    pub queue: String,
    pub worker: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub jid: JobId,
    pub worker: String,
    pub now: DateTime<Utc>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub jid: JobId,
    pub worker: String,
    pub queue: String,
    pub now: DateTime<Utc>,
    pub data: Option<serde_json::Value>,
    /// Re-enqueue into this queue instead of finishing
    pub next: Option<String>,
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailRequest {
    pub jid: JobId,
    pub worker: String,
    /// Failure classification, used to group similar failures
    pub group: String,
    pub message: String,
    pub now: DateTime<Utc>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRequest {
    pub jid: JobId,
    pub now: DateTime<Utc>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UntrackRequest {
    pub jid: JobId,
    pub now: DateTime<Utc>,
}

/// Operations a worker invokes on the queue store.
///
/// Implementations must be atomic per call. Lease violations are reported as
/// [`QueueError::LeaseLost`](crate::QueueError::LeaseLost) from `heartbeat`
/// and as `false` from `complete`.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create or move a job; returns its id
    async fn put(&self, request: PutRequest) -> Result<JobId>;

    /// Lease the next job of a queue to the requesting worker
    async fn pop(&self, request: PopRequest) -> Result<Option<JobRecord>>;

    async fn get_job(&self, jid: &str) -> Result<Option<JobRecord>>;

    /// Renew a lease, returning the new expiry
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<DateTime<Utc>>;

    /// Finish a job, optionally moving it to another queue; `false` if the
    /// caller no longer holds the lease
    async fn complete(&self, request: CompleteRequest) -> Result<bool>;

    /// Record a permanent failure; `None` if the job does not exist
    async fn fail(&self, request: FailRequest) -> Result<Option<JobId>>;

    /// Remove a job entirely
    async fn cancel(&self, jid: &str) -> Result<bool>;

    async fn track(&self, request: TrackRequest) -> Result<bool>;

    async fn untrack(&self, request: UntrackRequest) -> Result<bool>;

    /// Ids of the jobs currently leased to `worker`
    async fn worker_jobs(&self, worker: &str) -> Result<Vec<JobId>>;

    /// Subscribe to a notification channel
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Receiving end of a channel subscription.
///
/// Unsubscribing only signals the producer; messages it already delivered
/// stay in the buffer and are still returned by [`recv`](Self::recv), which
/// yields `None` once the producer has let go.
pub struct Subscription {
    channel: String,
    messages: mpsc::UnboundedReceiver<String>,
    unsubscribe: CancellationToken,
}

impl Subscription {
    /// `unsubscribe` is cancelled to ask the producer to stop; the producer
    /// drops its sender once it has.
    pub fn new(
        channel: impl Into<String>,
        messages: mpsc::UnboundedReceiver<String>,
        unsubscribe: CancellationToken,
    ) -> Self {
        Subscription {
            channel: channel.into(),
            messages,
            unsubscribe,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next raw message, or `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<String> {
        self.messages.recv().await
    }

    pub fn unsubscribe(&self) {
        self.unsubscribe.cancel();
    }

    /// Token that unsubscribes when cancelled, for use from another task
    pub fn unsubscribe_token(&self) -> CancellationToken {
        self.unsubscribe.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("unsubscribed", &self.unsubscribe.is_cancelled())
            .finish()
    }
}
