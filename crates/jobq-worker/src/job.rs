use chrono::{DateTime, Utc};
use jobq_core::{
    CompleteRequest, FailRequest, HeartbeatRequest, JobId, JobRecord, JobState, Priority,
    PutRequest, QueueService, Result, TrackRequest, UntrackRequest,
};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A job leased to this worker.
///
/// Wraps the record returned by the queue service together with the narrow
/// set of operations the lease holder may invoke. Local state follows the
/// outcome of each operation, so after `complete`, `fail` or `cancel` the
/// job no longer reports itself as running.
pub struct Job {
    record: JobRecord,
    service: Arc<dyn QueueService>,
    worker: String,
    sandbox: Option<PathBuf>,
    completed: bool,
}

impl Job {
    pub fn new(record: JobRecord, service: Arc<dyn QueueService>, worker: impl Into<String>) -> Self {
        Job {
            record,
            service,
            worker: worker.into(),
            sandbox: None,
            completed: false,
        }
    }

    pub fn jid(&self) -> &str {
        &self.record.jid
    }

    pub fn klass(&self) -> &str {
        &self.record.klass
    }

    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    pub fn priority(&self) -> Priority {
        self.record.priority
    }

    pub fn tags(&self) -> &[String] {
        &self.record.tags
    }

    pub fn state(&self) -> JobState {
        self.record.state
    }

    /// Whether `complete` or `complete_with` succeeded, including a
    /// completion into a next queue
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.record.expires
    }

    /// Time left on the lease
    pub fn ttl(&self) -> Option<chrono::Duration> {
        self.record.ttl(Utc::now())
    }

    pub fn data(&self) -> &Value {
        &self.record.data
    }

    pub fn data_mut(&mut self) -> &mut Value {
        &mut self.record.data
    }

    /// Field of an object payload
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.record.data.get(key)
    }

    /// Set a field, turning a non-object payload into an object
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if !self.record.data.is_object() {
            self.record.data = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.record.data {
            map.insert(key.into(), value.into());
        }
    }

    /// Directory this job runs in, once dispatched to a slot
    pub fn sandbox(&self) -> Option<&Path> {
        self.sandbox.as_deref()
    }

    pub(crate) fn set_sandbox(&mut self, path: PathBuf) {
        self.sandbox = Some(path);
    }

    /// Renew the lease, writing the current data back.
    ///
    /// `LeaseLost` means another worker owns the job now; stop working on it.
    pub async fn heartbeat(&mut self) -> Result<DateTime<Utc>> {
        let request = HeartbeatRequest {
            jid: self.record.jid.clone(),
            worker: self.worker.clone(),
            now: Utc::now(),
            data: Some(self.record.data.clone()),
        };

        match self.service.heartbeat(request).await {
            Ok(expires) => {
                debug!("Heartbeat for job {} extends lease to {}", self.jid(), expires);
                self.record.expires = Some(expires);
                Ok(expires)
            }
            Err(e) => {
                if e.is_lease_lost() {
                    warn!("Lost lease on job {}", self.jid());
                }
                Err(e)
            }
        }
    }

    /// Mark the job done; `false` when the lease was already gone
    pub async fn complete(&mut self) -> Result<bool> {
        self.complete_with(None, None).await
    }

    /// Mark the job done, optionally re-enqueueing it into `next` after
    /// `delay`
    pub async fn complete_with(&mut self, next: Option<&str>, delay: Option<Duration>) -> Result<bool> {
        let request = CompleteRequest {
            jid: self.record.jid.clone(),
            worker: self.worker.clone(),
            queue: self.record.queue.clone(),
            now: Utc::now(),
            data: Some(self.record.data.clone()),
            next: next.map(str::to_string),
            delay,
        };

        let completed = self.service.complete(request).await?;
        if completed {
            self.completed = true;
            match next {
                Some(next) => {
                    self.record.queue = next.to_string();
                    self.record.state = if delay.map_or(false, |d| !d.is_zero()) {
                        JobState::Scheduled
                    } else {
                        JobState::Waiting
                    };
                }
                None => self.record.state = JobState::Complete,
            }
            self.record.worker = None;
            self.record.expires = None;
        } else {
            warn!("Job {} could not be completed, lease lost", self.jid());
        }

        Ok(completed)
    }

    /// Record a permanent failure. Allowed whatever the lease state.
    pub async fn fail(&mut self, group: impl Into<String>, message: impl Into<String>) -> Result<Option<JobId>> {
        let request = FailRequest {
            jid: self.record.jid.clone(),
            worker: self.worker.clone(),
            group: group.into(),
            message: message.into(),
            now: Utc::now(),
            data: Some(self.record.data.clone()),
        };

        let failed = self.service.fail(request).await?;
        if failed.is_some() {
            self.record.state = JobState::Failed;
            self.record.worker = None;
            self.record.expires = None;
        }

        Ok(failed)
    }

    /// Remove the job from the queue service entirely
    pub async fn cancel(&mut self) -> Result<bool> {
        let canceled = self.service.cancel(&self.record.jid).await?;
        if canceled {
            self.record.state = JobState::Canceled;
            self.record.worker = None;
            self.record.expires = None;
        }
        Ok(canceled)
    }

    /// Put the job into another queue; this worker loses the lease
    pub async fn move_to(&mut self, queue: &str) -> Result<JobId> {
        let request = PutRequest::new(queue, self.record.klass.clone(), self.record.data.clone())
            .jid(self.record.jid.clone())
            .priority(self.record.priority)
            .tags(self.record.tags.clone())
            .retries(self.record.retries);

        let jid = self.service.put(request).await?;
        self.record.queue = queue.to_string();
        self.record.state = JobState::Waiting;
        self.record.worker = None;
        self.record.expires = None;

        Ok(jid)
    }

    /// Opt in to tracking notifications, adding `tags`
    pub async fn track<I, S>(&mut self, tags: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = TrackRequest {
            jid: self.record.jid.clone(),
            now: Utc::now(),
            tags: tags.into_iter().map(Into::into).collect(),
        };

        let tracked = self.service.track(request).await?;
        if tracked {
            self.record.tracked = true;
        }
        Ok(tracked)
    }

    pub async fn untrack(&mut self) -> Result<bool> {
        let request = UntrackRequest {
            jid: self.record.jid.clone(),
            now: Utc::now(),
        };

        let untracked = self.service.untrack(request).await?;
        if untracked {
            self.record.tracked = false;
        }
        Ok(untracked)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("jid", &self.record.jid)
            .field("klass", &self.record.klass)
            .field("queue", &self.record.queue)
            .field("state", &self.record.state)
            .field("worker", &self.worker)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}
