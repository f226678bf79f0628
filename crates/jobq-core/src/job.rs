use crate::{Priority, DEFAULT_RETRIES};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a job
pub type JobId = String;

/// Generate a fresh job id (32 lowercase hex digits)
pub fn new_jid() -> JobId {
    Uuid::new_v4().simple().to_string()
}

/// Job state as tracked by the queue service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible to be popped
    Waiting,
    /// Put with a delay that has not elapsed yet
    Scheduled,
    /// Leased to a worker
    Running,
    /// Lease expired without a heartbeat; reclaimable by the next pop
    Stalled,
    Complete,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Stalled => "stalled",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    /// States from which the job will never run again without being re-put
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::Canceled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a job's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// put, popped, done, failed, timed-out or canceled
    pub what: String,
    pub when: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

/// Permanent failure classification recorded by `fail`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub group: String,
    pub message: String,
    pub when: DateTime<Utc>,
    pub worker: Option<String>,
}

/// Authoritative job record as returned by the queue service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub jid: JobId,

    /// Work descriptor used to resolve a handler (e.g. "reports.Daily")
    pub klass: String,

    /// User data, mutable by handlers and written back on heartbeat/complete/fail
    pub data: serde_json::Value,

    pub queue: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub state: JobState,

    /// Worker currently holding the lease
    pub worker: Option<String>,

    /// Lease expiry; only meaningful while running
    pub expires: Option<DateTime<Utc>>,

    /// Configured retries
    pub retries: u32,

    /// Retries left before a stalled job is failed
    pub remaining: i32,

    pub tracked: bool,
    pub failure: Option<Failure>,
    pub history: Vec<HistoryEntry>,
}

impl JobRecord {
    /// A waiting job with default priority and retries
    pub fn new(
        jid: impl Into<JobId>,
        klass: impl Into<String>,
        queue: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        JobRecord {
            jid: jid.into(),
            klass: klass.into(),
            data,
            queue: queue.into(),
            priority: Priority::default(),
            tags: Vec::new(),
            state: JobState::Waiting,
            worker: None,
            expires: None,
            retries: DEFAULT_RETRIES,
            remaining: DEFAULT_RETRIES as i32,
            tracked: false,
            failure: None,
            history: Vec::new(),
        }
    }

    /// Whether `worker` currently holds a lease on this job
    pub fn is_leased_by(&self, worker: &str) -> bool {
        self.state == JobState::Running && self.worker.as_deref() == Some(worker)
    }

    /// Check if the lease has expired
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires {
            Some(expires) => expires <= now,
            None => false,
        }
    }

    /// Time left on the lease (negative once expired)
    pub fn ttl(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires.map(|expires| expires - now)
    }

    /// Append a history entry
    pub fn record(
        &mut self,
        what: &str,
        when: DateTime<Utc>,
        queue: Option<&str>,
        worker: Option<&str>,
    ) {
        self.history.push(HistoryEntry {
            what: what.to_string(),
            when,
            queue: queue.map(str::to_string),
            worker: worker.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_creation() {
        let job = JobRecord::new("jid-1", "reports.Daily", "q", json!({"k": 1}));

        assert_eq!(job.klass, "reports.Daily");
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.remaining, DEFAULT_RETRIES as i32);
        assert!(job.worker.is_none());
        assert!(!job.is_leased_by("w1"));
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let mut job = JobRecord::new("jid-1", "k", "q", json!({}));
        assert!(!job.is_lease_expired(now));

        job.state = JobState::Running;
        job.worker = Some("w1".to_string());
        job.expires = Some(now + chrono::Duration::seconds(30));

        assert!(job.is_leased_by("w1"));
        assert!(!job.is_leased_by("w2"));
        assert!(!job.is_lease_expired(now));
        assert!(job.is_lease_expired(now + chrono::Duration::seconds(31)));
        assert_eq!(job.ttl(now), Some(chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_state_names() {
        let json = serde_json::to_string(&JobState::Stalled).unwrap();
        assert_eq!(json, "\"stalled\"");
        assert_eq!(JobState::Complete.to_string(), "complete");
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_jid_format() {
        let jid = new_jid();
        assert_eq!(jid.len(), 32);
        assert!(jid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(jid, new_jid());
    }
}
