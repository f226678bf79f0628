use crate::JobId;
use thiserror::Error;

/// Errors surfaced by a queue service or by the notification channel.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Another worker owns the job now, or it was canceled or failed.
    /// Expected during normal operation; the holder must stop working on it.
    #[error("Lease lost on job {0}")]
    LeaseLost(JobId),

    #[error("Queue service unavailable: {0}")]
    Transient(String),

    #[error("Malformed notification: {0}")]
    MalformedNotification(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, QueueError::LeaseLost(_))
    }

    /// Network-level failures that are worth retrying on the next poll
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_) | QueueError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(QueueError::LeaseLost("abc".into()).is_lease_lost());
        assert!(!QueueError::LeaseLost("abc".into()).is_transient());
        assert!(QueueError::Transient("connection reset".into()).is_transient());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(QueueError::from(io).is_transient());
        assert!(!QueueError::Rejected("bad queue".into()).is_transient());
    }
}
