use crate::Job;
use chrono::Utc;
use jobq_core::{JobId, PopRequest, PutRequest, QueueService, Result};
use std::fmt;
use std::sync::Arc;

/// A named queue as seen by one worker
#[derive(Clone)]
pub struct Queue {
    name: String,
    service: Arc<dyn QueueService>,
    worker: String,
}

impl Queue {
    pub fn new(name: impl Into<String>, service: Arc<dyn QueueService>, worker: impl Into<String>) -> Self {
        Queue {
            name: name.into(),
            service,
            worker: worker.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lease the next job, if any
    pub async fn pop(&self) -> Result<Option<Job>> {
        let request = PopRequest {
            queue: self.name.clone(),
            worker: self.worker.clone(),
            now: Utc::now(),
        };

        let record = self.service.pop(request).await?;
        Ok(record.map(|record| Job::new(record, Arc::clone(&self.service), self.worker.clone())))
    }

    pub async fn put(&self, klass: impl Into<String>, data: serde_json::Value) -> Result<JobId> {
        self.service
            .put(PutRequest::new(self.name.clone(), klass, data))
            .await
    }

    /// Put a prepared request into this queue, whatever queue it names
    pub async fn enqueue(&self, mut request: PutRequest) -> Result<JobId> {
        request.queue = self.name.clone();
        self.service.put(request).await
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("worker", &self.worker)
            .finish()
    }
}

/// A queue given either by name or as a ready handle
#[derive(Debug, Clone)]
pub enum QueueSpec {
    Name(String),
    Handle(Queue),
}

impl QueueSpec {
    /// Resolve into a handle bound to `service` and `worker`. Handles are
    /// rebound too, so every queue pops under the same identity.
    pub fn resolve(self, service: &Arc<dyn QueueService>, worker: &str) -> Queue {
        let name = match self {
            QueueSpec::Name(name) => name,
            QueueSpec::Handle(queue) => queue.name,
        };
        Queue::new(name, Arc::clone(service), worker)
    }
}

impl From<&str> for QueueSpec {
    fn from(name: &str) -> Self {
        QueueSpec::Name(name.to_string())
    }
}

impl From<String> for QueueSpec {
    fn from(name: String) -> Self {
        QueueSpec::Name(name)
    }
}

impl From<Queue> for QueueSpec {
    fn from(queue: Queue) -> Self {
        QueueSpec::Handle(queue)
    }
}
