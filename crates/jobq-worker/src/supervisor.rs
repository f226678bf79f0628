use crate::{Job, JobSource, Queue, QueueSpec, Result};
use async_trait::async_trait;
use jobq_core::{JobId, QueueService};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which previously leased jobs to pick up at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Resume {
    #[default]
    None,
    /// Ask the queue service what this worker still holds
    Discover,
    /// Exactly these jobs
    Jobs(Vec<JobId>),
}

/// State shared by both pool disciplines: identity, queues, polling
/// interval, resumption and the stop signal
pub struct Supervisor {
    service: Arc<dyn QueueService>,
    worker_name: String,
    queues: Vec<Queue>,
    interval: Duration,
    resume: Mutex<Option<Resume>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new<I, Q>(service: Arc<dyn QueueService>, worker_name: impl Into<String>, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<QueueSpec>,
    {
        let worker_name = worker_name.into();
        let queues = queues
            .into_iter()
            .map(|spec| spec.into().resolve(&service, &worker_name))
            .collect();

        Supervisor {
            service,
            worker_name,
            queues,
            interval: Duration::from_secs(60),
            resume: Mutex::new(Some(Resume::None)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Sleep after a round in which no queue had work
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn resume(self, resume: Resume) -> Self {
        *self.resume.lock() = Some(resume);
        self
    }

    pub fn service(&self) -> &Arc<dyn QueueService> {
        &self.service
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name().to_string()).collect()
    }

    pub fn polling_interval(&self) -> Duration {
        self.interval
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Finish current work and stop taking new jobs
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Worker {} stopping", self.worker_name);
        }
        self.shutdown.cancel();
    }

    /// Jobs to resume under the configured mode, in the services's order,
    /// restricted to the queues this worker serves
    pub async fn resumable(&self) -> Result<Vec<Job>> {
        let mode = self.resume.lock().clone().unwrap_or_default();
        self.load(mode).await
    }

    /// The resumable jobs, handed out once; later calls get nothing
    pub async fn take_resume(&self) -> Result<Vec<Job>> {
        let mode = self.resume.lock().take().unwrap_or_default();
        self.load(mode).await
    }

    /// A job source replaying the resumable jobs before polling
    pub async fn jobs(&self) -> JobSource {
        let resume = match self.take_resume().await {
            Ok(resume) => resume,
            Err(e) => {
                warn!("Could not load resumable jobs: {}", e);
                Vec::new()
            }
        };
        JobSource::new(self.queues.clone(), resume)
    }

    async fn load(&self, mode: Resume) -> Result<Vec<Job>> {
        let jids = match mode {
            Resume::None => return Ok(Vec::new()),
            Resume::Discover => self.service.worker_jobs(&self.worker_name).await?,
            Resume::Jobs(jids) => jids,
        };

        let names = self.queue_names();
        let mut jobs = Vec::with_capacity(jids.len());
        for jid in jids {
            match self.service.get_job(&jid).await? {
                Some(record) if names.contains(&record.queue) => {
                    jobs.push(Job::new(record, Arc::clone(&self.service), self.worker_name.clone()));
                }
                Some(record) => info!("Not resuming job {} from unserved queue {}", jid, record.queue),
                None => warn!("Resumable job {} no longer exists", jid),
            }
        }

        if !jobs.is_empty() {
            info!("Found {} resumable jobs", jobs.len());
        }
        Ok(jobs)
    }
}

/// An execution discipline driven by a [`Supervisor`]
#[async_trait]
pub trait Worker: Send + Sync {
    fn supervisor(&self) -> &Supervisor;

    /// Work until stopped or until the job source runs dry
    async fn run(&self) -> Result<()>;

    /// Stop working on `jid`; a no-op when the job is not running here
    fn kill(&self, jid: &str);

    fn stop(&self) {
        self.supervisor().stop();
    }

    /// Human-readable state snapshot; `verbose` adds every in-flight job
    /// record
    fn introspect(&self, verbose: bool) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobq_broker::MemoryQueueService;
    use jobq_core::{PopRequest, PutRequest};
    use serde_json::json;

    async fn hold(service: &Arc<dyn QueueService>, queue: &str, worker: &str) -> JobId {
        let jid = service
            .put(PutRequest::new(queue, "k", json!({})))
            .await
            .unwrap();
        service
            .pop(PopRequest {
                queue: queue.to_string(),
                worker: worker.to_string(),
                now: Utc::now(),
            })
            .await
            .unwrap()
            .unwrap();
        jid
    }

    #[tokio::test]
    async fn test_discover_filters_to_served_queues() {
        let service: Arc<dyn QueueService> = Arc::new(MemoryQueueService::default());
        let mine = hold(&service, "q", "w1").await;
        hold(&service, "other", "w1").await;
        hold(&service, "q", "w2").await;

        let supervisor = Supervisor::new(service, "w1", ["q"]).resume(Resume::Discover);

        let resumable = supervisor.resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].jid(), mine);

        // Handed out once
        assert_eq!(supervisor.take_resume().await.unwrap().len(), 1);
        assert!(supervisor.take_resume().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_jobs_skip_missing() {
        let service: Arc<dyn QueueService> = Arc::new(MemoryQueueService::default());
        let held = hold(&service, "q", "w1").await;

        let supervisor = Supervisor::new(service, "w1", vec!["q".to_string()])
            .resume(Resume::Jobs(vec!["gone".to_string(), held.clone()]));

        let jobs = supervisor.take_resume().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].jid(), held);
    }

    #[tokio::test]
    async fn test_no_resume_by_default() {
        let service: Arc<dyn QueueService> = Arc::new(MemoryQueueService::default());
        hold(&service, "q", "w1").await;

        let supervisor = Supervisor::new(service, "w1", ["q"]).interval(Duration::from_secs(5));
        assert!(supervisor.resumable().await.unwrap().is_empty());
        assert_eq!(supervisor.polling_interval(), Duration::from_secs(5));
        assert_eq!(supervisor.queue_names(), vec!["q"]);

        assert!(!supervisor.is_stopping());
        supervisor.stop();
        supervisor.stop();
        assert!(supervisor.is_stopping());
    }
}
