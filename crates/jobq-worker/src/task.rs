use crate::executor;
use crate::handler::HandlerRegistry;
use crate::listener::{EventListener, StopHandle};
use crate::metrics::{Outcome, WorkerMetrics};
use crate::sandbox::{Sandbox, SandboxPool};
use crate::supervisor::{Supervisor, Worker};
use crate::{Job, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use jobq_core::{EventKind, JobId, JobRecord, QueueService};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

struct Slot {
    seq: u64,
    abort: AbortHandle,
    record: JobRecord,
    sandbox: PathBuf,
}

type Running = Arc<DashMap<JobId, Slot>>;

/// Runs jobs as tokio tasks inside this process, one sandbox per slot.
///
/// An event listener runs next to the dispatch loop and aborts the task of
/// any job this worker loses: canceled, lease expired or put elsewhere.
pub struct TaskPoolWorker {
    supervisor: Supervisor,
    registry: Arc<HandlerRegistry>,
    sandboxes: SandboxPool,
    running: Running,
    next_seq: AtomicU64,
    metrics: Arc<WorkerMetrics>,
}

impl TaskPoolWorker {
    /// `tasks` slots with sandboxes `<sandbox_root>/greenlet-<i>`
    pub fn new(
        supervisor: Supervisor,
        registry: Arc<HandlerRegistry>,
        tasks: usize,
        sandbox_root: impl AsRef<Path>,
    ) -> Result<Self> {
        let sandboxes = SandboxPool::new(sandbox_root, "greenlet", tasks.max(1));
        Self::with_sandboxes(supervisor, registry, sandboxes)
    }

    pub fn with_sandboxes(
        supervisor: Supervisor,
        registry: Arc<HandlerRegistry>,
        sandboxes: SandboxPool,
    ) -> Result<Self> {
        Ok(TaskPoolWorker {
            supervisor,
            registry,
            sandboxes,
            running: Arc::new(DashMap::new()),
            next_seq: AtomicU64::new(0),
            metrics: Arc::new(WorkerMetrics::new()?),
        })
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn sandboxes(&self) -> &SandboxPool {
        &self.sandboxes
    }

    /// Ids of the jobs executing right now
    pub fn in_flight(&self) -> Vec<JobId> {
        let mut jids: Vec<JobId> = self.running.iter().map(|e| e.key().clone()).collect();
        jids.sort();
        jids
    }

    /// Dispatch jobs from `jobs` until it ends or the worker is stopped,
    /// then wait for everything in flight.
    ///
    /// A `None` item is a round without work and makes the loop sleep for
    /// the polling interval.
    pub async fn run_with<S>(&self, mut jobs: S) -> Result<()>
    where
        S: Stream<Item = Option<Job>> + Unpin + Send,
    {
        let shutdown = self.supervisor.shutdown_token();
        let listener = self.start_listener().await;
        let mut tasks = JoinSet::new();

        info!(
            "Worker {} running {} tasks on {:?}",
            self.supervisor.worker_name(),
            self.sandboxes.capacity(),
            self.supervisor.queue_names()
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                reap(joined);
            }

            let sandbox = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                sandbox = self.sandboxes.acquire() => match sandbox {
                    Ok(sandbox) => sandbox,
                    Err(e) => {
                        error!("No sandbox available: {}", e);
                        break;
                    }
                },
            };

            // Not raced against shutdown: a popped job must not be dropped
            match jobs.next().await {
                None => break,
                Some(None) => {
                    drop(sandbox);
                    debug!("Sleeping for {:?}", self.supervisor.polling_interval());
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.supervisor.polling_interval()) => {}
                    }
                }
                Some(Some(job)) => self.dispatch(&mut tasks, job, sandbox).await,
            }
        }

        if !tasks.is_empty() {
            info!("Waiting for {} jobs to finish", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }

        if let Some((stop, handle)) = listener {
            stop.stop();
            if let Err(e) = handle.await {
                warn!("Event listener ended abnormally: {}", e);
            }
        }

        info!("Worker {} stopped", self.supervisor.worker_name());
        Ok(())
    }

    async fn start_listener(&self) -> Option<(StopHandle, JoinHandle<()>)> {
        let service = self.supervisor.service();
        let listener = match EventListener::subscribe(service.as_ref(), self.supervisor.worker_name()).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Running without lease-loss notifications: {}", e);
                return None;
            }
        };

        let stop = listener.stop_handle();
        let running = Arc::clone(&self.running);
        let service = Arc::clone(service);
        let worker = self.supervisor.worker_name().to_string();
        let handle = tokio::spawn(async move {
            let mut events = Box::pin(listener.listen());
            while let Some(event) = events.next().await {
                if event.kind == EventKind::LockLost
                    && leased_to(service.as_ref(), &worker, &event.jid).await
                {
                    // Reclaimed by this worker; dispatch replaces the stale run
                    debug!("Job {} lease moved back to {}", event.jid, worker);
                } else if event.revokes_ownership() {
                    info!("Job {} {}", event.jid, event.kind.as_str());
                    kill_slot(&running, &event.jid);
                } else {
                    debug!("Ignoring {} for job {}", event.kind.as_str(), event.jid);
                }
            }
        });

        Some((stop, handle))
    }

    async fn dispatch(&self, tasks: &mut JoinSet<()>, mut job: Job, sandbox: Sandbox) {
        // Resolved here rather than inside the spawned task
        let handler = match self.registry.resolve(job.klass(), job.queue()) {
            Ok(handler) => handler,
            Err(e) => {
                let outcome = executor::fail_unresolvable(&mut job, &e).await;
                self.metrics.record(outcome);
                return;
            }
        };

        if let Err(e) = sandbox.prepare() {
            warn!("Failed to prepare sandbox {}: {}", sandbox.path().display(), e);
        }
        job.set_sandbox(sandbox.path().to_path_buf());

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let jid = job.jid().to_string();
        let record = job.record().clone();
        let path = sandbox.path().to_path_buf();

        let mut guard = SlotGuard {
            running: Arc::clone(&self.running),
            jid: jid.clone(),
            seq,
            metrics: Arc::clone(&self.metrics),
            outcome: None,
        };
        self.metrics.jobs_in_flight.inc();

        let (start, started) = oneshot::channel::<()>();
        let abort = tasks.spawn(async move {
            let _sandbox = sandbox;
            if started.await.is_err() {
                return;
            }
            guard.outcome = Some(executor::execute(&mut job, handler).await);
        });

        // Popped again after its lease ran out: the earlier run is stale
        if self.running.contains_key(&jid) {
            warn!("Job {} was handed back to this worker, replacing its stale run", jid);
            kill_slot(&self.running, &jid);
        }
        self.running.insert(
            jid,
            Slot {
                seq,
                abort,
                record,
                sandbox: path,
            },
        );
        let _ = start.send(());
    }
}

/// Untracks a slot when its task ends, however it ends
struct SlotGuard {
    running: Running,
    jid: JobId,
    seq: u64,
    metrics: Arc<WorkerMetrics>,
    outcome: Option<Outcome>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.running.remove_if(&self.jid, |_, slot| slot.seq == self.seq);
        self.metrics.jobs_in_flight.dec();
        self.metrics.record(self.outcome.unwrap_or(Outcome::Killed));
    }
}

fn kill_slot(running: &DashMap<JobId, Slot>, jid: &str) {
    match running.remove(jid) {
        Some((_, slot)) => {
            info!("Killing job {}", jid);
            slot.abort.abort();
        }
        None => debug!("Job {} is not running here", jid),
    }
}

async fn leased_to(service: &dyn QueueService, worker: &str, jid: &str) -> bool {
    match service.get_job(jid).await {
        Ok(Some(record)) => record.is_leased_by(worker),
        Ok(None) => false,
        Err(e) => {
            warn!("Could not look up job {}: {}", jid, e);
            false
        }
    }
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Job task panicked: {}", e);
        }
    }
}

#[async_trait]
impl Worker for TaskPoolWorker {
    fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    async fn run(&self) -> Result<()> {
        let jobs = self.supervisor.jobs().await;
        self.run_with(jobs.into_stream()).await
    }

    fn kill(&self, jid: &str) {
        kill_slot(&self.running, jid);
    }

    fn introspect(&self, verbose: bool) -> String {
        let mut report = String::new();
        let _ = writeln!(
            report,
            "Worker {} on {:?}",
            self.supervisor.worker_name(),
            self.supervisor.queue_names()
        );
        let _ = writeln!(report, "In flight: {:?}", self.in_flight());
        let _ = writeln!(
            report,
            "Sandboxes free: {}/{}",
            self.sandboxes.available(),
            self.sandboxes.capacity()
        );

        if verbose {
            for entry in self.running.iter() {
                let record = serde_json::to_string_pretty(&entry.record)
                    .unwrap_or_else(|e| format!("<unserializable: {}>", e));
                let _ = writeln!(
                    report,
                    "Job {} in {}:\n{}",
                    entry.key(),
                    entry.sandbox.display(),
                    record
                );
            }
        }

        report.push_str(&self.metrics.render());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{EchoHandler, SleepHandler};
    use futures::stream;
    use jobq_broker::MemoryQueueService;
    use jobq_core::{JobState, PutRequest, QueueService};
    use serde_json::json;
    use std::time::Duration;

    fn worker(store: &Arc<MemoryQueueService>, root: &Path, tasks: usize) -> TaskPoolWorker {
        let registry = HandlerRegistry::builder()
            .register("echo", EchoHandler)
            .register("sleep", SleepHandler::new(10))
            .build();
        let supervisor = Supervisor::new(store.clone(), "w1", ["q"]).interval(Duration::from_millis(10));
        TaskPoolWorker::new(supervisor, Arc::new(registry), tasks, root).unwrap()
    }

    #[tokio::test]
    async fn test_runs_capped_source() {
        let store = Arc::new(MemoryQueueService::default());
        let root = tempfile::tempdir().unwrap();
        for _ in 0..3 {
            store.put(PutRequest::new("q", "echo", json!({}))).await.unwrap();
        }

        let worker = worker(&store, root.path(), 2);
        let jobs = worker.supervisor().jobs().await.into_stream().filter(|j| {
            let some = j.is_some();
            async move { some }
        });
        worker.run_with(Box::pin(jobs).take(3)).await.unwrap();

        assert_eq!(worker.metrics().count(Outcome::Completed), 3);
        assert!(worker.in_flight().is_empty());
        assert_eq!(worker.sandboxes().available(), 2);
        assert_eq!(worker.metrics().jobs_in_flight.get(), 0);
    }

    #[tokio::test]
    async fn test_kill_untracked_is_noop() {
        let store = Arc::new(MemoryQueueService::default());
        let root = tempfile::tempdir().unwrap();
        let worker = worker(&store, root.path(), 1);

        worker.kill("nobody");
        worker.kill("nobody");
        assert!(worker.in_flight().is_empty());
        assert_eq!(worker.metrics().count(Outcome::Killed), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_fails_without_slot() {
        let store = Arc::new(MemoryQueueService::default());
        let root = tempfile::tempdir().unwrap();
        let jid = store
            .put(PutRequest::new("q", "does.not.Exist", json!({})))
            .await
            .unwrap();

        let worker = worker(&store, root.path(), 1);
        let jobs = worker.supervisor().jobs().await.into_stream().take(1);
        worker.run_with(jobs).await.unwrap();

        let record = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.failure.unwrap().group, "q-method-missing");
        assert_eq!(worker.metrics().count(Outcome::Failed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_round_sleeps_interval() {
        let store = Arc::new(MemoryQueueService::default());
        let root = tempfile::tempdir().unwrap();
        let worker = worker(&store, root.path(), 1);

        let started = tokio::time::Instant::now();
        worker.run_with(stream::iter(vec![None::<Job>, None])).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_introspect_lists_running_jobs() {
        let store = Arc::new(MemoryQueueService::default());
        let root = tempfile::tempdir().unwrap();
        store
            .put(PutRequest::new("q", "sleep", json!({"sleep_ms": 60_000})).jid("slow"))
            .await
            .unwrap();

        let worker = Arc::new(worker(&store, root.path(), 1));
        let runner = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                let jobs = worker.supervisor().jobs().await.into_stream().take(1);
                worker.run_with(jobs).await
            })
        };

        while worker.in_flight().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let report = worker.introspect(true);
        assert!(report.contains("In flight: [\"slow\"]"));
        assert!(report.contains("greenlet-0"));
        assert!(report.contains("\"sleep_ms\": 60000"));

        worker.kill("slow");
        runner.await.unwrap().unwrap();
        assert_eq!(worker.metrics().count(Outcome::Killed), 1);
        assert_eq!(worker.sandboxes().available(), 1);
    }
}
