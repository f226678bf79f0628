use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use jobq_broker::{MemoryQueueService, QueueServer, StoreConfig};
use jobq_client::RemoteQueueService;
use jobq_core::{JobState, PopRequest, PutRequest, QueueService};
use jobq_worker::handler::EchoHandler;
use jobq_worker::{
    HandlerRegistry, Job, JobHandler, Outcome, Resume, Supervisor, TaskPoolWorker, Worker,
};
use parking_lot::Mutex;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Records the order jobs start in
#[derive(Clone, Default)]
struct Recording(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl JobHandler for Recording {
    async fn process(&self, job: &mut Job) -> anyhow::Result<()> {
        self.0.lock().push(job.jid().to_string());
        Ok(())
    }
}

/// Tracks how many jobs run at once
#[derive(Clone, Default)]
struct Concurrency {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for Concurrency {
    async fn process(&self, _job: &mut Job) -> anyhow::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sleeps far longer than any test runs
struct Forever;

#[async_trait]
impl JobHandler for Forever {
    async fn process(&self, _job: &mut Job) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Sleeps forever, counting the bodies still running
#[derive(Clone, Default)]
struct Alive {
    started: Arc<AtomicUsize>,
    alive: Arc<AtomicUsize>,
}

struct AliveGuard(Arc<AtomicUsize>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobHandler for Alive {
    async fn process(&self, _job: &mut Job) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.alive.fetch_add(1, Ordering::SeqCst);
        let _guard = AliveGuard(Arc::clone(&self.alive));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Re-enqueues the job into q2 on completion
struct Forward;

#[async_trait]
impl JobHandler for Forward {
    async fn process(&self, job: &mut Job) -> anyhow::Result<()> {
        job.complete_with(Some("q2"), None).await?;
        Ok(())
    }
}

fn task_pool(
    service: Arc<dyn QueueService>,
    registry: HandlerRegistry,
    tasks: usize,
    root: &Path,
) -> Arc<TaskPoolWorker> {
    let supervisor = Supervisor::new(service, "w1", ["q"]).interval(Duration::from_millis(10));
    Arc::new(TaskPoolWorker::new(supervisor, Arc::new(registry), tasks, root).unwrap())
}

/// Only the jobs of a source, capped at `n`
fn jobs(
    source: impl Stream<Item = Option<Job>> + Send + 'static,
    n: usize,
) -> impl Stream<Item = Option<Job>> + Unpin + Send {
    Box::pin(source.filter(|job| futures::future::ready(job.is_some())).take(n))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_three_jobs_complete_in_arrival_order() {
    let store = Arc::new(MemoryQueueService::default());
    let root = tempfile::tempdir().unwrap();
    for jid in ["first", "second", "third"] {
        store
            .put(PutRequest::new("q", "record", json!({})).jid(jid))
            .await
            .unwrap();
    }

    let recording = Recording::default();
    let registry = HandlerRegistry::builder()
        .register("record", recording.clone())
        .build();
    let worker = task_pool(store.clone(), registry, 1, root.path());

    let source = worker.supervisor().jobs().await.into_stream();
    worker.run_with(jobs(source, 3)).await.unwrap();

    assert_eq!(*recording.0.lock(), vec!["first", "second", "third"]);
    for jid in ["first", "second", "third"] {
        let record = store.get_job(jid).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Complete);
    }
    assert_eq!(worker.metrics().count(Outcome::Completed), 3);
}

#[tokio::test]
async fn test_complete_into_next_queue() {
    let store = Arc::new(MemoryQueueService::default());
    let root = tempfile::tempdir().unwrap();
    let jid = store
        .put(PutRequest::new("q", "forward", json!({"step": 1})))
        .await
        .unwrap();

    let registry = HandlerRegistry::builder().register("forward", Forward).build();
    let worker = task_pool(store.clone(), registry, 1, root.path());
    let source = worker.supervisor().jobs().await.into_stream();
    worker.run_with(jobs(source, 1)).await.unwrap();

    let next = store
        .pop(PopRequest {
            queue: "q2".to_string(),
            worker: "w2".to_string(),
            now: Utc::now(),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.jid, jid);
    assert_eq!(next.queue, "q2");
    assert_eq!(next.data, json!({"step": 1}));
}

#[tokio::test]
async fn test_complete_after_fail_is_refused() {
    let store: Arc<dyn QueueService> = Arc::new(MemoryQueueService::default());
    let queue = jobq_worker::Queue::new("q", store.clone(), "w1");
    queue.put("k", json!({})).await.unwrap();

    let mut job = queue.pop().await.unwrap().unwrap();
    assert!(job.fail("q-broken", "bad input").await.unwrap().is_some());
    assert_eq!(job.state(), JobState::Failed);

    assert!(!job.complete().await.unwrap());
    let record = store.get_job(job.jid()).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Failed);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let store = Arc::new(MemoryQueueService::default());
    let root = tempfile::tempdir().unwrap();
    for _ in 0..9 {
        store
            .put(PutRequest::new("q", "busy", json!({})))
            .await
            .unwrap();
    }

    let concurrency = Concurrency::default();
    let registry = HandlerRegistry::builder()
        .register("busy", concurrency.clone())
        .build();
    let worker = task_pool(store.clone(), registry, 3, root.path());
    let source = worker.supervisor().jobs().await.into_stream();
    worker.run_with(jobs(source, 9)).await.unwrap();

    let max = concurrency.max.load(Ordering::SeqCst);
    assert!(max >= 1 && max <= 3, "max concurrency {}", max);
    assert_eq!(worker.metrics().count(Outcome::Completed), 9);
    assert_eq!(worker.sandboxes().available(), 3);
}

#[tokio::test]
async fn test_resumed_jobs_run_before_fresh_ones() {
    let store = Arc::new(MemoryQueueService::default());
    let root = tempfile::tempdir().unwrap();
    store
        .put(PutRequest::new("q", "record", json!({})).jid("old"))
        .await
        .unwrap();
    store
        .pop(PopRequest {
            queue: "q".to_string(),
            worker: "w1".to_string(),
            now: Utc::now(),
        })
        .await
        .unwrap();
    store
        .put(PutRequest::new("q", "record", json!({})).jid("new"))
        .await
        .unwrap();

    let recording = Recording::default();
    let registry = HandlerRegistry::builder()
        .register("record", recording.clone())
        .build();
    let supervisor = Supervisor::new(store.clone(), "w1", ["q"])
        .interval(Duration::from_millis(10))
        .resume(Resume::Discover);
    let worker = TaskPoolWorker::new(supervisor, Arc::new(registry), 1, root.path()).unwrap();

    let source = worker.supervisor().jobs().await.into_stream();
    worker.run_with(jobs(source, 2)).await.unwrap();

    assert_eq!(*recording.0.lock(), vec!["old", "new"]);
}

#[tokio::test]
async fn test_cancel_preempts_running_job() {
    let store = Arc::new(MemoryQueueService::default());
    let root = tempfile::tempdir().unwrap();
    store
        .put(PutRequest::new("q", "forever", json!({})).jid("slow"))
        .await
        .unwrap();

    let registry = HandlerRegistry::builder().register("forever", Forever).build();
    let worker = task_pool(store.clone(), registry, 2, root.path());
    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            let source = worker.supervisor().jobs().await.into_stream();
            worker.run_with(jobs(source, 1)).await
        })
    };

    wait_until(|| worker.in_flight() == vec!["slow".to_string()]).await;
    assert!(store.cancel("slow").await.unwrap());

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(worker.in_flight().is_empty());
    assert_eq!(worker.sandboxes().available(), 2);
    assert_eq!(worker.metrics().count(Outcome::Killed), 1);
    assert_eq!(store.subscribers("ql:w:w1"), 0);
}

#[tokio::test]
async fn test_reclaimed_job_replaces_stale_run() {
    let store = Arc::new(MemoryQueueService::new(StoreConfig {
        heartbeat: Duration::from_millis(50),
        default_retries: 1000,
    }));
    let root = tempfile::tempdir().unwrap();
    store
        .put(PutRequest::new("q", "alive", json!({})).jid("j"))
        .await
        .unwrap();

    let alive = Alive::default();
    let registry = HandlerRegistry::builder().register("alive", alive.clone()).build();
    let worker = task_pool(store.clone(), registry, 2, root.path());
    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    // Every expiry hands the job back to w1, which must not pile up runs
    wait_until(|| alive.started.load(Ordering::SeqCst) >= 3).await;
    wait_until(|| {
        alive.alive.load(Ordering::SeqCst) == 1 && worker.in_flight() == vec!["j".to_string()]
    })
    .await;

    worker.stop();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !runner.is_finished() {
            worker.kill("j");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    runner.await.unwrap().unwrap();

    assert_eq!(alive.alive.load(Ordering::SeqCst), 0);
    assert!(worker.in_flight().is_empty());
    assert_eq!(worker.sandboxes().available(), 2);
}

#[tokio::test]
async fn test_put_elsewhere_preempts_running_job() {
    let store = Arc::new(MemoryQueueService::default());
    let root = tempfile::tempdir().unwrap();
    store
        .put(PutRequest::new("q", "forever", json!({})).jid("moved"))
        .await
        .unwrap();

    let registry = HandlerRegistry::builder().register("forever", Forever).build();
    let worker = task_pool(store.clone(), registry, 1, root.path());
    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            let source = worker.supervisor().jobs().await.into_stream();
            worker.run_with(jobs(source, 1)).await
        })
    };

    wait_until(|| !worker.in_flight().is_empty()).await;
    store
        .put(PutRequest::new("other", "forever", json!({})).jid("moved"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(worker.metrics().count(Outcome::Killed), 1);

    let record = store.get_job("moved").await.unwrap().unwrap();
    assert_eq!(record.queue, "other");
    assert_eq!(record.state, JobState::Waiting);
}

#[tokio::test]
async fn test_stop_drains_in_flight_jobs() {
    let store = Arc::new(MemoryQueueService::default());
    let root = tempfile::tempdir().unwrap();
    store
        .put(PutRequest::new("q", "sleep", json!({"sleep_ms": 50})).jid("nap"))
        .await
        .unwrap();

    let registry = HandlerRegistry::builder()
        .register("sleep", jobq_worker::handler::SleepHandler::new(50))
        .build();
    let worker = task_pool(store.clone(), registry, 1, root.path());
    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    wait_until(|| !worker.in_flight().is_empty()).await;
    worker.stop();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Finished rather than killed
    let record = store.get_job("nap").await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Complete);
    assert_eq!(record.data["slept_ms"], json!(50));
    assert_eq!(worker.metrics().count(Outcome::Killed), 0);
}

#[tokio::test]
async fn test_remote_worker_round_trip() {
    let store = Arc::new(MemoryQueueService::default());
    let server = Arc::new(QueueServer::new(store.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let shutdown = server.shutdown_token();
    tokio::spawn(Arc::clone(&server).run(listener));

    for jid in ["r1", "r2"] {
        store
            .put(PutRequest::new("q", "echo", json!({})).jid(jid))
            .await
            .unwrap();
    }
    store
        .put(PutRequest::new("q", "forever", json!({})).jid("r3"))
        .await
        .unwrap();

    let root = tempfile::tempdir().unwrap();
    let registry = HandlerRegistry::builder()
        .register("echo", EchoHandler)
        .register("forever", Forever)
        .build();
    let remote: Arc<dyn QueueService> = Arc::new(RemoteQueueService::new(address));
    let worker = task_pool(remote, registry, 2, root.path());
    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            let source = worker.supervisor().jobs().await.into_stream();
            worker.run_with(jobs(source, 3)).await
        })
    };

    // Notifications travel over the wire too
    wait_until(|| worker.in_flight() == vec!["r3".to_string()]).await;
    store.cancel("r3").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    for jid in ["r1", "r2"] {
        let record = store.get_job(jid).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Complete);
    }
    assert!(store.get_job("r3").await.unwrap().is_none());
    assert_eq!(worker.metrics().count(Outcome::Completed), 2);
    assert_eq!(worker.metrics().count(Outcome::Killed), 1);

    shutdown.cancel();
}
