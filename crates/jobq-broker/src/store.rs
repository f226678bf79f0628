//! In-memory queue store.
//!
//! Holds every job record, the pending queues, and the notification
//! channels behind one lock, so each operation is atomic. All time
//! arithmetic uses the `now` carried by the request.

use crate::queue::PendingQueue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobq_core::{
    worker_channel, CompleteRequest, Event, EventKind, FailRequest, Failure, HeartbeatRequest,
    JobId, JobRecord, JobState, PopRequest, PutRequest, QueueError, QueueService, Result,
    Subscription, TrackRequest, UntrackRequest, DEFAULT_RETRIES, TRACK_CHANNEL,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Lease length granted by pop and heartbeat
    pub heartbeat: Duration,
    pub default_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            heartbeat: Duration::from_secs(60),
            default_retries: DEFAULT_RETRIES,
        }
    }
}

struct StoredJob {
    record: JobRecord,
    /// Sequence number of the job's live queue entry
    seq: u64,
}

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<String>,
}

/// Events to publish once a mutation is done
type Outbox = Vec<(String, Event)>;

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, StoredJob>,
    queues: HashMap<String, PendingQueue>,
    channels: HashMap<String, Vec<Subscriber>>,
    next_seq: u64,
    next_subscriber: u64,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

impl StoreState {
    /// Put the job into its queue as waiting, or scheduled when delayed
    fn enqueue(&mut self, jid: &str, now: DateTime<Utc>, delay: Option<Duration>) {
        self.next_seq += 1;
        let seq = self.next_seq;

        let Some(stored) = self.jobs.get_mut(jid) else {
            return;
        };
        stored.seq = seq;

        let record = &mut stored.record;
        record.worker = None;
        record.expires = None;

        let queue = self.queues.entry(record.queue.clone()).or_default();
        match delay.filter(|delay| !delay.is_zero()) {
            Some(delay) => {
                record.state = JobState::Scheduled;
                queue.schedule(record.jid.clone(), record.priority, seq, now + to_chrono(delay));
            }
            None => {
                record.state = JobState::Waiting;
                queue.push(record.jid.clone(), record.priority, seq);
            }
        }

        let queue_name = record.queue.clone();
        record.record("put", now, Some(&queue_name), None);
    }

    /// Running job of `queue` whose lease expired first
    fn oldest_expired(&self, queue: &str, now: DateTime<Utc>) -> Option<JobId> {
        self.jobs
            .values()
            .map(|stored| &stored.record)
            .filter(|record| {
                record.queue == queue
                    && record.state == JobState::Running
                    && record.is_lease_expired(now)
            })
            .min_by_key(|record| record.expires)
            .map(|record| record.jid.clone())
    }

    /// Next live waiting job of `queue`, promoting delayed jobs first
    fn pop_waiting(&mut self, queue: &str, now: DateTime<Utc>) -> Option<JobId> {
        let pending = self.queues.get_mut(queue)?;

        for (jid, seq) in pending.promote(now) {
            if let Some(stored) = self.jobs.get_mut(&jid) {
                if stored.seq == seq && stored.record.state == JobState::Scheduled {
                    stored.record.state = JobState::Waiting;
                }
            }
        }

        while let Some((jid, seq)) = pending.pop() {
            match self.jobs.get(&jid) {
                Some(stored) if stored.seq == seq && stored.record.state == JobState::Waiting => {
                    return Some(jid);
                }
                _ => debug!("Skipping stale queue entry for job {}", jid),
            }
        }

        None
    }

    fn publish(&mut self, outbox: Outbox) {
        for (channel, event) in outbox {
            if let Some(subscribers) = self.channels.get_mut(&channel) {
                let payload = event.to_json();
                subscribers.retain(|subscriber| subscriber.sender.send(payload.clone()).is_ok());
            }
        }
    }
}

fn lease(record: &mut JobRecord, worker: &str, now: DateTime<Utc>, heartbeat: Duration) {
    record.state = JobState::Running;
    record.worker = Some(worker.to_string());
    record.expires = Some(now + to_chrono(heartbeat));
    let queue = record.queue.clone();
    record.record("popped", now, Some(&queue), Some(worker));
}

/// Queue service kept entirely in process memory
#[derive(Clone)]
pub struct MemoryQueueService {
    state: Arc<Mutex<StoreState>>,
    config: StoreConfig,
}

impl MemoryQueueService {
    pub fn new(config: StoreConfig) -> Self {
        MemoryQueueService {
            state: Arc::new(Mutex::new(StoreState::default())),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of live subscribers on a channel
    pub fn subscribers(&self, channel: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, Vec::len)
    }
}

impl Default for MemoryQueueService {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[async_trait]
impl QueueService for MemoryQueueService {
    async fn put(&self, request: PutRequest) -> Result<JobId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut outbox = Outbox::new();

        let PutRequest {
            queue,
            jid,
            klass,
            data,
            now,
            priority,
            tags,
            delay,
            retries,
        } = request;
        let retries = retries.unwrap_or(self.config.default_retries);

        match state.jobs.get_mut(&jid) {
            Some(stored) => {
                let record = &mut stored.record;
                if record.state == JobState::Running {
                    if let Some(owner) = record.worker.as_deref() {
                        outbox.push((worker_channel(owner), Event::new(EventKind::Put, jid.clone())));
                    }
                }
                record.klass = klass;
                record.data = data;
                record.queue = queue.clone();
                if let Some(priority) = priority {
                    record.priority = priority;
                }
                if !tags.is_empty() {
                    record.tags = tags;
                }
                record.retries = retries;
                record.remaining = retries as i32;
                record.failure = None;
            }
            None => {
                let mut record = JobRecord::new(jid.clone(), klass, queue.clone(), data);
                record.priority = priority.unwrap_or_default();
                record.tags = tags;
                record.retries = retries;
                record.remaining = retries as i32;
                state.jobs.insert(jid.clone(), StoredJob { record, seq: 0 });
            }
        }

        state.enqueue(&jid, now, delay);

        if state.jobs.get(&jid).map_or(false, |stored| stored.record.tracked) {
            outbox.push((TRACK_CHANNEL.to_string(), Event::new(EventKind::Put, jid.clone())));
        }
        state.publish(outbox);

        debug!("Put job {} into queue {}", jid, queue);
        Ok(jid)
    }

    async fn pop(&self, request: PopRequest) -> Result<Option<JobRecord>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut outbox = Outbox::new();
        let now = request.now;

        // Expired leases are handed out before waiting work
        while let Some(jid) = state.oldest_expired(&request.queue, now) {
            let Some(stored) = state.jobs.get_mut(&jid) else {
                break;
            };
            let record = &mut stored.record;
            let previous = record.worker.take();

            record.remaining -= 1;
            record.record("timed-out", now, Some(&request.queue), previous.as_deref());

            if let Some(owner) = previous.as_deref() {
                outbox.push((worker_channel(owner), Event::new(EventKind::LockLost, jid.clone())));
            }
            if record.tracked {
                outbox.push((TRACK_CHANNEL.to_string(), Event::new(EventKind::LockLost, jid.clone())));
            }

            if record.remaining < 0 {
                warn!("Job {} exhausted its retries in queue {}", jid, request.queue);
                record.state = JobState::Failed;
                record.expires = None;
                record.failure = Some(Failure {
                    group: format!("failed-retries-{}", request.queue),
                    message: format!("Job exhausted retries in queue \"{}\"", request.queue),
                    when: now,
                    worker: previous,
                });
                record.record("failed", now, Some(&request.queue), None);
                continue;
            }

            info!("Reclaimed stalled job {} for worker {}", jid, request.worker);
            lease(record, &request.worker, now, self.config.heartbeat);
            let leased = record.clone();
            state.publish(outbox);
            return Ok(Some(leased));
        }

        let popped = match state.pop_waiting(&request.queue, now) {
            Some(jid) => state.jobs.get_mut(&jid).map(|stored| {
                lease(&mut stored.record, &request.worker, now, self.config.heartbeat);
                stored.record.clone()
            }),
            None => None,
        };

        state.publish(outbox);
        Ok(popped)
    }

    async fn get_job(&self, jid: &str) -> Result<Option<JobRecord>> {
        let state = self.state.lock();
        let now = Utc::now();

        Ok(state.jobs.get(jid).map(|stored| {
            let mut record = stored.record.clone();
            if record.state == JobState::Running && record.is_lease_expired(now) {
                record.state = JobState::Stalled;
            }
            record
        }))
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<DateTime<Utc>> {
        let mut state = self.state.lock();

        let stored = state
            .jobs
            .get_mut(&request.jid)
            .ok_or_else(|| QueueError::LeaseLost(request.jid.clone()))?;

        if !stored.record.is_leased_by(&request.worker) {
            debug!(
                "Heartbeat for job {} from {} rejected, owner is {:?}",
                request.jid, request.worker, stored.record.worker
            );
            return Err(QueueError::LeaseLost(request.jid));
        }

        let expires = request.now + to_chrono(self.config.heartbeat);
        stored.record.expires = Some(expires);
        if let Some(data) = request.data {
            stored.record.data = data;
        }

        Ok(expires)
    }

    async fn complete(&self, request: CompleteRequest) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = request.now;

        let Some(stored) = state.jobs.get_mut(&request.jid) else {
            return Ok(false);
        };
        let record = &mut stored.record;

        if !record.is_leased_by(&request.worker) || record.queue != request.queue {
            debug!("Complete of job {} by {} rejected", request.jid, request.worker);
            return Ok(false);
        }

        if let Some(data) = request.data {
            record.data = data;
        }
        record.record("done", now, Some(&request.queue), Some(&request.worker));
        let tracked = record.tracked;

        match request.next {
            Some(next) => {
                record.queue = next;
                record.remaining = record.retries as i32;
                state.enqueue(&request.jid, now, request.delay);
            }
            None => {
                record.state = JobState::Complete;
                record.worker = None;
                record.expires = None;
            }
        }

        if tracked {
            let event = Event::new(EventKind::Other("completed".to_string()), request.jid.clone());
            state.publish(vec![(TRACK_CHANNEL.to_string(), event)]);
        }

        Ok(true)
    }

    async fn fail(&self, request: FailRequest) -> Result<Option<JobId>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = request.now;

        let Some(stored) = state.jobs.get_mut(&request.jid) else {
            return Ok(None);
        };
        let record = &mut stored.record;

        record.state = JobState::Failed;
        record.worker = None;
        record.expires = None;
        if let Some(data) = request.data {
            record.data = data;
        }
        record.failure = Some(Failure {
            group: request.group.clone(),
            message: request.message,
            when: now,
            worker: Some(request.worker.clone()),
        });
        let queue = record.queue.clone();
        record.record("failed", now, Some(&queue), Some(&request.worker));

        if record.tracked {
            let event = Event::new(EventKind::Other("failed".to_string()), request.jid.clone());
            state.publish(vec![(TRACK_CHANNEL.to_string(), event)]);
        }

        info!("Job {} failed in group {}", request.jid, request.group);
        Ok(Some(request.jid))
    }

    async fn cancel(&self, jid: &str) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(stored) = state.jobs.remove(jid) else {
            return Ok(false);
        };

        let mut outbox = Outbox::new();
        if stored.record.state == JobState::Running {
            if let Some(owner) = stored.record.worker.as_deref() {
                outbox.push((worker_channel(owner), Event::new(EventKind::Canceled, jid)));
            }
        }
        if stored.record.tracked {
            outbox.push((TRACK_CHANNEL.to_string(), Event::new(EventKind::Canceled, jid)));
        }
        state.publish(outbox);

        info!("Canceled job {}", jid);
        Ok(true)
    }

    async fn track(&self, request: TrackRequest) -> Result<bool> {
        let mut state = self.state.lock();

        let Some(stored) = state.jobs.get_mut(&request.jid) else {
            return Ok(false);
        };
        stored.record.tracked = true;
        for tag in request.tags {
            if !stored.record.tags.contains(&tag) {
                stored.record.tags.push(tag);
            }
        }

        Ok(true)
    }

    async fn untrack(&self, request: UntrackRequest) -> Result<bool> {
        let mut state = self.state.lock();

        match state.jobs.get_mut(&request.jid) {
            Some(stored) => {
                stored.record.tracked = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn worker_jobs(&self, worker: &str) -> Result<Vec<JobId>> {
        let state = self.state.lock();

        let mut leased: Vec<&JobRecord> = state
            .jobs
            .values()
            .map(|stored| &stored.record)
            .filter(|record| record.is_leased_by(worker))
            .collect();
        leased.sort_by(|a, b| a.expires.cmp(&b.expires).then_with(|| a.jid.cmp(&b.jid)));

        Ok(leased.into_iter().map(|record| record.jid.clone()).collect())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let id = {
            let mut state = self.state.lock();
            state.next_subscriber += 1;
            let id = state.next_subscriber;
            state
                .channels
                .entry(channel.to_string())
                .or_default()
                .push(Subscriber { id, sender });
            id
        };

        // Dropping the sender ends the subscriber's stream after it drains
        let state = Arc::clone(&self.state);
        let channel_name = channel.to_string();
        let cancelled = token.clone();
        tokio::spawn(async move {
            cancelled.cancelled().await;
            let mut state = state.lock();
            if let Some(subscribers) = state.channels.get_mut(&channel_name) {
                subscribers.retain(|subscriber| subscriber.id != id);
                if subscribers.is_empty() {
                    state.channels.remove(&channel_name);
                }
            }
        });

        Ok(Subscription::new(channel, receiver, token))
    }
}
