use crate::{Job, Queue};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

/// Where a worker gets its jobs from.
///
/// Replays resumable jobs first, re-leasing each with a heartbeat and
/// dropping the ones that fail. Then polls the queues round-robin, one pop
/// per queue per round in list order. `next` returns `None` for a round in
/// which no queue had work.
pub struct JobSource {
    resume: VecDeque<Job>,
    queues: Vec<Queue>,
    cursor: usize,
    seen: bool,
}

impl JobSource {
    pub fn new(queues: Vec<Queue>, resume: Vec<Job>) -> Self {
        JobSource {
            resume: resume.into(),
            queues,
            cursor: 0,
            seen: false,
        }
    }

    pub async fn next(&mut self) -> Option<Job> {
        while let Some(mut job) = self.resume.pop_front() {
            match job.heartbeat().await {
                Ok(_) => {
                    info!("Resuming job {} from {}", job.jid(), job.queue());
                    return Some(job);
                }
                Err(e) => error!("Unable to resume job {}: {}", job.jid(), e),
            }
        }

        loop {
            if self.cursor == self.queues.len() {
                self.cursor = 0;
                if !std::mem::take(&mut self.seen) {
                    debug!("No jobs in {} queues", self.queues.len());
                    return None;
                }
            }

            let queue = &self.queues[self.cursor];
            self.cursor += 1;

            match queue.pop().await {
                Ok(Some(job)) => {
                    self.seen = true;
                    return Some(job);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to pop from {}: {}", queue.name(), e),
            }
        }
    }

    /// Endless stream of `next()` results
    pub fn into_stream(self) -> BoxStream<'static, Option<Job>> {
        stream::unfold(self, |mut source| async move {
            let job = source.next().await;
            Some((job, source))
        })
        .boxed()
    }
}
