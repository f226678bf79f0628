use futures::stream::{self, Stream};
use jobq_core::{worker_channel, Event, QueueService, Result, Subscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Notifications about jobs this worker holds.
///
/// Listens on the worker's channel; malformed messages are logged and
/// skipped. The event sequence ends once [`stop`](Self::stop) has been
/// called and every message already delivered has been read.
pub struct EventListener {
    subscription: Subscription,
}

/// Stops an [`EventListener`] from another task
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }
}

impl EventListener {
    pub async fn subscribe(service: &dyn QueueService, worker: &str) -> Result<Self> {
        let channel = worker_channel(worker);
        let subscription = service.subscribe(&channel).await?;
        debug!("Listening for events on {}", channel);
        Ok(EventListener { subscription })
    }

    pub fn channel(&self) -> &str {
        self.subscription.channel()
    }

    /// Next well-formed event, `None` once stopped and drained
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            let raw = self.subscription.recv().await?;
            match Event::parse(&raw) {
                Ok(event) => return Some(event),
                Err(e) => warn!("Skipping notification on {}: {}", self.channel(), e),
            }
        }
    }

    pub fn stop(&self) {
        self.subscription.unsubscribe();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.subscription.unsubscribe_token())
    }

    pub fn listen(self) -> impl Stream<Item = Event> + Send {
        stream::unfold(self, |mut listener| async move {
            listener.next_event().await.map(|event| (event, listener))
        })
    }
}
