mod job;
mod priority;
mod error;
mod event;
mod service;

pub use job::{new_jid, Failure, HistoryEntry, JobId, JobRecord, JobState};
pub use priority::Priority;
pub use error::{QueueError, Result};
pub use event::{worker_channel, Event, EventKind, TRACK_CHANNEL};
pub use service::{
    CompleteRequest, FailRequest, HeartbeatRequest, PopRequest, PutRequest, QueueService,
    Subscription, TrackRequest, UntrackRequest,
};

/// Retries granted to a job when the producer does not specify any.
pub const DEFAULT_RETRIES: u32 = 5;
