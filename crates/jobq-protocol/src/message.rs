use chrono::{DateTime, Utc};
use jobq_core::{
    CompleteRequest, FailRequest, HeartbeatRequest, JobId, JobRecord, PopRequest, PutRequest,
    QueueError, TrackRequest, UntrackRequest,
};
use serde::{Deserialize, Serialize};

/// Message types for the TCP protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Put = 1,
    Pop = 2,
    GetJob = 3,
    Heartbeat = 4,
    Complete = 5,
    Fail = 6,
    Cancel = 7,
    Track = 8,
    Untrack = 9,
    WorkerJobs = 10,
    Subscribe = 11,
    Unsubscribe = 12,
    Ack = 20,
    Nack = 21,
    Event = 22,
    Unsubscribed = 23,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Put),
            2 => Some(MessageType::Pop),
            3 => Some(MessageType::GetJob),
            4 => Some(MessageType::Heartbeat),
            5 => Some(MessageType::Complete),
            6 => Some(MessageType::Fail),
            7 => Some(MessageType::Cancel),
            8 => Some(MessageType::Track),
            9 => Some(MessageType::Untrack),
            10 => Some(MessageType::WorkerJobs),
            11 => Some(MessageType::Subscribe),
            12 => Some(MessageType::Unsubscribe),
            20 => Some(MessageType::Ack),
            21 => Some(MessageType::Nack),
            22 => Some(MessageType::Event),
            23 => Some(MessageType::Unsubscribed),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Protocol messages.
///
/// Every request is answered with `Ack` or `Nack`. After an acknowledged
/// `Subscribe` the server pushes `Event` frames until the client sends
/// `Unsubscribe`, which is answered with `Unsubscribed` once every buffered
/// event has been flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Put(PutRequest),
    Pop(PopRequest),
    GetJob(JobQuery),
    Heartbeat(HeartbeatRequest),
    Complete(CompleteRequest),
    Fail(FailRequest),
    Cancel(JobQuery),
    Track(TrackRequest),
    Untrack(UntrackRequest),
    WorkerJobs(WorkerQuery),
    Subscribe(SubscribeRequest),
    Unsubscribe,

    /// Positive acknowledgment
    Ack(AckResponse),

    /// Negative acknowledgment
    Nack(NackResponse),

    /// Pushed channel message
    Event(EventFrame),

    Unsubscribed,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Put(_) => MessageType::Put,
            Message::Pop(_) => MessageType::Pop,
            Message::GetJob(_) => MessageType::GetJob,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::Complete(_) => MessageType::Complete,
            Message::Fail(_) => MessageType::Fail,
            Message::Cancel(_) => MessageType::Cancel,
            Message::Track(_) => MessageType::Track,
            Message::Untrack(_) => MessageType::Untrack,
            Message::WorkerJobs(_) => MessageType::WorkerJobs,
            Message::Subscribe(_) => MessageType::Subscribe,
            Message::Unsubscribe => MessageType::Unsubscribe,
            Message::Ack(_) => MessageType::Ack,
            Message::Nack(_) => MessageType::Nack,
            Message::Event(_) => MessageType::Event,
            Message::Unsubscribed => MessageType::Unsubscribed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQuery {
    pub jid: JobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerQuery {
    pub worker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub channel: String,
}

/// Typed result carried by an `Ack`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Jid(JobId),
    Job(Option<JobRecord>),
    Expiry(DateTime<Utc>),
    Flag(bool),
    Failed(Option<JobId>),
    Jids(Vec<JobId>),
    Subscribed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckResponse {
    pub reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackResponse {
    pub error: String,
    /// Set when the request failed because the lease on this job is gone
    pub lease_lost: Option<JobId>,
}

impl NackResponse {
    pub fn from_error(error: &QueueError) -> Self {
        let lease_lost = match error {
            QueueError::LeaseLost(jid) => Some(jid.clone()),
            _ => None,
        };

        NackResponse {
            error: error.to_string(),
            lease_lost,
        }
    }

    pub fn into_error(self) -> QueueError {
        match self.lease_lost {
            Some(jid) => QueueError::LeaseLost(jid),
            None => QueueError::Rejected(self.error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub channel: String,
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(1), Some(MessageType::Put));
        assert_eq!(MessageType::from_u8(23), Some(MessageType::Unsubscribed));
        assert_eq!(MessageType::from_u8(99), None);

        assert_eq!(MessageType::Heartbeat.as_u8(), 4);
        assert_eq!(Message::Unsubscribe.message_type(), MessageType::Unsubscribe);
    }

    #[test]
    fn test_nack_preserves_lease_lost() {
        let nack = NackResponse::from_error(&QueueError::LeaseLost("jid-1".into()));
        assert!(nack.into_error().is_lease_lost());

        let nack = NackResponse::from_error(&QueueError::JobNotFound("jid-2".into()));
        match nack.into_error() {
            QueueError::Rejected(message) => assert!(message.contains("jid-2")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
