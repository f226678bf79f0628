use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobq_core::{
    CompleteRequest, FailRequest, HeartbeatRequest, JobId, JobRecord, PopRequest, PutRequest,
    QueueError, QueueService, Result, Subscription, TrackRequest, UntrackRequest,
};
use jobq_protocol::{
    AckResponse, JobQuery, Message, MessageCodec, ProtocolError, Reply, SubscribeRequest,
    WorkerQuery,
};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Connection = Framed<TcpStream, MessageCodec>;

/// Queue service reached over TCP.
///
/// Requests share one connection, opened on first use and reopened after a
/// transport failure. Every subscription gets a connection of its own.
pub struct RemoteQueueService {
    address: String,
    connection: Mutex<Option<Connection>>,
}

impl RemoteQueueService {
    /// Client that connects on first request
    pub fn new(address: impl Into<String>) -> Self {
        RemoteQueueService {
            address: address.into(),
            connection: Mutex::new(None),
        }
    }

    /// Connect to the queue service right away
    pub async fn connect(address: impl Into<String>) -> Result<Self> {
        let client = Self::new(address);
        let connection = open(&client.address).await?;
        *client.connection.lock().await = Some(connection);
        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// One request/reply exchange on the shared connection.
    ///
    /// The connection is out of its slot while the exchange runs, so a
    /// caller dropped mid-exchange takes it down with them and the next
    /// request reconnects instead of reading a reply meant for someone else.
    async fn request(&self, message: Message) -> Result<Reply> {
        let mut connection = self.connection.lock().await;

        let mut framed = match connection.take() {
            Some(framed) => framed,
            None => open(&self.address).await?,
        };

        let result = exchange(&mut framed, message).await;
        if matches!(&result, Err(e) if e.is_transient()) {
            debug!("Dropping connection to {}", self.address);
        } else {
            *connection = Some(framed);
        }
        result
    }
}

async fn open(address: &str) -> Result<Connection> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| QueueError::Transient(format!("Connection to {} failed: {}", address, e)))?;
    Ok(Framed::new(stream, MessageCodec))
}

fn transport(error: ProtocolError) -> QueueError {
    QueueError::Transient(error.to_string())
}

fn unexpected(reply: Reply) -> QueueError {
    QueueError::Rejected(format!("Unexpected reply: {:?}", reply))
}

async fn exchange(framed: &mut Connection, message: Message) -> Result<Reply> {
    framed.send(message).await.map_err(transport)?;

    match framed.next().await {
        Some(Ok(Message::Ack(ack))) => Ok(ack.reply),
        Some(Ok(Message::Nack(nack))) => Err(nack.into_error()),
        Some(Ok(other)) => Err(QueueError::Transient(format!(
            "Unexpected response {:?}",
            other.message_type()
        ))),
        Some(Err(e)) => Err(transport(e)),
        None => Err(QueueError::Transient("Connection closed".to_string())),
    }
}

/// Relay pushed events into the subscription until the server confirms the
/// unsubscribe or the connection ends
async fn forward_events(
    mut framed: Connection,
    sender: mpsc::UnboundedSender<String>,
    unsubscribe: CancellationToken,
    channel: String,
) {
    let mut unsubscribing = false;

    loop {
        tokio::select! {
            _ = unsubscribe.cancelled(), if !unsubscribing => {
                unsubscribing = true;
                if let Err(e) = framed.send(Message::Unsubscribe).await {
                    warn!("Failed to unsubscribe from {}: {}", channel, e);
                    break;
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(Message::Event(frame))) => {
                        // The subscriber may already be gone
                        let _ = sender.send(frame.payload);
                    }
                    Some(Ok(Message::Unsubscribed)) => break,
                    Some(Ok(other)) => {
                        warn!("Unexpected {:?} on channel {}", other.message_type(), channel);
                    }
                    Some(Err(e)) => {
                        warn!("Subscription to {} failed: {}", channel, e);
                        break;
                    }
                    None => {
                        debug!("Subscription connection for {} closed", channel);
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl QueueService for RemoteQueueService {
    async fn put(&self, request: PutRequest) -> Result<JobId> {
        match self.request(Message::Put(request)).await? {
            Reply::Jid(jid) => Ok(jid),
            other => Err(unexpected(other)),
        }
    }

    async fn pop(&self, request: PopRequest) -> Result<Option<JobRecord>> {
        match self.request(Message::Pop(request)).await? {
            Reply::Job(job) => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    async fn get_job(&self, jid: &str) -> Result<Option<JobRecord>> {
        let query = JobQuery {
            jid: jid.to_string(),
        };
        match self.request(Message::GetJob(query)).await? {
            Reply::Job(job) => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<DateTime<Utc>> {
        match self.request(Message::Heartbeat(request)).await? {
            Reply::Expiry(expires) => Ok(expires),
            other => Err(unexpected(other)),
        }
    }

    async fn complete(&self, request: CompleteRequest) -> Result<bool> {
        match self.request(Message::Complete(request)).await? {
            Reply::Flag(completed) => Ok(completed),
            other => Err(unexpected(other)),
        }
    }

    async fn fail(&self, request: FailRequest) -> Result<Option<JobId>> {
        match self.request(Message::Fail(request)).await? {
            Reply::Failed(jid) => Ok(jid),
            other => Err(unexpected(other)),
        }
    }

    async fn cancel(&self, jid: &str) -> Result<bool> {
        let query = JobQuery {
            jid: jid.to_string(),
        };
        match self.request(Message::Cancel(query)).await? {
            Reply::Flag(canceled) => Ok(canceled),
            other => Err(unexpected(other)),
        }
    }

    async fn track(&self, request: TrackRequest) -> Result<bool> {
        match self.request(Message::Track(request)).await? {
            Reply::Flag(tracked) => Ok(tracked),
            other => Err(unexpected(other)),
        }
    }

    async fn untrack(&self, request: UntrackRequest) -> Result<bool> {
        match self.request(Message::Untrack(request)).await? {
            Reply::Flag(untracked) => Ok(untracked),
            other => Err(unexpected(other)),
        }
    }

    async fn worker_jobs(&self, worker: &str) -> Result<Vec<JobId>> {
        let query = WorkerQuery {
            worker: worker.to_string(),
        };
        match self.request(Message::WorkerJobs(query)).await? {
            Reply::Jids(jids) => Ok(jids),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut framed = open(&self.address).await?;

        let request = SubscribeRequest {
            channel: channel.to_string(),
        };
        framed
            .send(Message::Subscribe(request))
            .await
            .map_err(transport)?;

        match framed.next().await {
            Some(Ok(Message::Ack(AckResponse {
                reply: Reply::Subscribed,
            }))) => {}
            Some(Ok(Message::Nack(nack))) => return Err(nack.into_error()),
            Some(Ok(other)) => {
                return Err(QueueError::Rejected(format!(
                    "Unexpected response {:?} to subscribe",
                    other.message_type()
                )))
            }
            Some(Err(e)) => return Err(transport(e)),
            None => return Err(QueueError::Transient("Connection closed".to_string())),
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        tokio::spawn(forward_events(
            framed,
            sender,
            token.clone(),
            channel.to_string(),
        ));

        debug!("Subscribed to {} at {}", channel, self.address);
        Ok(Subscription::new(channel, receiver, token))
    }
}
