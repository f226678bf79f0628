use jobq_core::{QueueError, QueueService, Subscription};
use jobq_protocol::{
    AckResponse, EventFrame, Message, MessageCodec, NackResponse, Reply,
};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// TCP front end exposing a [`QueueService`] over the framed protocol
pub struct QueueServer {
    service: Arc<dyn QueueService>,
    shutdown: CancellationToken,
}

impl QueueServer {
    pub fn new(service: Arc<dyn QueueService>) -> Self {
        QueueServer {
            service,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the accept loop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shut down
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Queue server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutting down queue server");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a client connection
    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let mut framed = Framed::new(stream, MessageCodec);

        while let Some(result) = framed.next().await {
            match result {
                Ok(Message::Subscribe(request)) => {
                    match self.service.subscribe(&request.channel).await {
                        Ok(subscription) => {
                            framed
                                .send(Message::Ack(AckResponse {
                                    reply: Reply::Subscribed,
                                }))
                                .await?;
                            if !self.stream_events(&mut framed, subscription).await? {
                                break;
                            }
                        }
                        Err(e) => {
                            framed
                                .send(Message::Nack(NackResponse::from_error(&e)))
                                .await?;
                        }
                    }
                }
                Ok(message) => {
                    let response = self.handle_message(message).await;
                    framed.send(response).await?;
                }
                Err(e) => {
                    error!("Protocol error: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Push channel messages to the client until it unsubscribes.
    ///
    /// Returns `false` when the connection is gone.
    async fn stream_events(
        &self,
        framed: &mut Framed<TcpStream, MessageCodec>,
        mut subscription: Subscription,
    ) -> anyhow::Result<bool> {
        let channel = subscription.channel().to_string();
        debug!("Streaming channel {}", channel);

        loop {
            tokio::select! {
                payload = subscription.recv() => {
                    match payload {
                        Some(payload) => {
                            framed
                                .send(Message::Event(EventFrame {
                                    channel: channel.clone(),
                                    payload,
                                }))
                                .await?;
                        }
                        None => {
                            framed.send(Message::Unsubscribed).await?;
                            return Ok(true);
                        }
                    }
                }
                incoming = framed.next() => {
                    match incoming {
                        Some(Ok(Message::Unsubscribe)) => {
                            subscription.unsubscribe();
                            while let Some(payload) = subscription.recv().await {
                                framed
                                    .send(Message::Event(EventFrame {
                                        channel: channel.clone(),
                                        payload,
                                    }))
                                    .await?;
                            }
                            framed.send(Message::Unsubscribed).await?;
                            debug!("Unsubscribed from {}", channel);
                            return Ok(true);
                        }
                        Some(Ok(other)) => {
                            warn!("Unexpected {:?} on subscribed connection", other.message_type());
                            framed
                                .send(Message::Nack(NackResponse {
                                    error: "Connection is subscribed".to_string(),
                                    lease_lost: None,
                                }))
                                .await?;
                        }
                        Some(Err(e)) => {
                            error!("Protocol error: {}", e);
                            return Ok(false);
                        }
                        None => return Ok(false),
                    }
                }
            }
        }
    }

    /// Handle a protocol message
    async fn handle_message(&self, message: Message) -> Message {
        let result = match message {
            Message::Put(request) => self.service.put(request).await.map(Reply::Jid),
            Message::Pop(request) => self.service.pop(request).await.map(Reply::Job),
            Message::GetJob(query) => self.service.get_job(&query.jid).await.map(Reply::Job),
            Message::Heartbeat(request) => self.service.heartbeat(request).await.map(Reply::Expiry),
            Message::Complete(request) => self.service.complete(request).await.map(Reply::Flag),
            Message::Fail(request) => self.service.fail(request).await.map(Reply::Failed),
            Message::Cancel(query) => self.service.cancel(&query.jid).await.map(Reply::Flag),
            Message::Track(request) => self.service.track(request).await.map(Reply::Flag),
            Message::Untrack(request) => self.service.untrack(request).await.map(Reply::Flag),
            Message::WorkerJobs(query) => {
                self.service.worker_jobs(&query.worker).await.map(Reply::Jids)
            }
            other => Err(QueueError::Rejected(format!(
                "Unsupported message type {:?}",
                other.message_type()
            ))),
        };

        match result {
            Ok(reply) => Message::Ack(AckResponse { reply }),
            Err(e) => {
                debug!("Request rejected: {}", e);
                Message::Nack(NackResponse::from_error(&e))
            }
        }
    }
}
