//! TCP client for a remote queue service.

mod async_client;

pub use async_client::RemoteQueueService;
