pub mod config;
pub mod queue;
pub mod server;
pub mod store;

pub use config::BrokerConfig;
pub use server::QueueServer;
pub use store::{MemoryQueueService, StoreConfig};
