use crate::store::StoreConfig;
use jobq_core::DEFAULT_RETRIES;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub broker: NetworkConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Lease length granted by pop and heartbeat
    pub heartbeat_secs: u64,
    /// Retries for jobs put without an explicit count
    pub default_retries: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            heartbeat_secs: 60,
            default_retries: DEFAULT_RETRIES,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            broker: NetworkConfig {
                host: "0.0.0.0".to_string(),
                port: 6380,
            },
            jobs: JobsConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.broker.host, self.broker.port)
    }

    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            heartbeat: Duration::from_secs(self.jobs.heartbeat_secs),
            default_retries: self.jobs.default_retries,
        }
    }
}
