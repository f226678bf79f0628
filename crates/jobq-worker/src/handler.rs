use crate::{Job, Result, WorkerError};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Work a job's `klass` resolves to.
///
/// Returning `Ok` completes the job unless the handler already completed,
/// failed, moved or canceled it. Returning `Err` fails the job with group
/// `<queue>-failure`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: &mut Job) -> anyhow::Result<()>;
}

static GLOBAL: OnceCell<Arc<HandlerRegistry>> = OnceCell::new();

/// Handlers by work descriptor, fixed once built
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    /// Overrides for a (klass, queue) pair
    queue_handlers: HashMap<(String, String), Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Handler for `klass` running in `queue`; a queue-specific handler wins
    pub fn resolve(&self, klass: &str, queue: &str) -> Result<Arc<dyn JobHandler>> {
        self.queue_handlers
            .get(&(klass.to_string(), queue.to_string()))
            .or_else(|| self.handlers.get(klass))
            .cloned()
            .ok_or_else(|| WorkerError::WorkUnresolvable {
                klass: klass.to_string(),
                queue: queue.to_string(),
            })
    }

    /// Registered work descriptors
    pub fn klasses(&self) -> Vec<String> {
        let mut klasses: Vec<String> = self
            .handlers
            .keys()
            .chain(self.queue_handlers.keys().map(|(klass, _)| klass))
            .cloned()
            .collect();
        klasses.sort();
        klasses.dedup();
        klasses
    }

    /// Make this the process-wide registry. The first installed registry
    /// stays; later ones are discarded.
    pub fn install(self) -> Arc<HandlerRegistry> {
        if GLOBAL.get().is_some() {
            warn!("Handler registry already installed, keeping the first one");
        }
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(self)))
    }

    pub fn global() -> Option<Arc<HandlerRegistry>> {
        GLOBAL.get().cloned()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    queue_handlers: HashMap<(String, String), Arc<dyn JobHandler>>,
}

impl HandlerRegistryBuilder {
    /// Default handler for a work descriptor
    pub fn register<H: JobHandler + 'static>(mut self, klass: impl Into<String>, handler: H) -> Self {
        self.handlers.insert(klass.into(), Arc::new(handler));
        self
    }

    /// Handler for a work descriptor when it runs in `queue`
    pub fn register_for_queue<H: JobHandler + 'static>(
        mut self,
        klass: impl Into<String>,
        queue: impl Into<String>,
        handler: H,
    ) -> Self {
        self.queue_handlers
            .insert((klass.into(), queue.into()), Arc::new(handler));
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
            queue_handlers: self.queue_handlers,
        }
    }
}

/// Example handler that completes the job untouched
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn process(&self, _job: &mut Job) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Example handler that simulates work, sleeping for the job's `sleep_ms`
/// field or a fixed default
pub struct SleepHandler {
    duration_ms: u64,
}

impl SleepHandler {
    pub fn new(duration_ms: u64) -> Self {
        SleepHandler { duration_ms }
    }
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn process(&self, job: &mut Job) -> anyhow::Result<()> {
        let duration_ms = job
            .get("sleep_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.duration_ms);

        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        job.set("slept_ms", duration_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker(&'static str);

    #[async_trait]
    impl JobHandler for Marker {
        async fn process(&self, job: &mut Job) -> anyhow::Result<()> {
            job.set("handled_by", self.0);
            Ok(())
        }
    }

    #[test]
    fn test_resolution_order() {
        let registry = HandlerRegistry::builder()
            .register("reports.Daily", Marker("default"))
            .register_for_queue("reports.Daily", "urgent", Marker("urgent"))
            .register("echo", EchoHandler)
            .build();

        assert!(registry.resolve("reports.Daily", "q").is_ok());
        assert!(registry.resolve("reports.Daily", "urgent").is_ok());
        assert_eq!(registry.klasses(), vec!["echo", "reports.Daily"]);

        match registry.resolve("missing", "q") {
            Err(WorkerError::WorkUnresolvable { klass, queue }) => {
                assert_eq!(klass, "missing");
                assert_eq!(queue, "q");
            }
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("resolved an unregistered klass"),
        }
    }

    #[test]
    fn test_first_install_wins() {
        let first = HandlerRegistry::builder().register("echo", EchoHandler).build().install();
        let second = HandlerRegistry::builder()
            .register("sleep", SleepHandler::new(1))
            .build()
            .install();

        assert!(Arc::ptr_eq(&first, &second));
        let global = HandlerRegistry::global().unwrap();
        assert_eq!(global.klasses(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_queue_specific_handler_wins() {
        use jobq_broker::MemoryQueueService;
        use jobq_core::{JobRecord, QueueService};
        use serde_json::json;

        let registry = HandlerRegistry::builder()
            .register("k", Marker("default"))
            .register_for_queue("k", "urgent", Marker("urgent"))
            .build();

        let service: Arc<dyn QueueService> = Arc::new(MemoryQueueService::default());
        for (queue, expected) in [("q", "default"), ("urgent", "urgent")] {
            let mut job = Job::new(JobRecord::new("j", "k", queue, json!({})), service.clone(), "w");
            let handler = registry.resolve("k", queue).unwrap();
            handler.process(&mut job).await.unwrap();
            assert_eq!(job.get("handled_by").unwrap(), expected);
        }
    }
}
