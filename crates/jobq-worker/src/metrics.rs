use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// How a job execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    /// Lease lost, canceled or moved while running
    Lost,
    Killed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::Lost => "lost",
            Outcome::Killed => "killed",
        }
    }
}

/// Prometheus metrics for a worker pool
pub struct WorkerMetrics {
    pub registry: Registry,

    pub jobs_total: IntCounterVec,
    pub jobs_in_flight: IntGauge,
    pub child_respawns_total: IntCounter,
}

impl WorkerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("jobq_jobs_total", "Jobs executed by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;

        let jobs_in_flight = IntGauge::new("jobq_jobs_in_flight", "Jobs currently executing")?;
        registry.register(Box::new(jobs_in_flight.clone()))?;

        let child_respawns_total = IntCounter::new(
            "jobq_child_respawns_total",
            "Child processes started to replace one that exited",
        )?;
        registry.register(Box::new(child_respawns_total.clone()))?;

        Ok(WorkerMetrics {
            registry,
            jobs_total,
            jobs_in_flight,
            child_respawns_total,
        })
    }

    pub fn record(&self, outcome: Outcome) {
        self.jobs_total.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.jobs_total.with_label_values(&[outcome.as_str()]).get()
    }

    /// Text exposition of every metric
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            return format!("# metrics unavailable: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_render() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.record(Outcome::Completed);
        metrics.record(Outcome::Completed);
        metrics.record(Outcome::Lost);
        metrics.child_respawns_total.inc();

        assert_eq!(metrics.count(Outcome::Completed), 2);
        assert_eq!(metrics.count(Outcome::Failed), 0);

        let text = metrics.render();
        assert!(text.contains("jobq_jobs_total{outcome=\"completed\"} 2"));
        assert!(text.contains("jobq_child_respawns_total 1"));
    }
}
