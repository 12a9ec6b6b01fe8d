//! Process metrics

use listrust_common::{Error, Result};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    jobs: IntCounterVec,
    dispositions: IntCounterVec,
    workflow_events: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| Error::Internal(format!("Invalid metric {}: {}", name, e)))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| Error::Internal(format!("Failed to register metric {}: {}", name, e)))?;
    Ok(counter)
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            jobs: counter(
                &registry,
                "listrust_jobs_total",
                "Queue items processed, by outcome",
                &["queue", "outcome"],
            )?,
            dispositions: counter(
                &registry,
                "listrust_dispositions_total",
                "Posting chain dispositions",
                &["disposition"],
            )?,
            workflow_events: counter(
                &registry,
                "listrust_workflow_events_total",
                "Workflow lifecycle events",
                &["kind", "event"],
            )?,
            registry,
        })
    }

    /// `outcome` is one of `done`, `retried`, `failed`, `dropped`
    pub fn job(&self, queue: &str, outcome: &str) {
        self.jobs.with_label_values(&[queue, outcome]).inc();
    }

    pub fn disposition(&self, disposition: &str) {
        self.dispositions.with_label_values(&[disposition]).inc();
    }

    pub fn workflow_event(&self, kind: &str, event: &str) {
        self.workflow_events.with_label_values(&[kind, event]).inc();
    }

    pub fn job_count(&self, queue: &str, outcome: &str) -> u64 {
        self.jobs.with_label_values(&[queue, outcome]).get()
    }

    pub fn workflow_event_count(&self, kind: &str, event: &str) -> u64 {
        self.workflow_events.with_label_values(&[kind, event]).get()
    }

    /// Text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = Metrics::new().unwrap();
        metrics.job("in", "done");
        metrics.job("in", "done");
        metrics.disposition("hold");
        metrics.workflow_event("subscription", "completed");

        assert_eq!(metrics.job_count("in", "done"), 2);
        let text = metrics.render().unwrap();
        assert!(text.contains("# TYPE listrust_jobs_total counter"));
        assert!(text.contains("queue=\"in\""));
        assert!(text.contains("listrust_dispositions_total{disposition=\"hold\"} 1"));
    }
}
