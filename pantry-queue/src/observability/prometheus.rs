use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::{QueueError, QueueResult, JobStatus, observability::QueueMetricsSnapshot};

/// Mirrors queue snapshots into a Prometheus registry
pub struct PrometheusExporter {
    registry: Registry,
    jobs: IntGaugeVec,
    events: IntCounterVec,
}

impl PrometheusExporter {
    pub fn new() -> QueueResult<Self> {
        let registry = Registry::new();

        let jobs = IntGaugeVec::new(
            Opts::new("pantry_queue_jobs", "Jobs per queue and status at the last sample"),
            &["queue", "status"],
        )
        .map_err(metrics_error)?;
        let events = IntCounterVec::new(
            Opts::new("pantry_queue_events_total", "Job lifecycle transitions per queue"),
            &["queue", "event"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(jobs.clone())).map_err(metrics_error)?;
        registry.register(Box::new(events.clone())).map_err(metrics_error)?;

        Ok(Self { registry, jobs, events })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record(&self, snapshot: &QueueMetricsSnapshot) {
        for status in JobStatus::all() {
            self.jobs
                .with_label_values(&[snapshot.queue.as_str(), status.name()])
                .set(snapshot.counts.get(status) as i64);
        }

        // Counters only move forward; add the difference since the last sample
        for (event, total) in snapshot.counters.iter() {
            let counter = self.events.with_label_values(&[snapshot.queue.as_str(), event]);
            let seen = counter.get();
            if total > seen {
                counter.inc_by(total - seen);
            }
        }
    }

    /// Render every registered metric in the text exposition format
    pub fn render(&self) -> QueueResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| QueueError::Internal(e.to_string()))
    }
}

fn metrics_error(err: prometheus::Error) -> QueueError {
    QueueError::Internal(format!("prometheus: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobCounts, observability::CounterSnapshot};
    use chrono::Utc;

    #[test]
    fn renders_counts_and_counters() {
        let exporter = PrometheusExporter::new().unwrap();
        let mut snapshot = QueueMetricsSnapshot {
            queue: "email".to_string(),
            counts: JobCounts { waiting: 4, active: 2, ..Default::default() },
            counters: CounterSnapshot { enqueued: 6, processing: 2, ..Default::default() },
            sampled_at: Utc::now(),
        };
        exporter.record(&snapshot);

        snapshot.counters.enqueued = 9;
        exporter.record(&snapshot);

        let text = exporter.render().unwrap();
        assert!(text.contains(r#"pantry_queue_jobs{queue="email",status="waiting"} 4"#));
        assert!(text.contains(r#"pantry_queue_events_total{event="enqueued",queue="email"} 9"#));
    }
}
