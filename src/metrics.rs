//! Prometheus timers for batch processing.

use chrono::{DateTime, Utc};
use prometheus::{Histogram, HistogramOpts, IntGauge, Registry};

const TIME_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0, 14400.0];

/// Queue timers, registered on a caller-owned [`Registry`].
#[derive(Clone)]
pub struct QueueMetrics {
    /// Time a batch waited between submission and its first claim.
    pub wait_time: Histogram,
    /// Time between two heartbeats of a running batch.
    pub partial_time: Histogram,
    pub success_time: Histogram,
    pub failure_time: Histogram,
    pub queue_length: IntGauge,
}

fn histogram(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Histogram> {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(name, help)
            .namespace("dpc_queue")
            .buckets(TIME_BUCKETS.to_vec()),
    )?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

impl QueueMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let queue_length = IntGauge::new("dpc_queue_queue_length", "Number of QUEUED batches")?;
        registry.register(Box::new(queue_length.clone()))?;

        Ok(Self {
            wait_time: histogram(registry, "wait_time_seconds", "Time from submission to claim")?,
            partial_time: histogram(
                registry,
                "partial_time_seconds",
                "Time between partial completions",
            )?,
            success_time: histogram(
                registry,
                "success_time_seconds",
                "Work time of completed batches",
            )?,
            failure_time: histogram(registry, "failure_time_seconds", "Work time of failed batches")?,
            queue_length,
        })
    }

    /// Records `to - from` in `histogram`, skipping unknown start points.
    pub(crate) fn observe_between(
        histogram: &Histogram,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) {
        if let Some(from) = from {
            let millis = (to - from).num_milliseconds().max(0);
            histogram.observe(millis as f64 / 1000.0);
        }
    }
}
