pub mod metrics;
pub mod collector;
pub mod stalled;

#[cfg(feature = "tracing-basic")]
pub mod tracing;

#[cfg(feature = "metrics")]
pub mod prometheus;

pub use metrics::{QueueCounters, CounterSnapshot, QueueMetricsSnapshot};
pub use collector::MetricsCollector;
pub use stalled::StalledMonitor;

#[cfg(feature = "tracing-basic")]
pub use self::tracing::init_tracing;

#[cfg(feature = "metrics")]
pub use self::prometheus::PrometheusExporter;
