//! ログとメトリクス

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{spawn_metrics_sink, MetricsCollector, MetricsEvent, MetricsExport, MetricsSink, MetricsSummary};
