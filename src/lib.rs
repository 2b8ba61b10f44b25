//! Background reporting of application metrics
//!
//! Producers report metrics from any thread; a worker thread periodically
//! polls registered collectors, aggregates what was queued and ships it to a
//! remote ingestion API in bounded batches.

pub mod aggregator;
pub mod builder;
pub mod catalog;
pub mod client;
pub mod collector;
pub mod config;
pub mod datum;
pub mod error;
pub mod process;
pub mod queue;
pub mod reporter;
pub mod sink;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::builder::MetricReport;
    pub use crate::client::{MAX_DATUMS_PER_CALL, MetricsClient};
    pub use crate::collector::{Collector, FnCollector};
    pub use crate::config::{IntegrationConfig, ReporterConfig, SharedConfig};
    pub use crate::datum::{Datum, Dimension, MetricValue, StatisticSet};
    pub use crate::error::{ReporterError, Result};
    pub use crate::reporter::{FlushSummary, Reporter};
    pub use crate::sink::MetricSink;
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
