use log::{error, trace};
use std::sync::Arc;

use crate::builder::{MetricBuilder, MetricReport};
use crate::config::SharedConfig;
use crate::queue::MetricQueue;

/// The build-and-enqueue path shared by producers and collectors
#[derive(Clone)]
pub struct MetricSink {
    config: SharedConfig,
    queue: Arc<MetricQueue>,
}

impl MetricSink {
    pub fn new(config: SharedConfig, queue: Arc<MetricQueue>) -> Self {
        Self { config, queue }
    }

    /// Build and enqueue a report; returns whether it was queued.
    ///
    /// Never fails: disabled environments and policy rejections drop the
    /// report silently, queue errors are logged.
    pub fn report(&self, report: MetricReport) -> bool {
        let config = self.config.snapshot();
        if !config.environment_enabled() {
            trace!(
                "Dropping metric '{}': environment '{}' is not enabled",
                report.metric_name, config.environment
            );
            return false;
        }

        let Some(datum) = MetricBuilder::build_with(&config, report) else {
            return false;
        };

        let queued = self
            .queue
            .set_max_size(config.queue_max_size)
            .and_then(|_| self.queue.push(datum));

        match queued {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to queue metric: {}", e);
                false
            }
        }
    }

    /// Convenience for a scalar report with no dimensions
    pub fn report_value(&self, metric_name: impl Into<String>, value: f64) -> bool {
        self.report(MetricReport::new(metric_name, value))
    }

    pub fn queue(&self) -> &Arc<MetricQueue> {
        &self.queue
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }
}
