//! Resolution of raw metric reports into fully-described datums
use chrono::Utc;
use log::trace;

use crate::config::{ReporterConfig, SharedConfig};
use crate::datum::{Datum, Dimension, MetricValue, StatisticSet};

/// A raw metric report as produced by a collector or call site
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReport {
    pub metric_name: String,
    pub value: MetricValue,
    pub dimensions: Vec<Dimension>,
    /// Overrides the owning integration's namespace
    pub namespace: Option<String>,
    /// Names the owning integration instead of looking it up; its allow-list still applies
    pub integration: Option<String>,
}

impl MetricReport {
    pub fn new(metric_name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        Self {
            metric_name: metric_name.into(),
            value: value.into(),
            dimensions: Vec::new(),
            namespace: None,
            integration: None,
        }
    }

    pub fn statistics(metric_name: impl Into<String>, set: StatisticSet) -> Self {
        Self::new(metric_name, set)
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.dimensions.push(Dimension::new(name, value));
        self
    }

    /// Append dimensions from any name/value pairs, e.g. a map
    pub fn with_dimensions<I, K, V>(mut self, dimensions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.dimensions
            .extend(dimensions.into_iter().map(|(k, v)| Dimension::new(k, v)));
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_integration(mut self, integration: impl Into<String>) -> Self {
        self.integration = Some(integration.into());
        self
    }
}

/// Turns reports into datums, applying naming, unit and allow-list policy
#[derive(Debug, Clone)]
pub struct MetricBuilder {
    config: SharedConfig,
}

impl MetricBuilder {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }

    /// Build against the current configuration snapshot
    pub fn build(&self, report: MetricReport) -> Option<Datum> {
        let config = self.config.snapshot();
        Self::build_with(&config, report)
    }

    /// Build a datum, or `None` when policy does not allow the metric.
    ///
    /// Unknown metrics and metrics outside their integration's allow-list
    /// are dropped silently; this bounds the set of series a misbehaving
    /// call site can create.
    pub fn build_with(config: &ReporterConfig, report: MetricReport) -> Option<Datum> {
        let MetricReport {
            metric_name,
            value,
            mut dimensions,
            namespace,
            integration,
        } = report;

        let integration = match integration {
            Some(int) => int,
            None => match config.integration_for_metric(&metric_name) {
                Some(int) => int.name.clone(),
                None => {
                    trace!("Dropping metric '{}': no integration reports it", metric_name);
                    return None;
                }
            },
        };

        if !config.metric_allowed(&integration, &metric_name) {
            trace!(
                "Dropping metric '{}': not allowed for integration '{}'",
                metric_name, integration
            );
            return None;
        }

        let namespace = namespace.unwrap_or_else(|| config.namespace_for(&integration));
        let unit = config.unit_for(&metric_name).to_string();
        dimensions.extend(config.dimensions.iter().cloned());

        Some(Datum {
            metric_name,
            namespace,
            unit,
            dimensions,
            timestamp: Utc::now(),
            value,
            storage_resolution: None,
        })
    }
}
