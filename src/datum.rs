//! Value objects shared by the builder, queue, aggregator and clients
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A name/value tag attached to a datum
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// A pre-aggregated summary standing in for several raw samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticSet {
    pub sample_count: f64,
    pub sum: f64,
    pub minimum: f64,
    pub maximum: f64,
}

impl StatisticSet {
    /// Build a set from raw samples, or `None` when there are none.
    ///
    /// Non-finite samples still count towards `sample_count` and `sum`, but
    /// never leak into `minimum`/`maximum`.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut acc = StatisticAccumulator::default();
        for sample in samples {
            acc.add_value(*sample);
        }
        Some(acc.finish())
    }
}

/// Running count/sum/min/max used to merge samples and statistic sets
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatisticAccumulator {
    sample_count: f64,
    sum: f64,
    minimum: f64,
    maximum: f64,
}

impl Default for StatisticAccumulator {
    fn default() -> Self {
        Self {
            sample_count: 0.0,
            sum: 0.0,
            minimum: f64::INFINITY,
            maximum: f64::NEG_INFINITY,
        }
    }
}

impl StatisticAccumulator {
    pub(crate) fn add_value(&mut self, value: f64) {
        self.sample_count += 1.0;
        self.sum += value;
        self.minimum = self.minimum.min(value);
        self.maximum = self.maximum.max(value);
    }

    pub(crate) fn add_set(&mut self, set: &StatisticSet) {
        self.sample_count += set.sample_count;
        self.sum += set.sum;
        self.minimum = self.minimum.min(set.minimum);
        self.maximum = self.maximum.max(set.maximum);
    }

    pub(crate) fn add(&mut self, value: &MetricValue) {
        match value {
            MetricValue::Scalar(v) => self.add_value(*v),
            MetricValue::Statistics(set) => self.add_set(set),
        }
    }

    pub(crate) fn finish(self) -> StatisticSet {
        StatisticSet {
            sample_count: self.sample_count,
            sum: self.sum,
            minimum: finite_or_zero(self.minimum),
            maximum: finite_or_zero(self.maximum),
        }
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// The payload of a datum: exactly one of a scalar or a statistic set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    #[serde(rename = "value")]
    Scalar(f64),
    #[serde(rename = "statistic_values")]
    Statistics(StatisticSet),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Statistics(_) => None,
        }
    }

    pub fn as_statistics(&self) -> Option<&StatisticSet> {
        match self {
            MetricValue::Scalar(_) => None,
            MetricValue::Statistics(set) => Some(set),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Scalar(value)
    }
}

impl From<StatisticSet> for MetricValue {
    fn from(set: StatisticSet) -> Self {
        MetricValue::Statistics(set)
    }
}

/// One reportable data point with its full identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Datum {
    pub metric_name: String,
    pub namespace: String,
    pub unit: String,
    pub dimensions: Vec<Dimension>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub value: MetricValue,
    /// Set to 1 for high-resolution (sub-minute) storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_resolution: Option<u32>,
}

impl Datum {
    /// Dimensions sorted by name and joined as `name=value|name=value`
    pub fn dimensions_key(&self) -> String {
        let mut sorted: Vec<&Dimension> = self.dimensions.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        sorted
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("|")
    }
}
