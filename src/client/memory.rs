use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::RwLock;

use super::MetricsClient;
use crate::datum::Datum;
use crate::error::{ReporterError, Result};

/// One recorded `put_metric_data` call
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub namespace: String,
    pub data: Vec<Datum>,
    pub at: DateTime<Utc>,
}

/// A client that records calls instead of sending them
#[derive(Default)]
pub struct MemoryClient {
    calls: RwLock<Vec<RecordedCall>>,
    failing: RwLock<HashSet<String>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call for a namespace fail
    pub fn fail_namespace(&self, namespace: impl Into<String>) -> Result<()> {
        self.failing
            .write()
            .map_err(|_| ReporterError::LockPoisoned("memory client"))?
            .insert(namespace.into());
        Ok(())
    }

    /// All successful calls, oldest first
    pub fn calls(&self) -> Result<Vec<RecordedCall>> {
        let calls = self
            .calls
            .read()
            .map_err(|_| ReporterError::LockPoisoned("memory client"))?;
        Ok(calls.clone())
    }

    /// Total datums received
    pub fn metric_count(&self) -> Result<usize> {
        Ok(self.calls()?.iter().map(|c| c.data.len()).sum())
    }

    /// Datums with a given name, optionally restricted to one namespace
    pub fn find_metrics(&self, metric_name: &str, namespace: Option<&str>) -> Result<Vec<Datum>> {
        Ok(self
            .calls()?
            .into_iter()
            .filter(|c| namespace.is_none_or(|ns| c.namespace == ns))
            .flat_map(|c| c.data)
            .filter(|d| d.metric_name == metric_name)
            .collect())
    }

    pub fn metrics_for_namespace(&self, namespace: &str) -> Result<Vec<Datum>> {
        Ok(self
            .calls()?
            .into_iter()
            .filter(|c| c.namespace == namespace)
            .flat_map(|c| c.data)
            .collect())
    }

    /// Forget recorded calls
    pub fn reset(&self) -> Result<()> {
        self.calls
            .write()
            .map_err(|_| ReporterError::LockPoisoned("memory client"))?
            .clear();
        Ok(())
    }
}

#[async_trait]
impl MetricsClient for MemoryClient {
    async fn put_metric_data(&self, namespace: &str, data: &[Datum]) -> Result<()> {
        let failing = self
            .failing
            .read()
            .map_err(|_| ReporterError::LockPoisoned("memory client"))?
            .contains(namespace);
        if failing {
            return Err(ReporterError::Transport(format!("namespace {} rejected", namespace)).into());
        }

        self.calls
            .write()
            .map_err(|_| ReporterError::LockPoisoned("memory client"))?
            .push(RecordedCall {
                namespace: namespace.to_string(),
                data: data.to_vec(),
                at: Utc::now(),
            });
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
