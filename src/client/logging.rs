use async_trait::async_trait;
use log::info;

use super::MetricsClient;
use crate::datum::Datum;
use crate::error::{ReporterError, Result};

/// A client that writes every batch to the log as JSON
pub struct LogClient {
    name: String,
}

impl LogClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogClient {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl MetricsClient for LogClient {
    async fn put_metric_data(&self, namespace: &str, data: &[Datum]) -> Result<()> {
        let body = serde_json::to_string(data)
            .map_err(|e| ReporterError::Transport(format!("Failed to encode batch: {}", e)))?;
        info!("[{}] {} datum(s) for {}: {}", self.name, data.len(), namespace, body);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
