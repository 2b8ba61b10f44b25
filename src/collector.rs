use async_trait::async_trait;
use log::{debug, info};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{ReporterError, Result};
use crate::sink::MetricSink;

/// A polled source of metrics
///
/// The worker calls `collect` once per tick; implementations report what
/// they gather through the sink. Collectors doing I/O should carry their
/// own timeouts as well, the worker only bounds the call as a whole.
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Gather metrics and report them
    async fn collect(&self, sink: &MetricSink) -> Result<()>;

    /// Get the collector name
    fn name(&self) -> &str;
}

/// A collector backed by a plain, possibly blocking, function
///
/// The function runs on the runtime's blocking pool, so a slow body never
/// stalls the worker and the collector timeout still applies. A body that
/// outlives the timeout keeps running detached until it returns.
pub struct FnCollector<F>
where
    F: Fn(&MetricSink) -> Result<()> + Send + Sync + 'static,
{
    name: String,
    collect_fn: Arc<F>,
}

impl<F> FnCollector<F>
where
    F: Fn(&MetricSink) -> Result<()> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, collect_fn: F) -> Self {
        Self {
            name: name.into(),
            collect_fn: Arc::new(collect_fn),
        }
    }
}

#[async_trait]
impl<F> Collector for FnCollector<F>
where
    F: Fn(&MetricSink) -> Result<()> + Send + Sync + 'static,
{
    async fn collect(&self, sink: &MetricSink) -> Result<()> {
        let collect_fn = Arc::clone(&self.collect_fn);
        let sink = sink.clone();
        tokio::task::spawn_blocking(move || (*collect_fn)(&sink))
            .await
            .map_err(|e| ReporterError::Collection(format!("{} did not complete: {}", self.name, e)))?
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A collector registered for an integration
#[derive(Clone)]
pub struct RegisteredCollector {
    pub integration: String,
    pub collector: Arc<dyn Collector>,
}

impl fmt::Debug for RegisteredCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredCollector")
            .field("integration", &self.integration)
            .field("collector", &self.collector.name())
            .finish()
    }
}

type RegistryResult<T> = std::result::Result<T, ReporterError>;

/// Collectors keyed by integration, polled in registration order
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: RwLock<Vec<RegisteredCollector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector, replacing any previous one for the integration
    pub fn register(
        &self,
        integration: impl Into<String>,
        collector: Arc<dyn Collector>,
    ) -> RegistryResult<()> {
        let integration = integration.into();
        let mut collectors = self
            .collectors
            .write()
            .map_err(|_| ReporterError::LockPoisoned("collector registry"))?;

        let entry = RegisteredCollector {
            integration: integration.clone(),
            collector,
        };

        match collectors.iter_mut().find(|c| c.integration == integration) {
            Some(existing) => {
                debug!("Replacing collector for integration '{}'", integration);
                *existing = entry;
            }
            None => {
                info!(
                    "Registered collector '{}' for integration '{}'",
                    entry.collector.name(),
                    integration
                );
                collectors.push(entry);
            }
        }

        Ok(())
    }

    /// Remove the collector for an integration; returns whether one existed
    pub fn unregister(&self, integration: &str) -> RegistryResult<bool> {
        let mut collectors = self
            .collectors
            .write()
            .map_err(|_| ReporterError::LockPoisoned("collector registry"))?;
        let before = collectors.len();
        collectors.retain(|c| c.integration != integration);
        Ok(collectors.len() != before)
    }

    pub fn clear(&self) -> RegistryResult<()> {
        self.collectors
            .write()
            .map_err(|_| ReporterError::LockPoisoned("collector registry"))?
            .clear();
        Ok(())
    }

    pub fn is_empty(&self) -> RegistryResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn len(&self) -> RegistryResult<usize> {
        let collectors = self
            .collectors
            .read()
            .map_err(|_| ReporterError::LockPoisoned("collector registry"))?;
        Ok(collectors.len())
    }

    /// Integrations with a registered collector
    pub fn integrations(&self) -> RegistryResult<Vec<String>> {
        let collectors = self
            .collectors
            .read()
            .map_err(|_| ReporterError::LockPoisoned("collector registry"))?;
        Ok(collectors.iter().map(|c| c.integration.clone()).collect())
    }

    /// Copy of the registered collectors, so polling does not hold the lock
    pub fn snapshot(&self) -> RegistryResult<Vec<RegisteredCollector>> {
        let collectors = self
            .collectors
            .read()
            .map_err(|_| ReporterError::LockPoisoned("collector registry"))?;
        Ok(collectors.clone())
    }
}
