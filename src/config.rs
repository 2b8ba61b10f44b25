use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::catalog;
use crate::datum::Dimension;
use crate::error::{ReporterError, Result};

/// Environment variable consulted for the default environment name
pub const ENVIRONMENT_VAR: &str = "BATCHMETRICS_ENV";

/// Prefix of environment variables that override file configuration
pub const CONFIG_ENV_PREFIX: &str = "BATCHMETRICS";

/// Unit used when a metric has no configured unit
pub const DEFAULT_UNIT: &str = "None";

/// Logging level
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// A logical source of metrics with its own namespace and allow-list
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IntegrationConfig {
    /// Integration identifier, e.g. `job_queue`
    pub name: String,
    /// Namespace override; built-in integrations fall back to their catalog namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Metric names this integration is allowed to report
    #[serde(default)]
    pub metrics: Vec<String>,
}

impl IntegrationConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            metrics: Vec::new(),
        }
    }

    /// Replace the allow-list
    pub fn with_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    /// Resolved namespace for this integration
    pub fn namespace(&self) -> &str {
        match &self.namespace {
            Some(ns) => ns,
            None => catalog::integration(&self.name)
                .map(|def| def.namespace)
                .unwrap_or(self.name.as_str()),
        }
    }

    pub fn allows(&self, metric_name: &str) -> bool {
        self.metrics.iter().any(|m| m == metric_name)
    }
}

/// Reporter configuration snapshot
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ReporterConfig {
    /// Seconds between worker ticks
    pub interval: u64,
    /// Maximum datums buffered between flushes
    pub queue_max_size: usize,
    /// Integrations in lookup order
    pub integrations: Vec<IntegrationConfig>,
    /// Unit per metric name
    pub units: HashMap<String, String>,
    /// Custom dimensions appended to every datum
    pub dimensions: Vec<Dimension>,
    /// Name of the environment this process runs in
    pub environment: String,
    /// Environments in which the reporter is allowed to run
    pub enabled_environments: Vec<String>,
    /// Seconds a single collector call may take
    pub collector_timeout: u64,
    /// Seconds `stop()` waits for the worker thread
    pub shutdown_timeout: u64,
    /// Logging level
    pub log_level: LogLevel,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval: 60,
            queue_max_size: 1000,
            integrations: default_integrations(),
            units: catalog::default_units(),
            dimensions: Vec::new(),
            environment: detect_environment(),
            enabled_environments: vec!["production".to_string()],
            collector_timeout: 10,
            shutdown_timeout: 2,
            log_level: LogLevel::default(),
        }
    }
}

fn default_integrations() -> Vec<IntegrationConfig> {
    catalog::INTEGRATIONS
        .iter()
        .map(|def| {
            IntegrationConfig::new(def.name, def.namespace)
                .with_metrics(def.default_metrics.iter().copied())
        })
        .collect()
}

fn detect_environment() -> String {
    std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string())
}

impl ReporterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_secs(self.collector_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Sub-minute intervals ask the remote side for 1-second storage resolution
    pub fn high_resolution(&self) -> bool {
        self.interval < 60
    }

    pub fn environment_enabled(&self) -> bool {
        self.enabled_environments.contains(&self.environment)
    }

    pub fn integration(&self, name: &str) -> Option<&IntegrationConfig> {
        self.integrations.iter().find(|i| i.name == name)
    }

    /// First integration whose allow-list contains the metric
    pub fn integration_for_metric(&self, metric_name: &str) -> Option<&IntegrationConfig> {
        self.integrations.iter().find(|i| i.allows(metric_name))
    }

    /// Namespace for an integration, falling back to the integration name
    pub fn namespace_for(&self, integration: &str) -> String {
        match self.integration(integration) {
            Some(int) => int.namespace().to_string(),
            None => catalog::integration(integration)
                .map(|def| def.namespace.to_string())
                .unwrap_or_else(|| integration.to_string()),
        }
    }

    pub fn metric_allowed(&self, integration: &str, metric_name: &str) -> bool {
        self.integration(integration)
            .is_some_and(|int| int.allows(metric_name))
    }

    pub fn unit_for(&self, metric_name: &str) -> &str {
        self.units
            .get(metric_name)
            .map(String::as_str)
            .unwrap_or(DEFAULT_UNIT)
    }

    /// Insert or replace an integration
    pub fn set_integration(&mut self, integration: IntegrationConfig) -> &mut Self {
        match self.integrations.iter_mut().find(|i| i.name == integration.name) {
            Some(existing) => *existing = integration,
            None => self.integrations.push(integration),
        }
        self
    }

    /// Replace the allow-list of an integration, adding it if needed
    pub fn set_metrics<I, S>(&mut self, integration: &str, metrics: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let metrics: Vec<String> = metrics.into_iter().map(Into::into).collect();
        match self.integrations.iter_mut().find(|i| i.name == integration) {
            Some(existing) => existing.metrics = metrics,
            None => self.integrations.push(IntegrationConfig {
                name: integration.to_string(),
                namespace: None,
                metrics,
            }),
        }
        self
    }

    /// Check values that would make the reporter misbehave
    pub fn validate(&self) -> std::result::Result<(), ReporterError> {
        if self.interval == 0 {
            return Err(ReporterError::Config("interval must be at least 1 second".to_string()));
        }
        if self.queue_max_size == 0 {
            return Err(ReporterError::Config("queue_max_size must be at least 1".to_string()));
        }

        let mut seen = HashSet::new();
        for integration in &self.integrations {
            if !seen.insert(integration.name.as_str()) {
                return Err(ReporterError::Config(format!(
                    "integration '{}' is configured more than once",
                    integration.name
                )));
            }
        }

        Ok(())
    }

    /// Load and validate a configuration file.
    ///
    /// `BATCHMETRICS_*` environment variables override file values, e.g.
    /// `BATCHMETRICS_INTERVAL=10`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: ReporterConfig = ConfigBuilder::new()
            .add_file(path)
            .add_env(CONFIG_ENV_PREFIX)
            .build()?;
        config.validate()?;
        Ok(config)
    }
}

/// Shared, swappable configuration snapshot
///
/// Readers take a cheap `Arc` snapshot; writers replace it whole, so a
/// reader never observes a half-applied update.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<ReporterConfig>>>,
}

impl SharedConfig {
    pub fn new(config: ReporterConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<ReporterConfig> {
        // The guarded value is swapped whole, so a poisoned lock still holds a consistent snapshot
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Apply a change on top of the current snapshot
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ReporterConfig),
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = ReporterConfig::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub fn replace(&self, config: ReporterConfig) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(config);
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(ReporterConfig::default())
    }
}

impl From<ReporterConfig> for SharedConfig {
    fn from(config: ReporterConfig) -> Self {
        Self::new(config)
    }
}

/// Source of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path (TOML format)
    File(PathBuf),
    /// Environment variables with a prefix
    Environment(String),
    /// TOML string
    Toml(String),
}

/// Load configuration from sources layered in order
pub fn load_config<T>(sources: Vec<ConfigSource>) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    let mut builder = config::Config::builder();

    for source in sources {
        match source {
            ConfigSource::File(path) => {
                if !path.exists() {
                    error!("Configuration file {} does not exist", path.display());
                    return Err(ReporterError::Config(format!(
                        "Configuration file not found: {}",
                        path.display()
                    ))
                    .into());
                }

                debug!("Loading TOML configuration from file: {}", path.display());
                builder = builder.add_source(
                    config::File::from(path.as_path()).format(config::FileFormat::Toml),
                );
            }
            ConfigSource::Environment(prefix) => {
                debug!("Loading configuration from environment with prefix: {}", prefix);
                builder = builder.add_source(
                    config::Environment::with_prefix(&prefix)
                        .prefix_separator("_")
                        .separator("__")
                        .try_parsing(true),
                );
            }
            ConfigSource::Toml(toml_str) => {
                debug!("Loading configuration from TOML string");
                builder = builder
                    .add_source(config::File::from_str(&toml_str, config::FileFormat::Toml));
            }
        }
    }

    let config = builder
        .build()
        .map_err(|e| ReporterError::Config(format!("Failed to build configuration: {}", e)))?;

    let result = config
        .try_deserialize()
        .map_err(|e| ReporterError::Config(format!("Failed to deserialize configuration: {}", e)))?;

    debug!("Configuration loaded successfully: {:?}", result);

    Ok(result)
}

/// Configuration builder
pub struct ConfigBuilder<T: for<'de> Deserialize<'de>> {
    sources: Vec<ConfigSource>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: for<'de> Deserialize<'de> + Debug> ConfigBuilder<T> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Add a TOML file source
    pub fn add_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add environment variables
    pub fn add_env(mut self, prefix: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Environment(prefix.into()));
        self
    }

    /// Add TOML string
    pub fn add_toml(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Toml(toml.into()));
        self
    }

    pub fn build(self) -> Result<T> {
        load_config::<T>(self.sources)
    }
}

impl<T: for<'de> Deserialize<'de> + Debug> Default for ConfigBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
