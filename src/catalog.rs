//! Built-in catalog of the metrics each integration knows how to report
use std::collections::HashMap;

/// A known metric and the unit it is reported in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDefinition {
    pub name: &'static str,
    pub unit: &'static str,
    pub description: &'static str,
}

/// A built-in integration with its default namespace and allow-list
#[derive(Debug, Clone, Copy)]
pub struct IntegrationDefinition {
    pub name: &'static str,
    pub namespace: &'static str,
    /// Metrics enabled when the configuration does not say otherwise
    pub default_metrics: &'static [&'static str],
    pub metrics: &'static [MetricDefinition],
}

pub const WEB_SERVER: &str = "web_server";
pub const JOB_QUEUE: &str = "job_queue";
pub const REQUEST: &str = "request";
pub const JOB: &str = "job";

const fn metric(
    name: &'static str,
    unit: &'static str,
    description: &'static str,
) -> MetricDefinition {
    MetricDefinition {
        name,
        unit,
        description,
    }
}

/// Integrations in lookup order: when two integrations allow the same
/// metric name, the earlier one owns it.
pub const INTEGRATIONS: &[IntegrationDefinition] = &[
    IntegrationDefinition {
        name: WEB_SERVER,
        namespace: "WebServer",
        default_metrics: &[],
        metrics: &[
            metric("Workers", "Count", "Worker processes configured for the server"),
            metric("BootedWorkers", "Count", "Worker processes booted and ready for requests"),
            metric("OldWorkers", "Count", "Worker processes being phased out during a restart"),
            metric("Running", "Count", "Threads currently processing requests"),
            metric("Backlog", "Count", "Requests waiting for a free thread"),
            metric("PoolCapacity", "Count", "Threads available for new requests"),
            metric("MaxThreads", "Count", "Configured maximum threads per worker"),
        ],
    },
    IntegrationDefinition {
        name: JOB_QUEUE,
        namespace: "JobQueue",
        default_metrics: &["QueueLatency"],
        metrics: &[
            metric("EnqueuedJobs", "Count", "Jobs enqueued across all queues"),
            metric("ProcessedJobs", "Count", "Jobs processed since the queue started"),
            metric("FailedJobs", "Count", "Jobs failed since the queue started"),
            metric("ScheduledJobs", "Count", "Jobs scheduled to run in the future"),
            metric("RetryJobs", "Count", "Failed jobs waiting for another attempt"),
            metric("DeadJobs", "Count", "Jobs that exhausted every retry"),
            metric("Workers", "Count", "Worker threads busy across all processes"),
            metric("Processes", "Count", "Queue server processes running"),
            metric("DefaultQueueLatency", "Seconds", "Age of the oldest job in the default queue"),
            metric("Capacity", "Count", "Worker threads available across all processes"),
            metric("Utilization", "Percent", "Average share of busy worker threads"),
            metric("QueueLatency", "Seconds", "Age of the oldest job in a queue"),
            metric("QueueSize", "Count", "Jobs waiting in a queue"),
        ],
    },
    IntegrationDefinition {
        name: REQUEST,
        namespace: "Request",
        default_metrics: &["RequestQueueTime"],
        metrics: &[metric(
            "RequestQueueTime",
            "Milliseconds",
            "Time a request waited in the proxy before reaching the application",
        )],
    },
    IntegrationDefinition {
        name: JOB,
        namespace: "Job",
        default_metrics: &["QueueLatency"],
        metrics: &[metric(
            "QueueLatency",
            "Seconds",
            "Time a job waited in its queue before execution started",
        )],
    },
];

/// Look up a built-in integration by name
pub fn integration(name: &str) -> Option<&'static IntegrationDefinition> {
    INTEGRATIONS.iter().find(|i| i.name == name)
}

/// Units for every catalogued metric, keyed by metric name
pub fn default_units() -> HashMap<String, String> {
    INTEGRATIONS
        .iter()
        .flat_map(|i| i.metrics.iter())
        .map(|m| (m.name.to_string(), m.unit.to_string()))
        .collect()
}
