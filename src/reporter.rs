use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::Notify;

use crate::aggregator::MetricAggregator;
use crate::builder::MetricReport;
use crate::client::{MAX_DATUMS_PER_CALL, MetricsClient};
use crate::collector::{Collector, CollectorRegistry};
use crate::config::SharedConfig;
use crate::datum::Datum;
use crate::error::ReporterError;
use crate::process::{OsProcess, ProcessIdentity};
use crate::queue::MetricQueue;
use crate::sink::MetricSink;

/// Name given to the background worker thread
pub const WORKER_THREAD_NAME: &str = "batchmetrics-reporter";

/// Outcome of one flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    /// Datums drained from the queue
    pub drained: usize,
    /// Datums handed to the client after aggregation
    pub sent: usize,
    /// Successful remote calls
    pub batches: usize,
    /// Remote calls that failed
    pub failed_batches: usize,
    /// Datums lost to a failed call, including the unsent rest of its namespace
    pub dropped: usize,
}

/// State the worker thread shares with the reporter
struct Shared {
    config: SharedConfig,
    sink: MetricSink,
    queue: Arc<MetricQueue>,
    aggregator: MetricAggregator,
    collectors: CollectorRegistry,
    client: Arc<dyn MetricsClient>,
}

impl Shared {
    /// Poll every registered collector once.
    ///
    /// Each collector runs as its own task, bounded by `collector_timeout`;
    /// a failing collector is logged and the rest still run.
    async fn collect_all(&self) {
        let collectors = match self.collectors.snapshot() {
            Ok(collectors) => collectors,
            Err(e) => {
                error!("Failed to read collectors: {}", e);
                return;
            }
        };

        let timeout = self.config.snapshot().collector_timeout();

        for entry in collectors {
            let name = entry.collector.name().to_string();
            let collector = Arc::clone(&entry.collector);
            let sink = self.sink.clone();
            let task = tokio::spawn(async move { collector.collect(&sink).await });
            let abort = task.abort_handle();

            let outcome = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result.map_err(|e| ReporterError::Collection(format!("{:#}", e))),
                Ok(Err(e)) => Err(ReporterError::Worker(format!("collector task aborted: {}", e))),
                Err(_) => {
                    abort.abort();
                    Err(ReporterError::Timeout(format!("no result after {:?}", timeout)))
                }
            };

            match outcome {
                Ok(()) => trace!("Collector '{}' finished", name),
                Err(e) => error!("Collector '{}' for {} failed: {}", name, entry.integration, e),
            }
        }
    }

    /// Report queue overflow since the last check as a single warning
    fn log_overflow(&self) -> u64 {
        match self.queue.dropped_since_last_check() {
            Ok(0) => 0,
            Ok(dropped) => {
                let max_size = self.queue.max_size().unwrap_or_default();
                warn!(
                    "Metric queue overflowed: dropped {} oldest metric(s) (max queue size: {})",
                    dropped, max_size
                );
                dropped
            }
            Err(e) => {
                error!("Failed to read dropped metric count: {}", e);
                0
            }
        }
    }

    /// Drain the queue and ship it, one namespace at a time.
    ///
    /// A failed call drops the rest of its namespace for this flush.
    async fn flush(&self) -> FlushSummary {
        self.log_overflow();

        let mut summary = FlushSummary::default();
        let drained = match self.queue.drain() {
            Ok(Some(drained)) => drained,
            Ok(None) => return summary,
            Err(e) => {
                error!("Failed to drain metric queue: {}", e);
                return summary;
            }
        };
        summary.drained = drained.len();

        let high_resolution = self.config.snapshot().high_resolution();

        for (namespace, datums) in group_by_namespace(drained) {
            debug!("Sending {} metrics to namespace {}", datums.len(), namespace);

            let mut aggregated = self.aggregator.aggregate(datums);
            if high_resolution {
                for datum in &mut aggregated {
                    datum.storage_resolution = Some(1);
                }
            }

            let mut remaining = aggregated.len();
            for batch in aggregated.chunks(MAX_DATUMS_PER_CALL) {
                match self.client.put_metric_data(&namespace, batch).await {
                    Ok(()) => {
                        summary.batches += 1;
                        summary.sent += batch.len();
                        remaining -= batch.len();
                    }
                    Err(e) => {
                        // Move on to the next namespace; nothing is retried
                        summary.failed_batches += 1;
                        summary.dropped += remaining;
                        error!(
                            "Failed to send {} metrics to namespace {} via {}, dropping {}: {:#}",
                            batch.len(),
                            namespace,
                            self.client.name(),
                            remaining,
                            e
                        );
                        break;
                    }
                }
            }
        }

        summary
    }
}

/// Split datums by namespace, keeping namespaces in first-seen order
fn group_by_namespace(datums: Vec<Datum>) -> Vec<(String, Vec<Datum>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<Datum>)> = Vec::new();

    for datum in datums {
        match index.get(&datum.namespace) {
            Some(&i) => groups[i].1.push(datum),
            None => {
                index.insert(datum.namespace.clone(), groups.len());
                groups.push((datum.namespace.clone(), vec![datum]));
            }
        }
    }

    groups
}

/// Handle on a running worker thread
struct WorkerHandle {
    thread: JoinHandle<()>,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    /// Disconnects when the worker thread exits
    done: mpsc::Receiver<()>,
}

impl WorkerHandle {
    fn alive(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.thread.is_finished()
    }

    fn signal_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake.notify_one();
    }
}

struct Lifecycle {
    /// Pid of the process that owns the worker and buffered metrics
    pid: u32,
    worker: Option<WorkerHandle>,
}

/// Background engine that polls collectors and ships aggregated metrics
///
/// Producers call [`Reporter::report`] from any thread; the first accepted
/// metric starts the worker. The worker wakes every `interval`, polls the
/// registered collectors, then drains the queue and sends it to the client
/// in batches of at most [`MAX_DATUMS_PER_CALL`]. Delivery is best effort:
/// a failed batch is logged and dropped.
pub struct Reporter {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    process: Arc<dyn ProcessIdentity>,
    spawned_workers: AtomicU64,
    /// Set once "no collectors" has been logged for the current idle period
    idle_announced: AtomicBool,
}

impl Reporter {
    /// Create a reporter for this process
    pub fn new(config: impl Into<SharedConfig>, client: Arc<dyn MetricsClient>) -> Self {
        Self::with_process(config, client, Arc::new(OsProcess))
    }

    /// Create a reporter with an explicit process identity
    pub fn with_process(
        config: impl Into<SharedConfig>,
        client: Arc<dyn MetricsClient>,
        process: Arc<dyn ProcessIdentity>,
    ) -> Self {
        let config = config.into();
        let snapshot = config.snapshot();
        let queue = Arc::new(MetricQueue::new(snapshot.queue_max_size));
        let sink = MetricSink::new(config.clone(), Arc::clone(&queue));
        let pid = process.current_pid();

        Self {
            shared: Arc::new(Shared {
                config,
                sink,
                queue,
                aggregator: MetricAggregator::new(),
                collectors: CollectorRegistry::new(),
                client,
            }),
            lifecycle: Mutex::new(Lifecycle { pid, worker: None }),
            process,
            spawned_workers: AtomicU64::new(0),
            idle_announced: AtomicBool::new(false),
        }
    }

    fn lock_lifecycle(&self) -> Option<MutexGuard<'_, Lifecycle>> {
        match self.lifecycle.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                error!("Reporter lifecycle lock poisoned");
                None
            }
        }
    }

    fn is_started(&self, lifecycle: &Lifecycle) -> bool {
        lifecycle.pid == self.process.current_pid()
            && lifecycle.worker.as_ref().is_some_and(WorkerHandle::alive)
    }

    /// Whether the worker is running in this process
    pub fn started(&self) -> bool {
        self.lock_lifecycle()
            .is_some_and(|lifecycle| self.is_started(&lifecycle))
    }

    /// Drop state inherited from a parent process.
    ///
    /// The parent's worker thread does not exist in a forked child, and its
    /// collectors and buffered metrics belong to the parent.
    fn discard_if_forked(&self, lifecycle: &mut Lifecycle) {
        let current = self.process.current_pid();
        if lifecycle.pid == current {
            return;
        }

        info!(
            "Fork detected (pid {} -> {}), discarding inherited collectors and metrics",
            lifecycle.pid, current
        );

        // Detach without joining: the thread belongs to the parent
        if let Some(worker) = lifecycle.worker.take() {
            worker.signal_stop();
        }
        if let Err(e) = self.shared.collectors.clear() {
            error!("Failed to clear inherited collectors: {}", e);
        }
        if let Err(e) = self.shared.queue.clear() {
            error!("Failed to clear inherited metrics: {}", e);
        }
        // The parent's overflow is not the child's to report
        if let Err(e) = self.shared.queue.dropped_since_last_check() {
            error!("Failed to reset inherited drop count: {}", e);
        }
        lifecycle.pid = current;
    }

    /// Start the worker thread if it is not already running
    pub fn start(&self) {
        let Some(mut lifecycle) = self.lock_lifecycle() else {
            return;
        };

        if self.is_started(&lifecycle) {
            return;
        }

        let config = self.shared.config.snapshot();
        if !config.environment_enabled() {
            info!(
                "Environment '{}' is not enabled, not starting reporter",
                config.environment
            );
            return;
        }

        self.discard_if_forked(&mut lifecycle);

        // A worker that is registered but not alive has exited on its own
        if let Some(stale) = lifecycle.worker.take() {
            stale.signal_stop();
            if stale.thread.is_finished() && stale.thread.join().is_err() {
                warn!("Previous reporter thread panicked");
            }
        }

        match self.shared.collectors.is_empty() {
            Ok(false) => {}
            Ok(true) => {
                if self.first_idle_notice() {
                    info!("No collectors registered, not starting reporter");
                } else {
                    trace!("No collectors registered, reporter stays idle");
                }
                return;
            }
            Err(e) => {
                error!("Failed to read collectors: {}", e);
                return;
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let spawned = {
            let shared = Arc::clone(&self.shared);
            let running = Arc::clone(&running);
            let wake = Arc::clone(&wake);
            thread::Builder::new()
                .name(WORKER_THREAD_NAME.to_string())
                .spawn(move || {
                    let _done = done_tx;
                    run_loop(shared, running, wake);
                })
        };

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                error!("Failed to spawn reporter thread: {}", e);
                return;
            }
        };

        info!(
            "Starting metric reporter (interval: {}s, collectors: {})",
            config.interval,
            self.shared
                .collectors
                .integrations()
                .map(|names| names.join(", "))
                .unwrap_or_default()
        );

        lifecycle.pid = self.process.current_pid();
        lifecycle.worker = Some(WorkerHandle {
            thread,
            running,
            wake,
            done: done_rx,
        });
        self.spawned_workers.fetch_add(1, Ordering::Relaxed);
        self.idle_announced.store(false, Ordering::Relaxed);
    }

    /// True the first time the reporter is found idle since the last
    /// registration or start
    fn first_idle_notice(&self) -> bool {
        !self.idle_announced.swap(true, Ordering::Relaxed)
    }

    /// Stop the worker, flushing what is queued.
    ///
    /// Waits up to `shutdown_timeout` for the worker to exit; after that the
    /// thread is left detached.
    pub fn stop(&self) {
        let (worker, forked) = {
            let Some(mut lifecycle) = self.lock_lifecycle() else {
                return;
            };
            let Some(worker) = lifecycle.worker.take() else {
                return;
            };

            info!("Stopping metric reporter");
            worker.signal_stop();
            if let Err(e) = self.shared.collectors.clear() {
                error!("Failed to clear collectors: {}", e);
            }
            (worker, lifecycle.pid != self.process.current_pid())
        };

        // A parent's worker never exits in a forked child
        if forked {
            return;
        }

        let timeout = self.shared.config.snapshot().shutdown_timeout();
        match worker.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("Reporter thread did not finish within {:?}", timeout);
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    error!("Reporter thread panicked");
                } else {
                    info!("Reporter thread stopped gracefully");
                }
            }
        }
    }

    /// Build and enqueue a metric, starting the worker if needed.
    ///
    /// Returns whether the metric was queued. Never fails.
    pub fn report(&self, report: MetricReport) -> bool {
        if let Some(mut lifecycle) = self.lock_lifecycle() {
            self.discard_if_forked(&mut lifecycle);
        }

        let queued = self.shared.sink.report(report);
        if queued && !self.started() {
            self.start();
        }
        queued
    }

    /// Report a scalar value with no dimensions
    pub fn report_value(&self, metric_name: impl Into<String>, value: f64) -> bool {
        self.report(MetricReport::new(metric_name, value))
    }

    /// Register the collector for an integration
    pub fn register_collector(
        &self,
        integration: impl Into<String>,
        collector: Arc<dyn Collector>,
    ) {
        if let Some(mut lifecycle) = self.lock_lifecycle() {
            self.discard_if_forked(&mut lifecycle);
        }
        if let Err(e) = self.shared.collectors.register(integration, collector) {
            error!("Failed to register collector: {}", e);
            return;
        }
        self.idle_announced.store(false, Ordering::Relaxed);
    }

    /// Remove the collector for an integration
    pub fn unregister_collector(&self, integration: &str) -> bool {
        self.shared
            .collectors
            .unregister(integration)
            .unwrap_or_else(|e| {
                error!("Failed to unregister collector: {}", e);
                false
            })
    }

    /// Poll every registered collector once on the caller's runtime
    pub async fn collect_now(&self) {
        self.shared.collect_all().await;
    }

    /// Drain and send everything queued right now
    pub async fn flush_now(&self) -> FlushSummary {
        self.shared.flush().await
    }

    /// Log and reset the overflow counter; returns the number dropped
    pub fn log_overflow(&self) -> u64 {
        self.shared.log_overflow()
    }

    /// Drop queued metrics and registered collectors
    pub fn clear_all(&self) {
        if let Err(e) = self.shared.queue.clear() {
            error!("Failed to clear metric queue: {}", e);
        }
        if let Err(e) = self.shared.collectors.clear() {
            error!("Failed to clear collectors: {}", e);
        }
    }

    pub fn queue(&self) -> &MetricQueue {
        &self.shared.queue
    }

    pub fn sink(&self) -> &MetricSink {
        &self.shared.sink
    }

    pub fn config(&self) -> &SharedConfig {
        &self.shared.config
    }

    /// Integrations with a registered collector
    pub fn collectors(&self) -> Vec<String> {
        self.shared.collectors.integrations().unwrap_or_default()
    }

    /// Number of worker threads spawned over the reporter's life
    pub fn worker_spawns(&self) -> u64 {
        self.spawned_workers.load(Ordering::Relaxed)
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: Arc<Shared>, running: Arc<AtomicBool>, wake: Arc<Notify>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build reporter runtime: {}", e);
            return;
        }
    };

    runtime.block_on(async {
        while running.load(Ordering::Acquire) {
            let interval = shared.config.snapshot().interval().max(Duration::from_secs(1));
            // Either the interval elapses or stop() wakes us
            let _ = tokio::time::timeout(interval, wake.notified()).await;

            if !running.load(Ordering::Acquire) {
                break;
            }

            shared.collect_all().await;
            let summary = shared.flush().await;
            trace!("Reporter tick finished: {:?}", summary);
        }

        let summary = shared.flush().await;
        debug!("Final flush before exit: {:?}", summary);
    });

    // Timed-out blocking collectors may still be running; do not wait for them
    runtime.shutdown_background();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryClient;
    use crate::collector::FnCollector;
    use crate::config::ReporterConfig;
    use crate::datum::MetricValue;
    use crate::process::SimulatedProcess;
    use std::sync::Barrier;
    use std::time::Instant;

    struct Fixture {
        reporter: Arc<Reporter>,
        client: Arc<MemoryClient>,
        process: Arc<SimulatedProcess>,
    }

    fn test_config() -> ReporterConfig {
        let mut config = ReporterConfig::default();
        config.environment = "test".to_string();
        config.enabled_environments = vec!["test".to_string()];
        config.set_integration(
            crate::config::IntegrationConfig::new("test", "TestApp")
                .with_metrics(["test_metric", "another_metric", "metric1", "metric2"]),
        );
        config
    }

    fn fixture(config: ReporterConfig) -> Fixture {
        let client = Arc::new(MemoryClient::new());
        let process = Arc::new(SimulatedProcess::new(1000));
        let reporter = Arc::new(Reporter::with_process(
            config,
            client.clone(),
            process.clone(),
        ));
        Fixture {
            reporter,
            client,
            process,
        }
    }

    fn noop_collector() -> Arc<dyn Collector> {
        Arc::new(FnCollector::new("noop", |_| Ok(())))
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    fn test_not_started_before_start() {
        let f = fixture(test_config());
        assert!(!f.reporter.started());
    }

    #[test]
    fn test_start_without_collectors_stays_idle() {
        let f = fixture(test_config());
        f.reporter.start();
        assert!(!f.reporter.started());
        assert_eq!(f.reporter.worker_spawns(), 0);
    }

    #[test]
    fn test_start_and_stop() {
        let f = fixture(test_config());
        f.reporter.register_collector("test", noop_collector());

        f.reporter.start();
        assert!(f.reporter.started());

        f.reporter.stop();
        assert!(!f.reporter.started());
        assert!(f.reporter.collectors().is_empty());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let f = fixture(test_config());
        f.reporter.stop();
        assert!(!f.reporter.started());
    }

    #[test]
    fn test_start_is_idempotent() {
        let f = fixture(test_config());
        f.reporter.register_collector("test", noop_collector());

        f.reporter.start();
        f.reporter.start();

        assert_eq!(f.reporter.worker_spawns(), 1);
    }

    #[test]
    fn test_concurrent_start_spawns_one_worker() {
        let f = fixture(test_config());
        f.reporter.register_collector("test", noop_collector());

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reporter = Arc::clone(&f.reporter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    reporter.start();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(f.reporter.started());
        assert_eq!(f.reporter.worker_spawns(), 1);
    }

    #[test]
    fn test_report_starts_lazily() {
        let f = fixture(test_config());
        f.reporter.register_collector("test", noop_collector());
        assert!(!f.reporter.started());

        assert!(f.reporter.report_value("metric1", 1.0));
        assert!(f.reporter.started());

        f.reporter.report_value("metric2", 2.0);
        assert_eq!(f.reporter.worker_spawns(), 1);
    }

    #[test]
    fn test_rejected_report_does_not_start() {
        let f = fixture(test_config());
        f.reporter.register_collector("test", noop_collector());

        assert!(!f.reporter.report_value("unknown_metric", 1.0));
        assert!(!f.reporter.started());
    }

    #[test]
    fn test_simulated_fork_is_not_started() {
        let f = fixture(test_config());
        f.reporter.register_collector("test", noop_collector());
        f.reporter.start();
        assert!(f.reporter.started());

        f.process.fork_into(2000);
        assert!(!f.reporter.started());
    }

    #[test]
    fn test_fork_discards_inherited_queue_and_collectors() {
        let f = fixture(test_config());
        f.reporter.sink().report_value("metric1", 1.0);
        f.reporter.sink().report_value("metric2", 2.0);
        f.reporter.register_collector("test", noop_collector());
        assert_eq!(f.reporter.queue().len().unwrap(), 2);

        f.process.fork_into(2000);
        f.reporter.start();

        assert!(f.reporter.queue().is_empty().unwrap());
        assert!(f.reporter.collectors().is_empty());
        assert!(!f.reporter.started());
    }

    #[test]
    fn test_child_can_restart_after_fork() {
        let f = fixture(test_config());
        f.reporter.register_collector("test", noop_collector());
        f.reporter.start();

        f.process.fork_into(2000);
        f.reporter.register_collector("test", noop_collector());
        f.reporter.start();

        assert!(f.reporter.started());
        assert_eq!(f.reporter.worker_spawns(), 2);
        assert_eq!(f.reporter.collectors(), vec!["test".to_string()]);
    }

    #[test]
    fn test_disabled_environment() {
        let mut config = test_config();
        config.environment = "development".to_string();
        let f = fixture(config);
        f.reporter.register_collector("test", noop_collector());

        f.reporter.start();
        assert!(!f.reporter.started());

        assert!(!f.reporter.report_value("test_metric", 42.0));
        assert!(f.reporter.queue().is_empty().unwrap());
    }

    #[test]
    fn test_unknown_and_disallowed_metrics_never_queue() {
        let f = fixture(test_config());
        f.reporter.report_value("not_configured", 1.0);
        f.reporter
            .report(MetricReport::new("Workers", 4.0).with_integration("web_server"));
        f.reporter.report_value("Workers", 4.0);

        assert!(f.reporter.queue().is_empty().unwrap());
    }

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        let mut config = test_config();
        config.queue_max_size = 3;
        let f = fixture(config);

        for i in 1..=4 {
            f.reporter.report_value("test_metric", i as f64);
        }

        let values: Vec<f64> = f
            .reporter
            .queue()
            .snapshot()
            .unwrap()
            .iter()
            .filter_map(|d| d.value.as_scalar())
            .collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_overflow_logging_resets_counter() {
        let mut config = test_config();
        config.queue_max_size = 2;
        let f = fixture(config);

        for i in 0..5 {
            f.reporter.report_value("test_metric", i as f64);
        }

        assert_eq!(f.reporter.log_overflow(), 3);
        assert_eq!(f.reporter.log_overflow(), 0);
    }

    #[tokio::test]
    async fn test_flush_end_to_end_with_overflow() {
        let mut config = test_config();
        config.queue_max_size = 5;
        let f = fixture(config);

        for i in 0..6 {
            f.reporter.report_value("test_metric", i as f64);
        }

        let summary = f.reporter.flush_now().await;
        assert_eq!(summary.drained, 5);
        assert_eq!(summary.batches, 1);

        let calls = f.client.calls().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].namespace, "TestApp");
        assert_eq!(calls[0].data.len(), 1);

        let stats = calls[0].data[0].value.as_statistics().unwrap();
        assert_eq!(stats.sample_count, 5.0);
        assert_eq!(stats.sum, 15.0);
        assert_eq!(stats.minimum, 1.0);
        assert_eq!(stats.maximum, 5.0);
    }

    #[tokio::test]
    async fn test_flush_splits_into_batches_of_twenty() {
        let f = fixture(test_config());
        for i in 0..45 {
            f.reporter
                .report(MetricReport::new("test_metric", 1.0).with_dimension("Index", i));
        }

        let summary = f.reporter.flush_now().await;
        assert_eq!(summary.sent, 45);

        let sizes: Vec<usize> = f
            .client
            .calls()
            .unwrap()
            .iter()
            .map(|c| c.data.len())
            .collect();
        assert_eq!(sizes, vec![20, 20, 5]);
    }

    #[tokio::test]
    async fn test_flush_groups_by_namespace() {
        let f = fixture(test_config());
        f.reporter.report_value("test_metric", 1.0);
        f.reporter.report_value("QueueLatency", 2.5);
        f.reporter
            .report(MetricReport::new("metric1", 3.0).with_namespace("Override"));

        f.reporter.flush_now().await;

        let namespaces: Vec<String> = f
            .client
            .calls()
            .unwrap()
            .into_iter()
            .map(|c| c.namespace)
            .collect();
        assert_eq!(namespaces, vec!["TestApp", "JobQueue", "Override"]);
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_not_retried() {
        let f = fixture(test_config());
        f.client.fail_namespace("TestApp").unwrap();

        f.reporter.report_value("test_metric", 1.0);
        f.reporter.report_value("QueueLatency", 2.0);

        let summary = f.reporter.flush_now().await;
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.batches, 1);
        assert_eq!(f.client.metrics_for_namespace("JobQueue").unwrap().len(), 1);
        assert!(f.reporter.queue().is_empty().unwrap());

        // Nothing is re-sent on the next flush
        let summary = f.reporter.flush_now().await;
        assert_eq!(summary, FlushSummary::default());
    }

    #[tokio::test]
    async fn test_high_resolution_storage() {
        let mut config = test_config();
        config.interval = 10;
        let f = fixture(config);

        f.reporter.report_value("test_metric", 1.0);
        f.reporter.flush_now().await;

        let sent = f.client.find_metrics("test_metric", None).unwrap();
        assert_eq!(sent[0].storage_resolution, Some(1));
    }

    #[tokio::test]
    async fn test_standard_resolution_by_default() {
        let f = fixture(test_config());
        f.reporter.report_value("test_metric", 1.0);
        f.reporter.flush_now().await;

        let sent = f.client.find_metrics("test_metric", None).unwrap();
        assert_eq!(sent[0].storage_resolution, None);
    }

    #[tokio::test]
    async fn test_failing_collector_does_not_stop_others() {
        let f = fixture(test_config());
        f.reporter.register_collector(
            "broken",
            Arc::new(FnCollector::new("broken", |_| {
                Err(anyhow::anyhow!("collector exploded"))
            })),
        );
        f.reporter.register_collector(
            "panicking",
            Arc::new(FnCollector::new("panicking", |_| panic!("collector panicked"))),
        );
        f.reporter.register_collector(
            "test",
            Arc::new(FnCollector::new("healthy", |sink| {
                sink.report_value("test_metric", 7.0);
                Ok(())
            })),
        );

        f.reporter.collect_now().await;

        let queued = f.reporter.queue().snapshot().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].value, MetricValue::Scalar(7.0));
    }

    #[tokio::test]
    async fn test_hung_collector_times_out() {
        struct Hung;

        #[async_trait::async_trait]
        impl Collector for Hung {
            async fn collect(&self, _sink: &MetricSink) -> crate::error::Result<()> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }

            fn name(&self) -> &str {
                "hung"
            }
        }

        let mut config = test_config();
        config.collector_timeout = 1;
        let f = fixture(config);
        f.reporter.register_collector("hung", Arc::new(Hung));
        f.reporter.register_collector(
            "test",
            Arc::new(FnCollector::new("healthy", |sink| {
                sink.report_value("test_metric", 1.0);
                Ok(())
            })),
        );

        let started = Instant::now();
        f.reporter.collect_now().await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(f.reporter.queue().len().unwrap(), 1);
    }

    #[test]
    fn test_stop_flushes_queued_metrics() {
        let f = fixture(test_config());
        f.reporter.register_collector("test", noop_collector());

        f.reporter.report_value("test_metric", 42.0);
        assert!(f.reporter.started());

        f.reporter.stop();

        let sent = f.client.find_metrics("test_metric", Some("TestApp")).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].value, MetricValue::Scalar(42.0));
    }

    #[test]
    fn test_worker_polls_collectors_every_interval() {
        let mut config = test_config();
        config.interval = 1;
        let f = fixture(config);
        f.reporter.register_collector(
            "test",
            Arc::new(FnCollector::new("ticker", |sink| {
                sink.report_value("test_metric", 1.0);
                Ok(())
            })),
        );

        f.reporter.start();
        let delivered = wait_until(Duration::from_secs(5), || {
            f.client.metric_count().unwrap_or_default() > 0
        });
        f.reporter.stop();

        assert!(delivered);
    }

    #[test]
    fn test_idle_notice_once_per_idle_period() {
        let f = fixture(test_config());
        for i in 0..100 {
            f.reporter.report_value("test_metric", i as f64);
        }
        assert!(!f.reporter.started());
        // Every report tried to start; only the first one announced it
        assert!(!f.reporter.first_idle_notice());

        f.reporter.register_collector("test", noop_collector());
        f.reporter.unregister_collector("test");
        assert!(f.reporter.first_idle_notice());
        assert!(!f.reporter.first_idle_notice());
    }

    #[tokio::test]
    async fn test_blocking_collector_times_out() {
        let mut config = test_config();
        config.collector_timeout = 1;
        let f = fixture(config);
        f.reporter.register_collector(
            "blocking",
            Arc::new(FnCollector::new("blocking", |_| {
                thread::sleep(Duration::from_secs(3));
                Ok(())
            })),
        );
        f.reporter.register_collector(
            "test",
            Arc::new(FnCollector::new("healthy", |sink| {
                sink.report_value("test_metric", 1.0);
                Ok(())
            })),
        );

        let started = Instant::now();
        f.reporter.collect_now().await;

        assert!(started.elapsed() < Duration::from_millis(2500));
        assert_eq!(f.reporter.queue().len().unwrap(), 1);
    }

    #[test]
    fn test_stop_gives_up_after_shutdown_timeout() {
        struct Slow {
            entered: Arc<AtomicBool>,
        }

        #[async_trait::async_trait]
        impl Collector for Slow {
            async fn collect(&self, _sink: &MetricSink) -> crate::error::Result<()> {
                self.entered.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }

            fn name(&self) -> &str {
                "slow"
            }
        }

        let mut config = test_config();
        config.interval = 1;
        config.collector_timeout = 10;
        config.shutdown_timeout = 1;
        let f = fixture(config);
        let entered = Arc::new(AtomicBool::new(false));
        f.reporter.register_collector(
            "test",
            Arc::new(Slow {
                entered: Arc::clone(&entered),
            }),
        );

        f.reporter.start();
        assert!(wait_until(Duration::from_secs(5), || entered.load(Ordering::SeqCst)));

        let stopping = Instant::now();
        f.reporter.stop();
        let elapsed = stopping.elapsed();

        assert!(elapsed >= Duration::from_millis(900));
        assert!(elapsed < Duration::from_secs(3));
        assert!(!f.reporter.started());
    }

    #[tokio::test]
    async fn test_failed_call_drops_rest_of_namespace() {
        let f = fixture(test_config());
        f.client.fail_namespace("TestApp").unwrap();

        for i in 0..45 {
            f.reporter
                .report(MetricReport::new("test_metric", 1.0).with_dimension("Index", i));
        }
        f.reporter.report_value("QueueLatency", 1.0);

        let summary = f.reporter.flush_now().await;
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.dropped, 45);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(f.client.metrics_for_namespace("JobQueue").unwrap().len(), 1);
    }

    #[test]
    fn test_fork_resets_inherited_drop_count() {
        let mut config = test_config();
        config.queue_max_size = 2;
        let f = fixture(config);
        for i in 0..5 {
            f.reporter.sink().report_value("test_metric", i as f64);
        }

        f.process.fork_into(2000);
        f.reporter.report_value("test_metric", 9.0);

        assert_eq!(f.reporter.log_overflow(), 0);
        assert_eq!(f.reporter.queue().len().unwrap(), 1);
    }

    #[test]
    fn test_unregister_collector() {
        let f = fixture(test_config());
        f.reporter.register_collector("test", noop_collector());
        assert!(f.reporter.unregister_collector("test"));
        assert!(!f.reporter.unregister_collector("test"));

        f.reporter.start();
        assert!(!f.reporter.started());
    }

    #[test]
    fn test_group_by_namespace_keeps_first_seen_order() {
        let datum = |ns: &str| Datum {
            metric_name: "m".to_string(),
            namespace: ns.to_string(),
            unit: "None".to_string(),
            dimensions: Vec::new(),
            timestamp: chrono::Utc::now(),
            value: MetricValue::Scalar(1.0),
            storage_resolution: None,
        };

        let groups = group_by_namespace(vec![datum("b"), datum("a"), datum("b")]);
        let shape: Vec<(&str, usize)> = groups.iter().map(|(ns, d)| (ns.as_str(), d.len())).collect();
        assert_eq!(shape, vec![("b", 2), ("a", 1)]);
    }
}
