use async_trait::async_trait;

use crate::datum::Datum;
use crate::error::Result;

/// Logging client
#[cfg(feature = "log-client")]
pub mod logging;
#[cfg(feature = "log-client")]
pub use logging::LogClient;

/// In-memory client for testing
#[cfg(any(test, feature = "memory-client"))]
pub mod memory;
#[cfg(any(test, feature = "memory-client"))]
pub use memory::{MemoryClient, RecordedCall};

/// Largest number of datums the ingestion API accepts in one call
pub const MAX_DATUMS_PER_CALL: usize = 20;

/// Trait for remote metric ingestion backends
#[async_trait]
pub trait MetricsClient: Send + Sync + 'static {
    /// Send one batch of at most `MAX_DATUMS_PER_CALL` datums to a namespace
    async fn put_metric_data(&self, namespace: &str, data: &[Datum]) -> Result<()>;

    /// Get a name for this client
    fn name(&self) -> &str;
}
