use log::trace;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::datum::Datum;
use crate::error::ReporterError;

type QueueResult<T> = std::result::Result<T, ReporterError>;

struct QueueState {
    items: VecDeque<Datum>,
    max_size: usize,
    dropped: u64,
}

impl QueueState {
    fn evict_to(&mut self, limit: usize) {
        while self.items.len() > limit {
            self.items.pop_front();
            self.dropped += 1;
        }
    }
}

/// A bounded FIFO of datums waiting to be flushed
///
/// When full, the oldest datum is evicted to make room and counted as
/// dropped. A single mutex guards every operation.
pub struct MetricQueue {
    state: Mutex<QueueState>,
}

impl MetricQueue {
    /// Create a queue holding at most `max_size` datums (minimum 1)
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                max_size: max_size.max(1),
                dropped: 0,
            }),
        }
    }

    fn lock(&self) -> QueueResult<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| ReporterError::LockPoisoned("metric queue"))
    }

    /// Append a datum, evicting the oldest one if the queue is full
    pub fn push(&self, datum: Datum) -> QueueResult<()> {
        let mut state = self.lock()?;
        let limit = state.max_size - 1;
        state.evict_to(limit);

        trace!("Queued metric '{}' for namespace '{}'", datum.metric_name, datum.namespace);
        state.items.push_back(datum);

        Ok(())
    }

    /// Take everything queued so far, or `None` if there is nothing to send
    pub fn drain(&self) -> QueueResult<Option<Vec<Datum>>> {
        let mut state = self.lock()?;
        if state.items.is_empty() {
            return Ok(None);
        }

        let drained = std::mem::take(&mut state.items);
        Ok(Some(drained.into()))
    }

    /// Read and reset the number of datums evicted since the last call
    pub fn dropped_since_last_check(&self) -> QueueResult<u64> {
        let mut state = self.lock()?;
        Ok(std::mem::take(&mut state.dropped))
    }

    pub fn clear(&self) -> QueueResult<()> {
        self.lock()?.items.clear();
        Ok(())
    }

    pub fn len(&self) -> QueueResult<usize> {
        Ok(self.lock()?.items.len())
    }

    pub fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.lock()?.items.is_empty())
    }

    pub fn max_size(&self) -> QueueResult<usize> {
        Ok(self.lock()?.max_size)
    }

    /// Change the capacity; shrinking evicts the oldest entries as drops
    pub fn set_max_size(&self, max_size: usize) -> QueueResult<()> {
        let mut state = self.lock()?;
        state.max_size = max_size.max(1);
        let limit = state.max_size;
        state.evict_to(limit);
        Ok(())
    }

    /// Copy of the queued datums, oldest first
    pub fn snapshot(&self) -> QueueResult<Vec<Datum>> {
        Ok(self.lock()?.items.iter().cloned().collect())
    }
}
