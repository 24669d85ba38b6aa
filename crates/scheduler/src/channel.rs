//! Batch channels with spill-to-disk backpressure
//!
//! A [`DataChannel`] connects producers to one consuming stage. Producers
//! never block: once more than `spill_threshold` items are held in memory,
//! the oldest batches are encoded with `bincode` and moved to the shared
//! [`BackingStore`], leaving a span reference in the queue. A consumer swaps
//! out the whole queue at once and rehydrates spilled batches lazily.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use outcore_storage::{BackingStore, Counter, MetricsSink, NoopMetrics, Span, StorageError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Default number of items a channel keeps in memory before spilling.
pub const DEFAULT_SPILL_THRESHOLD: usize = 64 * 1024;

/// Errors raised while moving batches through a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("spill storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("unable to encode or decode spilled batch: {0}")]
    Codec(#[from] bincode::Error),
}

/// Per-channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Items held in memory before the oldest batches are spilled
    pub spill_threshold: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { spill_threshold: DEFAULT_SPILL_THRESHOLD }
    }
}

impl ChannelConfig {
    pub fn new(spill_threshold: usize) -> Self {
        Self { spill_threshold }
    }
}

/// Identity of a channel within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

enum Queued<T> {
    Resident { seq: u64, batch: Vec<T>, spilling: bool },
    Spilled { span: Span, items: usize },
}

impl<T> Queued<T> {
    fn items(&self) -> usize {
        match self {
            Queued::Resident { batch, .. } => batch.len(),
            Queued::Spilled { items, .. } => *items,
        }
    }
}

struct ChannelState<T> {
    queue: VecDeque<Queued<T>>,
    /// Items queued, resident or spilled
    items: usize,
    /// Items in resident batches, including ones being spilled
    resident_items: usize,
    /// Items in resident batches whose spill write is in flight
    spilling_items: usize,
    next_seq: u64,
}

impl<T> ChannelState<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            items: 0,
            resident_items: 0,
            spilling_items: 0,
            next_seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Clear the in-flight flag on batches whose spill was not completed.
    fn abandon_spills(&mut self, seqs: &[u64]) {
        for queued in self.queue.iter_mut() {
            if let Queued::Resident { seq, batch, spilling } = queued {
                if *spilling && seqs.contains(seq) {
                    *spilling = false;
                    self.spilling_items -= batch.len();
                }
            }
        }
    }
}

/// A batch encoded under the lock and waiting to be written.
struct PendingSpill {
    seq: u64,
    items: usize,
    bytes: Vec<u8>,
}

/// Thread-safe queue of batches connecting pipeline stages.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use outcore_scheduler::{ChannelConfig, DataChannel};
/// use outcore_storage::{BackingStore, BackingStoreConfig};
///
/// let store = Arc::new(BackingStore::open(BackingStoreConfig::default()).unwrap());
/// let channel = DataChannel::new("numbers", store, ChannelConfig::new(4));
///
/// channel.push(vec![1u32, 2, 3]).unwrap();
/// channel.push(vec![4, 5, 6]).unwrap(); // over threshold: the first batch spills
///
/// let items: Vec<u32> = channel
///     .consume()
///     .map(|batch| batch.unwrap())
///     .flatten()
///     .collect();
/// assert_eq!(items, vec![1, 2, 3, 4, 5, 6]);
/// ```
pub struct DataChannel<T> {
    id: ChannelId,
    name: String,
    config: ChannelConfig,
    state: Mutex<ChannelState<T>>,
    store: Arc<BackingStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl<T> DataChannel<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    /// Create a channel that spills into `store`, with metrics disabled.
    pub fn new(name: impl Into<String>, store: Arc<BackingStore>, config: ChannelConfig) -> Self {
        Self::with_metrics(name, store, config, Arc::new(NoopMetrics))
    }

    /// Create a channel reporting to `metrics`.
    pub fn with_metrics(
        name: impl Into<String>,
        store: Arc<BackingStore>,
        config: ChannelConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            config,
            state: Mutex::new(ChannelState::new()),
            store,
            metrics,
        }
    }

    /// Append a batch. Empty batches are ignored.
    ///
    /// Never blocks on other producers or the consumer beyond the queue
    /// lock. If the push leaves more than `spill_threshold` items resident,
    /// the oldest resident batches are written to the backing store before
    /// this returns.
    ///
    /// # Errors
    /// Returns an error if a spill could not be encoded or written. The
    /// pushed batch and every batch selected for spilling remain queued in
    /// memory.
    pub fn push(&self, batch: Vec<T>) -> Result<(), ChannelError> {
        if batch.is_empty() {
            return Ok(());
        }

        let pending = {
            let mut state = self.state.lock();
            let seq = state.next_seq();
            let len = batch.len();
            state.items += len;
            state.resident_items += len;
            state.queue.push_back(Queued::Resident { seq, batch, spilling: false });
            self.select_spills(&mut state)?
        };

        if pending.is_empty() {
            return Ok(());
        }
        self.write_spills(pending)
    }

    /// Take every queued batch, leaving the channel empty.
    ///
    /// Batches pushed after this returns go to the next consumer.
    pub fn consume(&self) -> Consumer<T> {
        let mut state = self.state.lock();
        let queue = std::mem::take(&mut state.queue);
        let items = std::mem::take(&mut state.items);
        state.resident_items = 0;
        state.spilling_items = 0;
        drop(state);

        Consumer {
            queue,
            items,
            store: self.store.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Put undelivered batches back at the front of the queue, in order.
    pub fn restore(&self, remaining: Undelivered<T>) {
        if remaining.queue.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        for queued in remaining.queue.into_iter().rev() {
            let restored = match queued {
                Queued::Resident { batch, .. } => {
                    let seq = state.next_seq();
                    state.resident_items += batch.len();
                    Queued::Resident { seq, batch, spilling: false }
                }
                spilled @ Queued::Spilled { .. } => spilled,
            };
            state.items += restored.items();
            state.queue.push_front(restored);
        }
        debug!(channel = %self.name, items = state.items, "restored undelivered batches");
    }

    /// Queued items, resident or spilled.
    pub fn len(&self) -> usize {
        self.state.lock().items
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued items currently held in memory.
    pub fn resident_items(&self) -> usize {
        self.state.lock().resident_items
    }

    /// Number of queued batches.
    pub fn batch_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    /// Mark the oldest resident batches for spilling and encode them.
    fn select_spills(&self, state: &mut ChannelState<T>) -> Result<Vec<PendingSpill>, ChannelError> {
        let threshold = self.config.spill_threshold;
        let mut pending = Vec::new();
        let mut failure = None;

        for queued in state.queue.iter_mut() {
            if state.resident_items - state.spilling_items <= threshold {
                break;
            }
            if let Queued::Resident { seq, batch, spilling } = queued {
                if *spilling {
                    continue;
                }
                match bincode::serialize(&*batch) {
                    Ok(bytes) => {
                        *spilling = true;
                        state.spilling_items += batch.len();
                        pending.push(PendingSpill { seq: *seq, items: batch.len(), bytes });
                    }
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }
        }

        if let Some(error) = failure {
            let seqs: Vec<u64> = pending.iter().map(|spill| spill.seq).collect();
            state.abandon_spills(&seqs);
            return Err(error.into());
        }
        Ok(pending)
    }

    /// Write encoded batches and swap them for span references.
    fn write_spills(&self, pending: Vec<PendingSpill>) -> Result<(), ChannelError> {
        for (index, spill) in pending.iter().enumerate() {
            let span = match self.store.append(&spill.bytes) {
                Ok(span) => span,
                Err(err) => {
                    error!(channel = %self.name, error = %err, "failed to spill batch");
                    let seqs: Vec<u64> = pending[index..].iter().map(|spill| spill.seq).collect();
                    self.state.lock().abandon_spills(&seqs);
                    return Err(err.into());
                }
            };

            let mut state = self.state.lock();
            let slot = state.queue.iter_mut().find(|queued| {
                matches!(queued, Queued::Resident { seq, spilling: true, .. } if *seq == spill.seq)
            });
            // A consumer may have taken the batch while it was being written.
            if let Some(slot) = slot {
                *slot = Queued::Spilled { span, items: spill.items };
                state.resident_items -= spill.items;
                state.spilling_items -= spill.items;
                drop(state);

                self.metrics.increment(Counter::BatchesSpilled, 1);
                debug!(
                    channel = %self.name,
                    items = spill.items,
                    bytes = spill.bytes.len(),
                    "spilled batch"
                );
            }
        }
        Ok(())
    }
}

impl<T> fmt::Debug for DataChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DataChannel")
            .field("name", &self.name)
            .field("items", &state.items)
            .field("resident_items", &state.resident_items)
            .field("batches", &state.queue.len())
            .finish()
    }
}

/// Batches taken from a channel by one [`DataChannel::consume`] call.
///
/// Yields batches in queue order; spilled batches are read back from the
/// backing store when reached.
pub struct Consumer<T> {
    queue: VecDeque<Queued<T>>,
    items: usize,
    store: Arc<BackingStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl<T> Consumer<T> {
    /// Batches not yet yielded.
    pub fn len_batches(&self) -> usize {
        self.queue.len()
    }

    /// Items not yet yielded.
    pub fn len_items(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Stop consuming and keep the rest for [`DataChannel::restore`].
    pub fn into_remaining(self) -> Undelivered<T> {
        Undelivered { queue: self.queue, items: self.items }
    }
}

impl<T: DeserializeOwned> Iterator for Consumer<T> {
    type Item = Result<Vec<T>, ChannelError>;

    fn next(&mut self) -> Option<Self::Item> {
        let queued = self.queue.pop_front()?;
        self.items -= queued.items();

        let batch = match queued {
            Queued::Resident { batch, .. } => Ok(batch),
            Queued::Spilled { span, .. } => self
                .store
                .read(span)
                .map_err(ChannelError::from)
                .and_then(|bytes| bincode::deserialize(&bytes).map_err(ChannelError::from)),
        };
        if batch.is_ok() {
            self.metrics.increment(Counter::BatchesFlushed, 1);
        }
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.queue.len(), Some(self.queue.len()))
    }
}

/// Batches a consumer gave back without delivering.
pub struct Undelivered<T> {
    queue: VecDeque<Queued<T>>,
    items: usize,
}

impl<T> Undelivered<T> {
    pub fn len_items(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
