//! Pipeline stages: sources, transforms and their lifecycle states
//!
//! A task body is a plain function the pool calls repeatedly. Each call
//! handles at most one input drain or one produced batch, so cancellation
//! and failure are observed at batch boundaries.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{CancellationToken, DataChannel};

/// Error type returned by producers and kernels.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Index of a task within its pool, in the order tasks were added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be scheduled
    Idle,
    /// Executing on a worker
    Running,
    /// Finished; no further work will arrive
    Completed,
    /// The task body returned an error or panicked
    Failed,
    /// Not run further because an upstream task failed
    Halted,
}

impl TaskState {
    /// Whether the task will never be scheduled again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Halted)
    }
}

/// Whether a task produces into the graph or consumes from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Source,
    Transform,
}

/// Supplies items to a source task.
pub trait Producer<T>: Send {
    /// Items that can be produced right now; zero means exhausted.
    fn available(&mut self) -> usize;

    /// Produce up to `count` items.
    fn produce(&mut self, count: usize) -> Result<Vec<T>, TaskError>;
}

/// Producer over any iterator, emitting fixed-size batches.
///
/// # Example
///
/// ```
/// use outcore_scheduler::{IterSource, Producer};
///
/// let mut source = IterSource::new(0..5u32, 2);
/// assert_eq!(source.available(), 2);
/// assert_eq!(source.produce(2).unwrap(), vec![0, 1]);
/// ```
pub struct IterSource<I: Iterator> {
    iter: std::iter::Peekable<I>,
    batch_size: usize,
}

impl<I: Iterator> IterSource<I> {
    pub fn new(iter: I, batch_size: usize) -> Self {
        Self { iter: iter.peekable(), batch_size: batch_size.max(1) }
    }
}

impl<I> Producer<I::Item> for IterSource<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn available(&mut self) -> usize {
        if self.iter.peek().is_some() {
            self.batch_size
        } else {
            0
        }
    }

    fn produce(&mut self, count: usize) -> Result<Vec<I::Item>, TaskError> {
        Ok(self.iter.by_ref().take(count).collect())
    }
}

/// What one step of a task accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// Work was done; the task may have more.
    Progress { consumed: u64, produced: u64 },
    /// Nothing to do right now.
    Idle,
    /// The task is finished.
    Exhausted { consumed: u64, produced: u64 },
}

/// Inputs to one step.
pub(crate) struct StepContext<'a> {
    pub cancel: &'a CancellationToken,
    /// Every task writing this task's input has completed.
    pub upstream_done: bool,
}

/// Type-erased body of a task.
pub(crate) trait TaskBody: Send {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome, TaskError>;
}

pub(crate) struct SourceBody<T, P> {
    pub producer: P,
    pub output: Arc<DataChannel<T>>,
}

impl<T, P> TaskBody for SourceBody<T, P>
where
    T: Serialize + DeserializeOwned + Send,
    P: Producer<T>,
{
    fn step(&mut self, _ctx: &StepContext<'_>) -> Result<StepOutcome, TaskError> {
        let count = self.producer.available();
        if count == 0 {
            return Ok(StepOutcome::Exhausted { consumed: 0, produced: 0 });
        }

        let batch = self.producer.produce(count)?;
        let produced = batch.len() as u64;
        self.output.push(batch)?;
        Ok(StepOutcome::Progress { consumed: 0, produced })
    }
}

pub(crate) struct TransformBody<I, O, F> {
    pub input: Arc<DataChannel<I>>,
    pub output: Option<Arc<DataChannel<O>>>,
    pub kernel: F,
}

impl<I, O, F> TaskBody for TransformBody<I, O, F>
where
    I: Serialize + DeserializeOwned + Send,
    O: Serialize + DeserializeOwned + Send,
    F: FnMut(Vec<I>) -> Result<Vec<O>, TaskError> + Send,
{
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome, TaskError> {
        let mut consumer = self.input.consume();
        if consumer.is_empty() {
            return Ok(if ctx.upstream_done {
                StepOutcome::Exhausted { consumed: 0, produced: 0 }
            } else {
                StepOutcome::Idle
            });
        }

        let mut consumed = 0u64;
        let mut produced = 0u64;
        loop {
            if ctx.cancel.is_cancelled() {
                self.input.restore(consumer.into_remaining());
                return Ok(StepOutcome::Progress { consumed, produced });
            }
            let Some(batch) = consumer.next() else {
                break;
            };

            // On any failure, unprocessed input stays in the channel for inspection.
            let batch = match batch {
                Ok(batch) => batch,
                Err(error) => {
                    self.input.restore(consumer.into_remaining());
                    return Err(error.into());
                }
            };
            let len = batch.len() as u64;
            let results = match (self.kernel)(batch) {
                Ok(results) => results,
                Err(error) => {
                    self.input.restore(consumer.into_remaining());
                    return Err(error);
                }
            };
            consumed += len;
            produced += results.len() as u64;
            if let Some(output) = &self.output {
                if let Err(error) = output.push(results) {
                    self.input.restore(consumer.into_remaining());
                    return Err(error.into());
                }
            }
        }

        Ok(StepOutcome::Progress { consumed, produced })
    }
}
