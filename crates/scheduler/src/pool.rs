//! Task graph execution on a fixed worker pool
//!
//! A [`TaskPool`] owns a small graph of sources and transforms connected by
//! [`DataChannel`]s. `run` hands runnable tasks to worker threads until
//! every task has completed, failed or been halted. A task never runs on two
//! workers at once; unrelated tasks run in parallel.
//!
//! Graphs must be acyclic: a transform is complete only once every task
//! writing its input channel has completed.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use outcore_storage::{BackingStore, BackingStoreConfig, MetricsSink};
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelId;
use crate::task::{SourceBody, StepContext, StepOutcome, TaskBody, TransformBody};
use crate::worker::run_workers;
use crate::{
    CancellationToken, DataChannel, PipelineConfig, PipelineError, Producer, TaskError, TaskId,
    TaskKind, TaskState,
};

/// Queue depth of a channel, independent of its item type.
trait ChannelProbe: Send + Sync {
    fn channel_id(&self) -> ChannelId;
    fn queued_items(&self) -> usize;
}

impl<T> ChannelProbe for DataChannel<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn channel_id(&self) -> ChannelId {
        self.id()
    }

    fn queued_items(&self) -> usize {
        self.len()
    }
}

struct TaskStatus {
    state: TaskState,
    /// An upstream task failed while this one was running.
    halt_requested: bool,
    error: Option<String>,
}

struct TaskSlot {
    name: String,
    kind: TaskKind,
    input: Option<usize>,
    output: Option<usize>,
    body: Mutex<Box<dyn TaskBody>>,
    status: Mutex<TaskStatus>,
    steps: AtomicU64,
    items_in: AtomicU64,
    items_out: AtomicU64,
}

impl TaskSlot {
    fn new(name: String, kind: TaskKind, input: Option<usize>, output: Option<usize>, body: Box<dyn TaskBody>) -> Self {
        Self {
            name,
            kind,
            input,
            output,
            body: Mutex::new(body),
            status: Mutex::new(TaskStatus { state: TaskState::Idle, halt_requested: false, error: None }),
            steps: AtomicU64::new(0),
            items_in: AtomicU64::new(0),
            items_out: AtomicU64::new(0),
        }
    }

    fn state(&self) -> TaskState {
        self.status.lock().state
    }
}

/// Per-task summary after (or during) a run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub state: TaskState,
    /// Times the task body was invoked
    pub steps: u64,
    pub items_in: u64,
    pub items_out: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of every task in a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub tasks: Vec<TaskReport>,
}

impl PipelineReport {
    pub fn task(&self, id: TaskId) -> Option<&TaskReport> {
        self.tasks.get(id.index())
    }

    /// Whether every task reached [`TaskState::Completed`].
    pub fn all_completed(&self) -> bool {
        self.tasks.iter().all(|task| task.state == TaskState::Completed)
    }
}

/// Scheduler for a graph of pipeline tasks.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use std::sync::Arc;
/// use outcore_scheduler::{IterSource, PipelineConfig, TaskPool};
/// use outcore_storage::NoopMetrics;
///
/// let mut pool = TaskPool::open(PipelineConfig::default().with_workers(2), Arc::new(NoopMetrics)).unwrap();
/// let numbers = pool.channel::<u64>("numbers");
/// pool.add_source("count", IterSource::new(1..=100u64, 16), &numbers);
///
/// let total = Arc::new(AtomicU64::new(0));
/// let sink_total = total.clone();
/// pool.add_sink("sum", &numbers, move |batch: Vec<u64>| {
///     sink_total.fetch_add(batch.iter().sum::<u64>(), Ordering::Relaxed);
///     Ok(())
/// });
///
/// let report = pool.run().unwrap();
/// assert!(report.all_completed());
/// assert_eq!(total.load(Ordering::Relaxed), 5050);
/// ```
pub struct TaskPool {
    config: PipelineConfig,
    store: Arc<BackingStore>,
    metrics: Arc<dyn MetricsSink>,
    channels: Vec<Arc<dyn ChannelProbe>>,
    tasks: Vec<TaskSlot>,
    cancel: CancellationToken,
    first_failure: Mutex<Option<(String, String)>>,
    wake: Condvar,
    wake_lock: Mutex<()>,
}

impl TaskPool {
    /// Create a pool whose channels spill into `store`.
    pub fn new(config: PipelineConfig, store: Arc<BackingStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            store,
            metrics,
            channels: Vec::new(),
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
            first_failure: Mutex::new(None),
            wake: Condvar::new(),
            wake_lock: Mutex::new(()),
        }
    }

    /// Create a pool with its own spill store under `config.backing_dir`.
    pub fn open(config: PipelineConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self, PipelineError> {
        let mut store_config = BackingStoreConfig::default();
        if let Some(dir) = &config.backing_dir {
            store_config = store_config.with_directory(dir);
        }
        let store = BackingStore::open_with_metrics(store_config, metrics.clone())?;
        Ok(Self::new(config, Arc::new(store), metrics))
    }

    /// Create a channel using the pool's store, spill threshold and metrics.
    pub fn channel<T>(&mut self, name: &str) -> Arc<DataChannel<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let channel = Arc::new(DataChannel::with_metrics(
            name,
            self.store.clone(),
            self.config.channel_config(),
            self.metrics.clone(),
        ));
        self.channel_index(channel.clone());
        channel
    }

    /// Add a source that pushes everything `producer` yields into `output`.
    pub fn add_source<T, P>(&mut self, name: &str, producer: P, output: &Arc<DataChannel<T>>) -> TaskId
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        P: Producer<T> + 'static,
    {
        let output_index = self.channel_index(output.clone());
        let body = SourceBody { producer, output: output.clone() };
        self.push_task(name, TaskKind::Source, None, Some(output_index), Box::new(body))
    }

    /// Add a transform applying `kernel` to every batch of `input`.
    ///
    /// Results are pushed to `output` when given and dropped otherwise.
    pub fn add_transform<I, O, F>(
        &mut self,
        name: &str,
        input: &Arc<DataChannel<I>>,
        kernel: F,
        output: Option<&Arc<DataChannel<O>>>,
    ) -> TaskId
    where
        I: Serialize + DeserializeOwned + Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(Vec<I>) -> Result<Vec<O>, TaskError> + Send + 'static,
    {
        let input_index = self.channel_index(input.clone());
        let output_index = output.map(|channel| self.channel_index(channel.clone()));
        let body = TransformBody { input: input.clone(), output: output.cloned(), kernel };
        self.push_task(name, TaskKind::Transform, Some(input_index), output_index, Box::new(body))
    }

    /// Add a transform with no output channel.
    pub fn add_sink<I, F>(&mut self, name: &str, input: &Arc<DataChannel<I>>, mut sink: F) -> TaskId
    where
        I: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(Vec<I>) -> Result<(), TaskError> + Send + 'static,
    {
        let kernel = move |batch: Vec<I>| -> Result<Vec<()>, TaskError> {
            sink(batch)?;
            Ok(Vec::new())
        };
        self.add_transform(name, input, kernel, None::<&Arc<DataChannel<()>>>)
    }

    /// Token that stops the pipeline at the next batch boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn store(&self) -> &Arc<BackingStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(id.index()).map(TaskSlot::state)
    }

    /// Error message of a failed task.
    pub fn task_error(&self, id: TaskId) -> Option<String> {
        self.tasks.get(id.index()).and_then(|task| task.status.lock().error.clone())
    }

    /// Current state and counters of every task.
    pub fn report(&self) -> PipelineReport {
        let tasks = self
            .tasks
            .iter()
            .enumerate()
            .map(|(index, task)| {
                let status = task.status.lock();
                TaskReport {
                    id: TaskId(index),
                    name: task.name.clone(),
                    kind: task.kind,
                    state: status.state,
                    steps: task.steps.load(Ordering::Relaxed),
                    items_in: task.items_in.load(Ordering::Relaxed),
                    items_out: task.items_out.load(Ordering::Relaxed),
                    error: status.error.clone(),
                }
            })
            .collect();
        PipelineReport { tasks }
    }

    /// Run every task until the graph is drained.
    ///
    /// # Errors
    /// - [`PipelineError::TaskFailed`] with the first task that failed; its
    ///   downstream tasks are halted and the rest of the graph still drains
    /// - [`PipelineError::Cancelled`] if the token stopped the run early;
    ///   unprocessed batches stay in their channels and `run` may be called
    ///   again after [`CancellationToken::reset`]
    pub fn run(&self) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let workers = self.config.worker_pool();
        info!(
            tasks = self.tasks.len(),
            channels = self.channels.len(),
            workers = workers.num_workers,
            "starting pipeline"
        );

        run_workers(&workers, |worker| self.worker_loop(worker, workers.poll_interval))
            .map_err(PipelineError::WorkerSpawn)?;

        let report = self.report();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Some((task, reason)) = self.first_failure.lock().clone() {
            return Err(PipelineError::TaskFailed { task, reason });
        }
        if !report.all_completed() {
            warn!(elapsed_ms, "pipeline cancelled before completion");
            return Err(PipelineError::Cancelled);
        }

        info!(elapsed_ms, "pipeline finished");
        Ok(report)
    }

    fn push_task(
        &mut self,
        name: &str,
        kind: TaskKind,
        input: Option<usize>,
        output: Option<usize>,
        body: Box<dyn TaskBody>,
    ) -> TaskId {
        let id = TaskId(self.tasks.len());
        self.tasks.push(TaskSlot::new(name.to_string(), kind, input, output, body));
        debug!(task = %id, name, ?kind, "added task");
        id
    }

    fn channel_index(&mut self, channel: Arc<dyn ChannelProbe>) -> usize {
        let id = channel.channel_id();
        match self.channels.iter().position(|known| known.channel_id() == id) {
            Some(index) => index,
            None => {
                self.channels.push(channel);
                self.channels.len() - 1
            }
        }
    }

    fn worker_loop(&self, worker: usize, poll_interval: Duration) {
        debug!(worker, "worker started");
        loop {
            if self.finished() {
                self.wake.notify_all();
                break;
            }
            match self.claim_next() {
                Some(index) => {
                    self.execute(index);
                    self.wake.notify_all();
                }
                None => {
                    let mut guard = self.wake_lock.lock();
                    self.wake.wait_for(&mut guard, poll_interval);
                }
            }
        }
        debug!(worker, "worker stopped");
    }

    /// Whether no task can make further progress in this run.
    fn finished(&self) -> bool {
        let cancelled = self.cancel.is_cancelled();
        self.tasks.iter().all(|task| {
            let state = task.state();
            state.is_terminal() || (cancelled && state != TaskState::Running)
        })
    }

    /// Every task writing this task's input channel has completed.
    fn upstream_done(&self, index: usize) -> bool {
        let Some(input) = self.tasks[index].input else {
            return true;
        };
        self.tasks
            .iter()
            .filter(|task| task.output == Some(input))
            .all(|task| task.state() == TaskState::Completed)
    }

    /// Pick a runnable task and mark it running.
    ///
    /// Transforms with the most queued input go first, so backlogs drain
    /// before sources add to them.
    fn claim_next(&self) -> Option<usize> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let mut candidates: Vec<(usize, usize)> = Vec::new();
        for (index, task) in self.tasks.iter().enumerate() {
            if task.state() != TaskState::Idle {
                continue;
            }
            match (task.kind, task.input) {
                (TaskKind::Transform, Some(input)) => {
                    let queued = self.channels[input].queued_items();
                    if queued > 0 || self.upstream_done(index) {
                        candidates.push((queued, index));
                    }
                }
                _ => candidates.push((0, index)),
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        candidates.into_iter().map(|(_, index)| index).find(|&index| {
            let mut status = self.tasks[index].status.lock();
            if status.state == TaskState::Idle && !status.halt_requested {
                status.state = TaskState::Running;
                true
            } else {
                false
            }
        })
    }

    fn execute(&self, index: usize) {
        let task = &self.tasks[index];
        let ctx = StepContext { cancel: &self.cancel, upstream_done: self.upstream_done(index) };

        let result = {
            let mut body = task.body.lock();
            panic::catch_unwind(AssertUnwindSafe(|| body.step(&ctx)))
        };
        task.steps.fetch_add(1, Ordering::Relaxed);

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return self.fail(index, err.to_string()),
            Err(payload) => return self.fail(index, panic_message(payload.as_ref())),
        };

        let (consumed, produced, finished) = match outcome {
            StepOutcome::Progress { consumed, produced } => (consumed, produced, false),
            StepOutcome::Idle => (0, 0, false),
            StepOutcome::Exhausted { consumed, produced } => (consumed, produced, true),
        };
        task.items_in.fetch_add(consumed, Ordering::Relaxed);
        task.items_out.fetch_add(produced, Ordering::Relaxed);

        let mut status = task.status.lock();
        status.state = if status.halt_requested {
            TaskState::Halted
        } else if finished {
            TaskState::Completed
        } else {
            TaskState::Idle
        };
        if status.state == TaskState::Completed {
            info!(
                task = %task.name,
                items_in = task.items_in.load(Ordering::Relaxed),
                items_out = task.items_out.load(Ordering::Relaxed),
                "task completed"
            );
        }
    }

    /// Mark a task failed and halt everything downstream of it.
    fn fail(&self, index: usize, reason: String) {
        let task = &self.tasks[index];
        {
            let mut status = task.status.lock();
            status.state = TaskState::Failed;
            status.error = Some(reason.clone());
        }
        error!(task = %task.name, reason = %reason, "task failed");
        self.first_failure.lock().get_or_insert_with(|| (task.name.clone(), reason));
        self.halt_downstream(index);
    }

    fn halt_downstream(&self, failed: usize) {
        let mut visited = HashSet::new();
        let mut frontier = vec![failed];

        while let Some(index) = frontier.pop() {
            let Some(output) = self.tasks[index].output else {
                continue;
            };
            for (downstream, task) in self.tasks.iter().enumerate() {
                if task.input != Some(output) || !visited.insert(downstream) {
                    continue;
                }
                let mut status = task.status.lock();
                let halted = match status.state {
                    TaskState::Idle => {
                        status.state = TaskState::Halted;
                        true
                    }
                    TaskState::Running => {
                        status.halt_requested = true;
                        true
                    }
                    _ => false,
                };
                drop(status);
                if halted {
                    warn!(task = %task.name, "halted after upstream failure");
                }
                frontier.push(downstream);
            }
        }
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("tasks", &self.tasks.len())
            .field("channels", &self.channels.len())
            .field("config", &self.config)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IterSource;
    use outcore_storage::NoopMetrics;
    use std::sync::atomic::AtomicUsize;

    fn pool(workers: usize) -> TaskPool {
        TaskPool::open(PipelineConfig::default().with_workers(workers), Arc::new(NoopMetrics)).unwrap()
    }

    #[test]
    fn test_empty_pool_runs() {
        let pool = pool(2);
        let report = pool.run().unwrap();
        assert!(report.tasks.is_empty());
    }

    #[test]
    fn test_source_and_transform_complete() {
        let mut pool = pool(3);
        let raw = pool.channel::<u32>("raw");
        let doubled = pool.channel::<u32>("doubled");
        let source = pool.add_source("numbers", IterSource::new(0..1000u32, 64), &raw);
        let double = pool.add_transform(
            "double",
            &raw,
            |batch: Vec<u32>| -> Result<Vec<u32>, TaskError> { Ok(batch.into_iter().map(|v| v * 2).collect()) },
            Some(&doubled),
        );

        let report = pool.run().unwrap();
        assert_eq!(pool.task_state(source), Some(TaskState::Completed));
        assert_eq!(pool.task_state(double), Some(TaskState::Completed));
        assert_eq!(report.task(source).unwrap().items_out, 1000);
        assert_eq!(report.task(double).unwrap().items_in, 1000);

        let mut items: Vec<u32> = doubled.consume().flat_map(|batch| batch.unwrap()).collect();
        items.sort_unstable();
        assert_eq!(items, (0..1000).map(|v| v * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_transform_over_prefilled_channel() {
        let mut pool = pool(1);
        let input = pool.channel::<String>("words");
        input.push(vec!["a".to_string(), "b".to_string()]).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sink = pool.add_sink("count", &input, move |batch: Vec<String>| {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        });

        pool.run().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(pool.task_state(sink), Some(TaskState::Completed));
    }

    #[test]
    fn test_panicking_kernel_fails_task() {
        let mut pool = pool(2);
        let input = pool.channel::<u8>("input");
        pool.add_source("bytes", IterSource::new(0..10u8, 5), &input);
        let sink = pool.add_sink("explode", &input, |_batch: Vec<u8>| -> Result<(), TaskError> {
            panic!("kernel bug");
        });

        let error = pool.run().unwrap_err();
        match error {
            PipelineError::TaskFailed { task, reason } => {
                assert_eq!(task, "explode");
                assert!(reason.contains("kernel bug"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pool.task_state(sink), Some(TaskState::Failed));
    }

    #[test]
    fn test_panic_message_formats() {
        assert_eq!(panic_message(&"boom"), "panicked: boom");
        assert_eq!(panic_message(&String::from("bang")), "panicked: bang");
        assert_eq!(panic_message(&42u8), "panicked");
    }
}
