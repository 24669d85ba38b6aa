use outcore_storage::StorageError;

/// Errors returned when building or running a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A task body returned an error or panicked. Downstream tasks were halted.
    #[error("task '{task}' failed: {reason}")]
    TaskFailed { task: String, reason: String },
    /// The cancellation token was triggered before every task completed.
    #[error("pipeline cancelled")]
    Cancelled,
    /// The spill store could not be opened.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("unable to start worker threads: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Errors that can occur while loading pipeline configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unable to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
