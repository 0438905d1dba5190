// contest/src/error.rs
use anyhow::Error as AnyhowError;
use std::time::Duration;
use thiserror::Error;

use crate::job::state::JobState;

#[derive(Debug, Error)]
pub enum ContestError {
  #[error("Invalid job: {0}")]
  InvalidJob(String),

  #[error("Invalid job descriptor: {0}")]
  InvalidDescriptor(String),

  #[error("version Error: {0}")]
  Version(String),

  #[error("Test step not found in registry: {name}")]
  StepNotFound { name: String },

  #[error("Reporter not found in registry: {name}")]
  ReporterNotFound { name: String },

  #[error("User function not found: {name}")]
  FunctionNotFound { name: String },

  #[error("Invalid parameters for step '{step}': {message}")]
  InvalidParameters { step: String, message: String },

  #[error("Illegal job state transition: {from} -> {to}")]
  IllegalTransition { from: JobState, to: JobState },

  #[error("Pause did not complete within {timeout:?}; {remaining} target(s) still in flight")]
  PauseTimeout { timeout: Duration, remaining: usize },

  #[error("Cancellation did not complete within {timeout:?}; {remaining} target(s) still in flight")]
  CancelTimeout { timeout: Duration, remaining: usize },

  #[error("Step '{step}' emitted undeclared event '{event}'")]
  UndeclaredEvent { step: String, event: String },

  #[error("Fatal error in step '{step}': {source}")]
  StepFatal {
    step: String,
    #[source]
    source: StepError,
  },

  #[error("Reporter '{reporter}' reported an unrecoverable condition: {message}")]
  ReporterUnrecoverable { reporter: String, message: String },

  #[error("Configuration error: {0}")]
  Config(String),

  #[error("Log storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("Error in plugin or external operation. Source: {source}")]
  Plugin {
    #[source]
    source: AnyhowError,
  },

  #[error("Internal contest error: {0}")]
  Internal(String),
}

impl From<AnyhowError> for ContestError {
  fn from(err: AnyhowError) -> Self {
    ContestError::Plugin { source: err }
  }
}

pub type ContestResult<T, E = ContestError> = std::result::Result<T, E>;

/// Error returned by a test step's `run`, classified by how the engine
/// must react to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
  /// The step's parameters are unusable. Fails the whole job.
  #[error("invalid parameters: {0}")]
  Parameters(String),

  /// The step cannot continue for any target. Fails the whole job.
  #[error("fatal: {0}")]
  Fatal(String),

  /// The step failed for this target only.
  #[error("{0}")]
  Target(String),

  /// A transport or target manager hiccup; the runner retries it.
  #[error("transport: {0}")]
  Transport(String),
}

impl StepError {
  pub fn target(msg: impl Into<String>) -> Self {
    StepError::Target(msg.into())
  }

  pub fn is_fatal(&self) -> bool {
    matches!(self, StepError::Parameters(_) | StepError::Fatal(_))
  }

  pub fn is_retryable(&self) -> bool {
    matches!(self, StepError::Transport(_))
  }
}

impl From<AnyhowError> for StepError {
  fn from(err: AnyhowError) -> Self {
    StepError::Target(format!("{:#}", err))
  }
}

/// Failure of a target manager call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
  #[error("target manager did not answer within {0:?}")]
  Timeout(Duration),

  #[error("targets unavailable: {0}")]
  Unavailable(String),

  #[error("target manager transport error: {0}")]
  Transport(String),
}

/// Failure of a reporter invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReporterError {
  /// The report could not be produced; recorded, does not fail the job.
  #[error("report failed: {0}")]
  Failed(String),

  /// The reporter judged the job outcome unrecoverable; the job ends Failed.
  #[error("unrecoverable: {0}")]
  Unrecoverable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
  #[error("error while storing the log: {0}")]
  Insert(String),

  #[error("error while reading the logs: {0}")]
  Query(String),

  #[error("not supported action: storage is read-only")]
  ReadOnly,
}
