// contest/src/job/state.rs

//! Job lifecycle states and the transitions the orchestrator may request.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{event, Level};

use crate::core::event::{
  EVENT_JOB_CANCELLATION_FAILED, EVENT_JOB_CANCELLED, EVENT_JOB_CANCELLING, EVENT_JOB_COMPLETED,
  EVENT_JOB_FAILED, EVENT_JOB_PAUSED, EVENT_JOB_PAUSE_FAILED, EVENT_JOB_STARTED,
};
use crate::error::{ContestError, ContestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
  Unknown,
  Started,
  Completed,
  Failed,
  Paused,
  PauseFailed,
  Cancelling,
  Cancelled,
  CancellationFailed,
}

/// Textual name of every state. Lifecycle states share their name with the
/// event emitted when the job enters them.
const STATE_NAMES: [(JobState, &str); 9] = [
  (JobState::Unknown, "JobStateUnknown"),
  (JobState::Started, EVENT_JOB_STARTED),
  (JobState::Completed, EVENT_JOB_COMPLETED),
  (JobState::Failed, EVENT_JOB_FAILED),
  (JobState::Paused, EVENT_JOB_PAUSED),
  (JobState::PauseFailed, EVENT_JOB_PAUSE_FAILED),
  (JobState::Cancelling, EVENT_JOB_CANCELLING),
  (JobState::Cancelled, EVENT_JOB_CANCELLED),
  (JobState::CancellationFailed, EVENT_JOB_CANCELLATION_FAILED),
];

impl JobState {
  pub const ALL: [JobState; 9] = [
    JobState::Unknown,
    JobState::Started,
    JobState::Completed,
    JobState::Failed,
    JobState::Paused,
    JobState::PauseFailed,
    JobState::Cancelling,
    JobState::Cancelled,
    JobState::CancellationFailed,
  ];

  pub fn name(&self) -> &'static str {
    STATE_NAMES
      .iter()
      .find(|(state, _)| state == self)
      .map(|(_, name)| *name)
      .unwrap_or("JobStateUnknown")
  }

  pub fn from_name(name: &str) -> Option<JobState> {
    STATE_NAMES.iter().find(|(_, n)| *n == name).map(|(state, _)| *state)
  }

  /// Completed, Failed and Cancelled never change again.
  pub fn is_terminal(&self) -> bool {
    matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
  }

  /// A failed attempt to pause or cancel: final for that attempt only.
  pub fn is_failed_attempt(&self) -> bool {
    matches!(self, JobState::PauseFailed | JobState::CancellationFailed)
  }
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Whether `from -> to` is a legal request.
///
/// Cancelling from Started or Paused must go through `Cancelling`; there is
/// no direct edge to `Cancelled`.
pub fn can_transition(from: JobState, to: JobState) -> bool {
  use JobState::*;
  matches!(
    (from, to),
    (Unknown, Started)
      | (Started, Completed)
      | (Started, Failed)
      | (Started, Paused)
      | (Started, PauseFailed)
      | (Started, Cancelling)
      | (Paused, Started)
      | (Paused, Cancelling)
      | (PauseFailed, Paused)
      | (PauseFailed, Cancelling)
      | (PauseFailed, Failed)
      | (Cancelling, Cancelled)
      | (Cancelling, CancellationFailed)
      | (CancellationFailed, Cancelling)
  )
}

/// Single-writer owner of a job's lifecycle state.
///
/// Besides the state last entered it tracks the *logical* state: after a
/// failed pause or cancel attempt the job is still logically where it was
/// before the attempt.
#[derive(Debug)]
pub struct JobStateMachine {
  current: JobState,
  logical: JobState,
  before_cancel: JobState,
  history: Vec<JobState>,
  observer: watch::Sender<JobState>,
}

impl Default for JobStateMachine {
  fn default() -> Self {
    Self::new()
  }
}

impl JobStateMachine {
  pub fn new() -> Self {
    Self::restore(JobState::Unknown)
  }

  /// Rebuilds a machine for a job persisted in `state` (e.g. Paused).
  pub fn restore(state: JobState) -> Self {
    let (observer, _) = watch::channel(state);
    Self {
      current: state,
      logical: state,
      before_cancel: state,
      history: Vec::new(),
      observer,
    }
  }

  /// Publishes every later transition on `observer` instead of the
  /// machine's own channel.
  pub(crate) fn observed_by(mut self, observer: watch::Sender<JobState>) -> Self {
    observer.send_replace(self.current);
    self.observer = observer;
    self
  }

  pub fn current(&self) -> JobState {
    self.current
  }

  pub fn logical(&self) -> JobState {
    self.logical
  }

  /// Every state entered through this machine, in order.
  pub fn history(&self) -> &[JobState] {
    &self.history
  }

  /// Receiver that always holds the latest state.
  pub fn subscribe(&self) -> watch::Receiver<JobState> {
    self.observer.subscribe()
  }

  pub fn can_transition(&self, to: JobState) -> bool {
    can_transition(self.current, to)
  }

  /// Moves to `to` if the edge is legal. Returns the previous state.
  pub fn transition(&mut self, to: JobState) -> ContestResult<JobState> {
    let from = self.current;
    if !can_transition(from, to) {
      event!(Level::ERROR, %from, %to, "Illegal job state transition requested.");
      return Err(ContestError::IllegalTransition { from, to });
    }

    self.logical = match to {
      JobState::PauseFailed => self.logical,
      JobState::Cancelling => {
        if from != JobState::CancellationFailed {
          self.before_cancel = self.logical;
        }
        JobState::Cancelling
      }
      JobState::CancellationFailed => self.before_cancel,
      other => other,
    };
    self.current = to;
    self.history.push(to);
    self.observer.send_replace(to);
    event!(Level::DEBUG, %from, %to, logical = %self.logical, "Job state transition.");
    Ok(from)
  }
}
