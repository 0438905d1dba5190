// contest/src/core/event.rs

//! Append-only lifecycle and step events.
//!
//! The engine only ever writes events; storing, indexing and serving them is
//! the business of whatever `EventSink` the caller plugs in.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{event, Level};

use crate::core::target::TargetId;
use crate::error::{ContestError, ContestResult};
use crate::job::JobId;

// Job lifecycle events. These are also the textual names of `JobState`s.
pub const EVENT_JOB_STARTED: &str = "JobStateStarted";
pub const EVENT_JOB_COMPLETED: &str = "JobStateCompleted";
pub const EVENT_JOB_FAILED: &str = "JobStateFailed";
pub const EVENT_JOB_PAUSED: &str = "JobStatePaused";
pub const EVENT_JOB_PAUSE_FAILED: &str = "JobStatePauseFailed";
pub const EVENT_JOB_CANCELLING: &str = "JobStateCancelling";
pub const EVENT_JOB_CANCELLED: &str = "JobStateCancelled";
pub const EVENT_JOB_CANCELLATION_FAILED: &str = "JobStateCancellationFailed";

// Run and target events emitted by the engine itself.
pub const EVENT_RUN_STARTED: &str = "RunStarted";
pub const EVENT_RUN_FINISHED: &str = "RunFinished";
pub const EVENT_TARGETS_ACQUIRED: &str = "TargetsAcquired";
pub const EVENT_TARGET_ACQUIRE_FAILED: &str = "TargetAcquireFailed";
pub const EVENT_TARGETS_RELEASED: &str = "TargetsReleased";
pub const EVENT_TARGET_RELEASE_LEAK: &str = "TargetReleaseLeak";
pub const EVENT_TARGET_IN: &str = "TargetIn";
pub const EVENT_TARGET_OUT: &str = "TargetOut";
pub const EVENT_TARGET_ERR: &str = "TargetErr";
pub const EVENT_TARGET_SUSPENDED: &str = "TargetSuspended";
pub const EVENT_REPORTER_FAILED: &str = "ReporterFailed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub job_id: JobId,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub run: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub step: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target: Option<TargetId>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<serde_json::Value>,
  pub emitted_at: DateTime<Utc>,
}

impl Event {
  pub fn new(job_id: JobId, name: impl Into<String>) -> Self {
    Self {
      job_id,
      name: name.into(),
      run: None,
      step: None,
      target: None,
      payload: None,
      emitted_at: Utc::now(),
    }
  }

  pub fn run(mut self, run: u32) -> Self {
    self.run = Some(run);
    self
  }

  pub fn step(mut self, step: impl Into<String>) -> Self {
    self.step = Some(step.into());
    self
  }

  pub fn target(mut self, target: TargetId) -> Self {
    self.target = Some(target);
    self
  }

  pub fn payload(mut self, payload: serde_json::Value) -> Self {
    self.payload = Some(payload);
    self
  }
}

/// Destination of emitted events. Must not block for long: it is called from
/// the orchestrator's control loop and from step workers.
pub trait EventSink: Send + Sync {
  fn emit(&self, event: Event);
}

/// Keeps every event in memory. Handy for tests and for short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
  events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<Event> {
    self.events.lock().clone()
  }

  pub fn names(&self) -> Vec<String> {
    self.events.lock().iter().map(|e| e.name.clone()).collect()
  }

  /// Events whose name is one of the job lifecycle names, in emission order.
  pub fn job_state_names(&self) -> Vec<String> {
    self
      .events
      .lock()
      .iter()
      .filter(|e| e.name.starts_with("JobState"))
      .map(|e| e.name.clone())
      .collect()
  }

  pub fn count(&self, name: &str) -> usize {
    self.events.lock().iter().filter(|e| e.name == name).count()
  }
}

impl EventSink for MemoryEventSink {
  fn emit(&self, event: Event) {
    self.events.lock().push(event);
  }
}

/// Forwards events to `tracing` at INFO level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
  fn emit(&self, e: Event) {
    event!(
      Level::INFO,
      job_id = %e.job_id,
      event_name = %e.name,
      run = ?e.run,
      step = ?e.step,
      target = ?e.target,
      payload = ?e.payload,
      "contest event"
    );
  }
}

/// The emitter handed to a test step. It stamps job, run and step on every
/// event and refuses names the step did not declare.
#[derive(Clone)]
pub struct StepEmitter {
  sink: Arc<dyn EventSink>,
  job_id: JobId,
  run: u32,
  step_label: String,
  allowed: Arc<[&'static str]>,
}

impl StepEmitter {
  pub(crate) fn new(
    sink: Arc<dyn EventSink>,
    job_id: JobId,
    run: u32,
    step_label: String,
    allowed: Arc<[&'static str]>,
  ) -> Self {
    Self {
      sink,
      job_id,
      run,
      step_label,
      allowed,
    }
  }

  pub fn emit(&self, name: &str, target: Option<&TargetId>, payload: Option<serde_json::Value>) -> ContestResult<()> {
    if !self.allowed.iter().any(|declared| *declared == name) {
      return Err(ContestError::UndeclaredEvent {
        step: self.step_label.clone(),
        event: name.to_string(),
      });
    }
    let mut e = Event::new(self.job_id, name).run(self.run).step(self.step_label.clone());
    if let Some(target) = target {
      e = e.target(target.clone());
    }
    if let Some(payload) = payload {
      e = e.payload(payload);
    }
    self.sink.emit(e);
    Ok(())
  }
}

impl std::fmt::Debug for StepEmitter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StepEmitter")
      .field("job_id", &self.job_id)
      .field("run", &self.run)
      .field("step_label", &self.step_label)
      .field("allowed", &self.allowed)
      .finish()
  }
}
