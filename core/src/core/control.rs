// contest/src/core/control.rs

//! Signals for stopping a running job and the tagged per-target outcome of a
//! pipeline traversal.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::checkpoint::TargetCheckpoint;
use crate::core::target::TargetId;
use crate::error::StepError;
use crate::job::JobId;

/// Why the pipeline is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  /// Reversible: every in-flight target must end up with a checkpoint.
  Pause,
  /// Irreversible: in-flight target state is discarded after release.
  Cancel,
  /// A step failed in a way that fails the whole job.
  Abort,
}

/// Shared cooperative stop signal observed by every step runner, by the
/// target mediator and by the orchestrator.
///
/// Cancel (and the internal abort) win over pause when more than one has been
/// requested.
#[derive(Debug, Clone, Default)]
pub struct JobSignal {
  pause: CancellationToken,
  cancel: CancellationToken,
  abort: CancellationToken,
}

impl JobSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn pause(&self) {
    self.pause.cancel();
  }

  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub(crate) fn abort(&self) {
    self.abort.cancel();
  }

  pub fn is_stopping(&self) -> bool {
    self.stop_reason().is_some()
  }

  pub fn stop_reason(&self) -> Option<StopReason> {
    if self.abort.is_cancelled() {
      Some(StopReason::Abort)
    } else if self.cancel.is_cancelled() {
      Some(StopReason::Cancel)
    } else if self.pause.is_cancelled() {
      Some(StopReason::Pause)
    } else {
      None
    }
  }

  /// Resolves once any stop has been requested.
  pub async fn stopped(&self) {
    tokio::select! {
      _ = self.pause.cancelled() => {}
      _ = self.cancel.cancelled() => {}
      _ = self.abort.cancelled() => {}
    }
  }

  /// Resolves once a cancel or abort has been requested; a pause alone does
  /// not wake it.
  pub async fn cancelled(&self) {
    tokio::select! {
      _ = self.cancel.cancelled() => {}
      _ = self.abort.cancelled() => {}
    }
  }

  /// Resolves `grace` after the first stop request.
  pub(crate) async fn grace_expired(&self, grace: Duration) {
    self.stopped().await;
    tokio::time::sleep(grace).await;
  }
}

/// What a test step sees of the job while running against one target.
#[derive(Debug, Clone)]
pub struct StepContext {
  pub job_id: JobId,
  pub run: u32,
  pub step_label: String,
  pub target_id: TargetId,
  pub(crate) signal: JobSignal,
}

impl StepContext {
  /// True once pause or cancel was requested. A long-running step should
  /// then wrap up or return a checkpoint within its grace period.
  pub fn is_stopping(&self) -> bool {
    self.signal.is_stopping()
  }

  /// True when the stop is a pause, i.e. a checkpoint will be honoured.
  pub fn is_pausing(&self) -> bool {
    self.signal.stop_reason() == Some(StopReason::Pause)
  }

  pub fn stop_reason(&self) -> Option<StopReason> {
    self.signal.stop_reason()
  }

  pub async fn stopped(&self) {
    self.signal.stopped().await
  }
}

/// Final word on one target for one run, as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetOutcome {
  /// Went through every step.
  Passed,
  /// A step failed for this target. Later steps never see it.
  Failed { step: String, error: StepError },
  /// Stopped by a pause; resumes from the checkpoint.
  Suspended(TargetCheckpoint),
  /// Stopped by a cancel or a job-fatal error before finishing.
  Aborted { step: String },
}

impl TargetOutcome {
  pub fn is_passed(&self) -> bool {
    matches!(self, TargetOutcome::Passed)
  }
}
