// contest/src/core/checkpoint.rs

//! Opaque step checkpoints and the resume state of a paused job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::target::Target;
use crate::job::JobId;
use crate::reporter::RunResult;

/// Step-private resume data.
///
/// Only the step that produced a checkpoint can make sense of it. The engine
/// stores it, moves it around and hands it back, nothing more.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(Vec<u8>);

impl Checkpoint {
  pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
    Checkpoint(bytes.into())
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl std::fmt::Debug for Checkpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Checkpoint({} bytes)", self.0.len())
  }
}

/// Where a single in-flight target stopped: which step it was in and what
/// that step asked to be handed back on resumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCheckpoint {
  pub target: Target,
  pub step_index: usize,
  pub step_label: String,
  pub state: Option<Checkpoint>,
}

/// Everything needed to continue a paused job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
  pub job_id: JobId,
  /// The run that was interrupted (1-based).
  pub run: u32,
  /// One entry per target that was in flight when the pause committed.
  pub targets: Vec<TargetCheckpoint>,
  /// Results of the interrupted run gathered before the pause.
  pub partial_run: Option<RunResult>,
  /// Results of every run that completed before the pause.
  pub completed_runs: Vec<RunResult>,
  /// Snapshot of step variables, keyed by target id.
  pub variables: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}
