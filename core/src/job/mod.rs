// contest/src/job/mod.rs

//! The validated `Job` value the orchestrator executes.

pub mod descriptor;
pub mod state;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::step::StepBundle;
use crate::error::{ContestError, ContestResult};
use crate::reporter::Reporter;

pub use descriptor::Descriptor;
pub use state::{JobState, JobStateMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A reporter instance chosen for a job together with its validated parameters.
#[derive(Clone)]
pub struct ReporterBundle {
  pub reporter: Arc<dyn Reporter>,
  pub parameters: serde_json::Value,
}

impl ReporterBundle {
  pub fn new(reporter: Arc<dyn Reporter>, parameters: serde_json::Value) -> Self {
    Self { reporter, parameters }
  }
}

impl fmt::Debug for ReporterBundle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ReporterBundle")
      .field("reporter", &self.reporter.name())
      .field("parameters", &self.parameters)
      .finish()
  }
}

/// A unit of orchestrated work: an ordered list of test steps run against
/// acquired targets, possibly repeated.
#[derive(Debug, Clone)]
pub struct Job {
  pub id: JobId,
  pub name: String,
  /// Free-form tags used to search and aggregate jobs.
  pub tags: Vec<String>,
  /// How many times the steps run. 0 means until paused or cancelled.
  pub runs: u32,
  /// Pause between two consecutive runs.
  pub run_interval: Duration,
  /// Longest the orchestrator waits for the target manager's acquire.
  pub target_manager_acquire_timeout: Duration,
  /// Longest the orchestrator waits for the target manager's release.
  pub target_manager_release_timeout: Duration,
  /// Opaque selection criteria forwarded to the target manager.
  pub acquire_parameters: serde_json::Value,
  /// Test steps in pipeline order.
  pub steps: Vec<StepBundle>,
  pub run_reporters: Vec<ReporterBundle>,
  pub final_reporters: Vec<ReporterBundle>,
}

impl Job {
  /// Sanity checks repeated by the orchestrator before anything is touched.
  pub fn validate(&self) -> ContestResult<()> {
    if self.steps.is_empty() {
      return Err(ContestError::InvalidJob(format!(
        "job '{}' needs at least one test step",
        self.name
      )));
    }
    if self.run_reporters.is_empty() && self.final_reporters.is_empty() {
      return Err(ContestError::InvalidJob(format!(
        "job '{}' needs at least one run reporter or one final reporter",
        self.name
      )));
    }
    let mut labels = HashSet::new();
    for bundle in &self.steps {
      if bundle.label.trim().is_empty() {
        return Err(ContestError::InvalidJob(format!(
          "step '{}' has an empty label",
          bundle.step.name()
        )));
      }
      if !labels.insert(bundle.label.as_str()) {
        return Err(ContestError::InvalidJob(format!(
          "duplicate step label '{}'",
          bundle.label
        )));
      }
    }
    if self.target_manager_acquire_timeout.is_zero() || self.target_manager_release_timeout.is_zero() {
      return Err(ContestError::InvalidJob(
        "target manager timeouts must be greater than zero".to_string(),
      ));
    }
    Ok(())
  }

  pub fn step_labels(&self) -> Vec<&str> {
    self.steps.iter().map(|s| s.label.as_str()).collect()
  }
}
