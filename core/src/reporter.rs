// contest/src/reporter.rs

//! Reporter plugins and the results they are handed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::target::TargetId;
use crate::error::ReporterError;
use crate::job::{JobId, JobState};

/// A target that a step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFailure {
  pub target: TargetId,
  pub step: String,
  pub error: String,
}

/// Outcome of one run: one pass of the acquired targets through every step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
  pub run: u32,
  pub acquired: usize,
  pub passed: Vec<TargetId>,
  pub failed: Vec<TargetFailure>,
  pub aborted: Vec<TargetId>,
  /// Targets whose release exceeded its deadline or errored.
  pub leaked: usize,
  /// Set when the run could not acquire any target.
  pub acquisition_error: Option<String>,
}

impl RunResult {
  pub fn new(run: u32) -> Self {
    Self {
      run,
      ..Default::default()
    }
  }

  pub fn acquisition_failed(&self) -> bool {
    self.acquisition_error.is_some()
  }
}

/// What final reporters receive once the job has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResults {
  pub job_id: JobId,
  pub state: JobState,
  pub runs: Vec<RunResult>,
}

impl FinalResults {
  pub fn succeeded(&self) -> usize {
    self.runs.iter().map(|r| r.passed.len()).sum()
  }

  pub fn failed(&self) -> usize {
    self.runs.iter().map(|r| r.failed.len()).sum()
  }
}

/// A reporter's verdict plus whatever it wants to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
  pub success: bool,
  pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportPhase {
  Run(u32),
  Final,
}

/// A report as recorded in the job summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
  pub reporter: String,
  pub phase: ReportPhase,
  pub outcome: Result<Report, String>,
}

/// Summarizes and publishes run or final results.
#[async_trait]
pub trait Reporter: Send + Sync {
  fn name(&self) -> &str;

  fn validate_run_parameters(&self, _params: &serde_json::Value) -> Result<(), ReporterError> {
    Ok(())
  }

  fn validate_final_parameters(&self, _params: &serde_json::Value) -> Result<(), ReporterError> {
    Ok(())
  }

  /// Invoked after each run.
  async fn run_report(&self, params: &serde_json::Value, result: &RunResult) -> Result<Report, ReporterError>;

  /// Invoked once the job reached Completed, Failed or Cancelled.
  async fn final_report(&self, params: &serde_json::Value, results: &FinalResults) -> Result<Report, ReporterError>;
}

/// Succeeds when every target of a run passed; the final report succeeds
/// when no target failed across all runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TargetSuccessReporter;

pub const TARGET_SUCCESS_REPORTER: &str = "targetsuccess";

#[async_trait]
impl Reporter for TargetSuccessReporter {
  fn name(&self) -> &str {
    TARGET_SUCCESS_REPORTER
  }

  async fn run_report(&self, _params: &serde_json::Value, result: &RunResult) -> Result<Report, ReporterError> {
    let success = result.acquisition_error.is_none() && result.failed.is_empty() && result.aborted.is_empty();
    Ok(Report {
      success,
      data: serde_json::json!({
        "run": result.run,
        "passed": result.passed.len(),
        "failed": result.failed.len(),
        "aborted": result.aborted.len(),
      }),
    })
  }

  async fn final_report(&self, _params: &serde_json::Value, results: &FinalResults) -> Result<Report, ReporterError> {
    Ok(Report {
      success: results.state == JobState::Completed && results.failed() == 0,
      data: serde_json::json!({
        "state": results.state.name(),
        "succeeded": results.succeeded(),
        "failed": results.failed(),
      }),
    })
  }
}
