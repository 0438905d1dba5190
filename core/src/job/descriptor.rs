// contest/src/job/descriptor.rs

//! The job descriptor: the JSON document a client submits to create a job.
//!
//! A descriptor is checked in two passes. `validate` and `check_version`
//! look at the document alone; `build` resolves every plugin name through a
//! [`PluginRegistry`] and yields the `Job` the orchestrator runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{event, instrument, Level};

use crate::config::EngineConfig;
use crate::core::params::StepParameters;
use crate::core::step::StepBundle;
use crate::error::{ContestError, ContestResult};
use crate::job::{Job, JobId, ReporterBundle};
use crate::registry::PluginRegistry;

/// Bumped on breaking descriptor changes.
pub const JOB_DESCRIPTOR_MAJOR_VERSION: u32 = 1;
/// Bumped on backwards compatible descriptor changes.
pub const JOB_DESCRIPTOR_MINOR_VERSION: u32 = 0;

/// Descriptor version this build speaks, e.g. `"1.0"`.
pub fn current_descriptor_version() -> String {
  format!("{}.{}", JOB_DESCRIPTOR_MAJOR_VERSION, JOB_DESCRIPTOR_MINOR_VERSION)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestStepDescriptor {
  pub name: String,
  #[serde(default)]
  pub label: String,
  #[serde(default)]
  pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReporterDescriptor {
  pub name: String,
  #[serde(default)]
  pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Reporting {
  #[serde(default)]
  pub run_reporters: Vec<ReporterDescriptor>,
  #[serde(default)]
  pub final_reporters: Vec<ReporterDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Descriptor {
  pub job_name: String,
  #[serde(default)]
  pub version: String,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub runs: u32,
  /// Duration string such as `"30s"` or `"1h30m"`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub run_interval: Option<String>,
  #[serde(default)]
  pub test_step_descriptors: Vec<TestStepDescriptor>,
  #[serde(default)]
  pub reporting: Reporting,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_manager_acquire_timeout: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_manager_release_timeout: Option<String>,
  /// Handed to the target manager untouched.
  #[serde(default)]
  pub target_manager_parameters: serde_json::Value,
}

impl Descriptor {
  pub fn from_json(raw: &str) -> ContestResult<Self> {
    serde_json::from_str(raw).map_err(|e| ContestError::InvalidDescriptor(format!("malformed job descriptor: {}", e)))
  }

  /// Sanity checks that need nothing but the descriptor.
  pub fn validate(&self) -> ContestResult<()> {
    if self.test_step_descriptors.is_empty() {
      return Err(invalid("need at least one TestDescriptor in the JobDescriptor"));
    }
    if self.job_name.is_empty() {
      return Err(invalid("job name cannot be empty"));
    }
    if let Some(raw) = &self.run_interval {
      let (negative, _) = parse_signed_duration(raw).map_err(|e| invalid(format!("invalid run interval: {}", e)))?;
      if negative {
        return Err(invalid("run interval must be non-negative"));
      }
    }
    if self.reporting.run_reporters.is_empty() && self.reporting.final_reporters.is_empty() {
      return Err(invalid(
        "at least one run reporter or one final reporter must be specified in a job",
      ));
    }
    if self.reporting.run_reporters.iter().any(|r| r.name.trim().is_empty()) {
      return Err(invalid("run reporters cannot have empty or all-whitespace names"));
    }
    for (index, step) in self.test_step_descriptors.iter().enumerate() {
      if step.name.trim().is_empty() {
        return Err(invalid(format!("test step descriptor #{} has an empty name", index)));
      }
    }
    Ok(())
  }

  /// Checks `version` against the supported `MAJOR.MINOR`: the major number
  /// must match and the minor number must not be ahead.
  pub fn check_version(&self) -> ContestResult<()> {
    if self.version.is_empty() {
      return Err(ContestError::Version("Empty Job Descriptor Version Field".to_string()));
    }
    let parts: Vec<&str> = self.version.split('.').collect();
    if parts.len() != 2 {
      return Err(ContestError::Version(format!(
        "Incorrect Job Descriptor Version {}",
        self.version
      )));
    }
    let major: i64 = parts[0].parse().map_err(|e| ContestError::Version(format!("{}", e)))?;
    let minor: i64 = parts[1].parse().map_err(|e| ContestError::Version(format!("{}", e)))?;

    if major != JOB_DESCRIPTOR_MAJOR_VERSION as i64 || minor > JOB_DESCRIPTOR_MINOR_VERSION as i64 {
      return Err(ContestError::Version(format!(
        "The Job Descriptor Version {} is not compatible with the server: {}",
        self.version,
        current_descriptor_version()
      )));
    }
    Ok(())
  }

  /// Validates the descriptor and instantiates its steps and reporters.
  ///
  /// Step labels default to the step name. Target manager timeouts left
  /// unset fall back to the engine defaults.
  #[instrument(name = "Descriptor::build", skip_all, fields(job_id = %id, job_name = %self.job_name), err(Display))]
  pub fn build(&self, id: JobId, registry: &PluginRegistry, config: &EngineConfig) -> ContestResult<Job> {
    self.validate()?;
    self.check_version()?;
    let functions = registry.functions();

    let mut steps = Vec::with_capacity(self.test_step_descriptors.len());
    for desc in &self.test_step_descriptors {
      let label = if desc.label.trim().is_empty() {
        desc.name.clone()
      } else {
        desc.label.clone()
      };
      let step = registry.new_step(&desc.name)?;
      let to_invalid = |e: crate::error::StepError| ContestError::InvalidParameters {
        step: label.clone(),
        message: e.to_string(),
      };
      let parameters = StepParameters::from_value(desc.parameters.clone()).map_err(to_invalid)?;
      step.validate_parameters(&parameters).map_err(to_invalid)?;
      parameters.validate_templates(&functions)?;
      steps.push(StepBundle::new(label, step, parameters));
    }

    let mut run_reporters = Vec::with_capacity(self.reporting.run_reporters.len());
    for desc in &self.reporting.run_reporters {
      let reporter = registry.reporter(&desc.name)?;
      reporter
        .validate_run_parameters(&desc.parameters)
        .map_err(|e| invalid(format!("run reporter '{}': {}", desc.name, e)))?;
      run_reporters.push(ReporterBundle::new(reporter, desc.parameters.clone()));
    }
    let mut final_reporters = Vec::with_capacity(self.reporting.final_reporters.len());
    for desc in &self.reporting.final_reporters {
      let reporter = registry.reporter(&desc.name)?;
      reporter
        .validate_final_parameters(&desc.parameters)
        .map_err(|e| invalid(format!("final reporter '{}': {}", desc.name, e)))?;
      final_reporters.push(ReporterBundle::new(reporter, desc.parameters.clone()));
    }

    let job = Job {
      id,
      name: self.job_name.clone(),
      tags: self.tags.clone(),
      runs: self.runs,
      run_interval: optional_duration("run interval", &self.run_interval, Duration::ZERO)?,
      target_manager_acquire_timeout: optional_duration(
        "target manager acquire timeout",
        &self.target_manager_acquire_timeout,
        config.default_acquire_timeout,
      )?,
      target_manager_release_timeout: optional_duration(
        "target manager release timeout",
        &self.target_manager_release_timeout,
        config.default_release_timeout,
      )?,
      acquire_parameters: self.target_manager_parameters.clone(),
      steps,
      run_reporters,
      final_reporters,
    };
    job.validate()?;
    event!(Level::DEBUG, steps = job.steps.len(), runs = job.runs, "Job built from descriptor.");
    Ok(job)
  }
}

fn invalid(msg: impl Into<String>) -> ContestError {
  ContestError::InvalidDescriptor(msg.into())
}

fn optional_duration(what: &str, raw: &Option<String>, default: Duration) -> ContestResult<Duration> {
  match raw {
    None => Ok(default),
    Some(raw) => parse_duration(raw).map_err(|e| invalid(format!("invalid {}: {}", what, e))),
  }
}

/// Parses a non-negative duration string: `"0"`, `"150ms"`, `"1.5s"`, `"1h2m3s"`.
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
  match parse_signed_duration(raw)? {
    (true, d) if !d.is_zero() => Err(format!("duration '{}' is negative", raw)),
    (_, d) => Ok(d),
  }
}

fn parse_signed_duration(raw: &str) -> Result<(bool, Duration), String> {
  let s = raw.trim();
  let (negative, mut rest) = match s.as_bytes().first() {
    Some(b'-') => (true, &s[1..]),
    Some(b'+') => (false, &s[1..]),
    _ => (false, s),
  };
  if rest == "0" {
    return Ok((negative, Duration::ZERO));
  }
  if rest.is_empty() {
    return Err(format!("invalid duration '{}'", raw));
  }

  let mut total_nanos: f64 = 0.0;
  while !rest.is_empty() {
    let number_len = rest
      .find(|c: char| !(c.is_ascii_digit() || c == '.'))
      .ok_or_else(|| format!("missing unit in duration '{}'", raw))?;
    if number_len == 0 {
      return Err(format!("invalid duration '{}'", raw));
    }
    let value: f64 = rest[..number_len]
      .parse()
      .map_err(|_| format!("invalid duration '{}'", raw))?;
    rest = &rest[number_len..];

    let unit_len = rest
      .find(|c: char| c.is_ascii_digit() || c == '.')
      .unwrap_or(rest.len());
    let nanos_per_unit = match &rest[..unit_len] {
      "ns" => 1.0,
      "us" | "µs" => 1e3,
      "ms" => 1e6,
      "s" => 1e9,
      "m" => 60e9,
      "h" => 3600e9,
      other => return Err(format!("unknown unit '{}' in duration '{}'", other, raw)),
    };
    total_nanos += value * nanos_per_unit;
    rest = &rest[unit_len..];
  }
  if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
    return Err(format!("duration '{}' is out of range", raw));
  }
  Ok((negative, Duration::from_nanos(total_nanos.round() as u64)))
}
