// contest/src/core/target.rs

//! Defines the `Target` handle that flows through a job's step pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a unit under test, unique within a target manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
  pub fn new(id: impl Into<String>) -> Self {
    TargetId(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for TargetId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for TargetId {
  fn from(s: &str) -> Self {
    TargetId(s.to_string())
  }
}

/// An opaque handle to a unit under test.
///
/// The engine never interprets `manager_state`; it belongs to the target
/// manager that produced the target and is handed back on release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
  pub id: TargetId,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fqdn: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub manager_state: Option<serde_json::Value>,
}

impl Target {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: TargetId::new(id),
      fqdn: None,
      manager_state: None,
    }
  }

  pub fn with_fqdn(mut self, fqdn: impl Into<String>) -> Self {
    self.fqdn = Some(fqdn.into());
    self
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.fqdn {
      Some(fqdn) => write!(f, "Target{{ID: \"{}\", FQDN: \"{}\"}}", self.id, fqdn),
      None => write!(f, "Target{{ID: \"{}\"}}", self.id),
    }
  }
}
