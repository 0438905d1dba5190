// contest/src/core/variables.rs

//! Variables that a step attaches to a target so that later steps can read them.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::core::target::TargetId;
use crate::error::StepError;

type VarKey = (String, String); // (step label, variable name)

/// Per-target variable store shared by every step of a job.
///
/// Variables are scoped by the label of the step that wrote them, so two steps
/// may use the same variable name without clobbering each other.
///
/// IMPORTANT: guards are taken and dropped inside each method; nothing here is
/// held across an `.await`.
#[derive(Debug, Default, Clone)]
pub struct StepsVariables(Arc<RwLock<HashMap<TargetId, HashMap<VarKey, serde_json::Value>>>>);

impl StepsVariables {
  pub fn new() -> Self {
    Self::default()
  }

  /// Rebuilds a store from a snapshot taken with [`StepsVariables::snapshot`].
  pub fn restore(snapshot: &BTreeMap<String, BTreeMap<String, serde_json::Value>>) -> Self {
    let mut data = HashMap::new();
    for (target, vars) in snapshot {
      let mut per_target = HashMap::new();
      for (scoped_name, value) in vars {
        if let Some((label, name)) = scoped_name.rsplit_once('.') {
          per_target.insert((label.to_string(), name.to_string()), value.clone());
        }
      }
      data.insert(TargetId::new(target.clone()), per_target);
    }
    StepsVariables(Arc::new(RwLock::new(data)))
  }

  /// Serializable copy of every variable, keyed by target id then `label.name`.
  pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, serde_json::Value>> {
    let guard = self.0.read();
    guard
      .iter()
      .map(|(target, vars)| {
        let vars = vars
          .iter()
          .map(|((label, name), value)| (format!("{}.{}", label, name), value.clone()))
          .collect();
        (target.to_string(), vars)
      })
      .collect()
  }

  /// Returns a handle that writes under `step_label`.
  pub fn for_step(&self, step_label: &str) -> StepVariables {
    StepVariables {
      store: self.clone(),
      step_label: step_label.to_string(),
    }
  }

  pub fn get(&self, target: &TargetId, step_label: &str, name: &str) -> Option<serde_json::Value> {
    self
      .0
      .read()
      .get(target)
      .and_then(|vars| vars.get(&(step_label.to_string(), name.to_string())))
      .cloned()
  }

  fn add(&self, target: &TargetId, step_label: &str, name: &str, value: serde_json::Value) -> Result<(), StepError> {
    validate_variable_name(name)?;
    self
      .0
      .write()
      .entry(target.clone())
      .or_default()
      .insert((step_label.to_string(), name.to_string()), value);
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.0.read().values().map(HashMap::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// A step-scoped view over [`StepsVariables`].
#[derive(Debug, Clone)]
pub struct StepVariables {
  store: StepsVariables,
  step_label: String,
}

impl StepVariables {
  /// Sets `name` for `target` under this step's label.
  pub fn add(&self, target: &TargetId, name: &str, value: serde_json::Value) -> Result<(), StepError> {
    self.store.add(target, &self.step_label, name, value)
  }

  /// Reads a variable written by the step labelled `step_label`.
  pub fn get(&self, target: &TargetId, step_label: &str, name: &str) -> Option<serde_json::Value> {
    self.store.get(target, step_label, name)
  }

  pub fn step_label(&self) -> &str {
    &self.step_label
  }
}

fn validate_variable_name(name: &str) -> Result<(), StepError> {
  let mut chars = name.chars();
  let valid = match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
    _ => false,
  };
  if valid {
    Ok(())
  } else {
    Err(StepError::Target(format!("invalid variable name '{}'", name)))
  }
}
