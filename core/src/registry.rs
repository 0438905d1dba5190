// contest/src/registry.rs

//! Name-keyed registry of test step factories, reporters and user functions.
//!
//! Plugins are registered once at startup through [`PluginRegistryBuilder`];
//! the resulting [`PluginRegistry`] is immutable and cheap to share between
//! concurrently running jobs. Names are case-insensitive.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

use crate::core::step::{StepFactory, TestStep};
use crate::error::{ContestError, ContestResult};
use crate::functions::{FunctionTable, UserFunction};
use crate::reporter::{Reporter, TargetSuccessReporter};
use crate::steps::{NoopStep, SleepStep};

#[derive(Default)]
pub struct PluginRegistryBuilder {
  steps: HashMap<String, StepFactory>,
  reporters: HashMap<String, Arc<dyn Reporter>>,
  functions: FunctionTable,
}

impl PluginRegistryBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder pre-loaded with the steps, reporter and functions shipped with the crate.
  pub fn with_builtins() -> Self {
    let mut builder = Self {
      functions: FunctionTable::with_builtins(),
      ..Self::default()
    };
    builder.insert_step(NoopStep::NAME, Arc::new(|| Arc::new(NoopStep) as Arc<dyn TestStep>));
    builder.insert_step(SleepStep::NAME, Arc::new(|| Arc::new(SleepStep) as Arc<dyn TestStep>));
    builder
      .reporters
      .insert(normalize(TargetSuccessReporter.name()), Arc::new(TargetSuccessReporter));
    builder
  }

  /// Registers a step factory. A fresh instance is created for every job.
  pub fn register_step(&mut self, name: &str, factory: StepFactory) -> ContestResult<&mut Self> {
    let key = normalize(name);
    if key.is_empty() {
      return Err(ContestError::Config("test step name cannot be empty".to_string()));
    }
    if self.steps.contains_key(&key) {
      return Err(ContestError::Config(format!("test step '{}' already registered", name)));
    }
    event!(Level::DEBUG, step = %key, "Registering test step.");
    self.insert_step(&key, factory);
    Ok(self)
  }

  pub fn register_reporter(&mut self, reporter: Arc<dyn Reporter>) -> ContestResult<&mut Self> {
    let key = normalize(reporter.name());
    if key.is_empty() {
      return Err(ContestError::Config("reporter name cannot be empty".to_string()));
    }
    if self.reporters.contains_key(&key) {
      return Err(ContestError::Config(format!("reporter '{}' already registered", key)));
    }
    event!(Level::DEBUG, reporter = %key, "Registering reporter.");
    self.reporters.insert(key, reporter);
    Ok(self)
  }

  pub fn register_function(&mut self, name: &str, function: UserFunction) -> ContestResult<&mut Self> {
    self.functions.register(name, function)?;
    event!(Level::DEBUG, function = %name, "Registering user function.");
    Ok(self)
  }

  pub fn build(self) -> PluginRegistry {
    PluginRegistry {
      steps: self.steps,
      reporters: self.reporters,
      functions: Arc::new(self.functions),
    }
  }

  fn insert_step(&mut self, name: &str, factory: StepFactory) {
    self.steps.insert(normalize(name), factory);
  }
}

/// Immutable plugin lookup used to turn descriptors into jobs.
#[derive(Clone)]
pub struct PluginRegistry {
  steps: HashMap<String, StepFactory>,
  reporters: HashMap<String, Arc<dyn Reporter>>,
  functions: Arc<FunctionTable>,
}

impl PluginRegistry {
  pub fn builder() -> PluginRegistryBuilder {
    PluginRegistryBuilder::new()
  }

  /// Instantiates the step registered under `name`.
  pub fn new_step(&self, name: &str) -> ContestResult<Arc<dyn TestStep>> {
    let factory = self.steps.get(&normalize(name)).ok_or_else(|| {
      event!(Level::WARN, step = %name, "Unknown test step requested.");
      ContestError::StepNotFound { name: name.to_string() }
    })?;
    Ok(factory())
  }

  pub fn reporter(&self, name: &str) -> ContestResult<Arc<dyn Reporter>> {
    self
      .reporters
      .get(&normalize(name))
      .cloned()
      .ok_or_else(|| ContestError::ReporterNotFound { name: name.to_string() })
  }

  pub fn functions(&self) -> Arc<FunctionTable> {
    self.functions.clone()
  }

  pub fn step_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.steps.keys().cloned().collect();
    names.sort();
    names
  }

  pub fn reporter_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.reporters.keys().cloned().collect();
    names.sort();
    names
  }
}

impl std::fmt::Debug for PluginRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PluginRegistry")
      .field("steps", &self.step_names())
      .field("reporters", &self.reporter_names())
      .field("functions", &self.functions.names())
      .finish()
  }
}

fn normalize(name: &str) -> String {
  name.trim().to_lowercase()
}
