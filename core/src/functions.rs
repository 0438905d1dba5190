// contest/src/functions.rs

//! User-defined functions callable from step parameter templates.
//!
//! A function receives its already-resolved string arguments and returns a
//! string, e.g. `{{ do_nothing .FQDN }}` inside a step parameter.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ContestError, ContestResult};

pub type UserFunction = Arc<dyn Fn(&[String]) -> Result<String> + Send + Sync>;

/// Name of the sample function that proves registration works.
pub const DO_NOTHING: &str = "do_nothing";

/// Lookup table from function name to callable.
#[derive(Clone, Default)]
pub struct FunctionTable {
  functions: HashMap<String, UserFunction>,
}

impl FunctionTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Table pre-loaded with the built-in functions.
  pub fn with_builtins() -> Self {
    let mut table = Self::new();
    table.insert(DO_NOTHING, Arc::new(do_nothing));
    table
  }

  /// Adds `function` under `name`. Fails if the name is already taken.
  pub fn register(&mut self, name: &str, function: UserFunction) -> ContestResult<()> {
    if self.functions.contains_key(name) {
      return Err(ContestError::Config(format!("user function '{}' already registered", name)));
    }
    self.insert(name, function);
    Ok(())
  }

  fn insert(&mut self, name: &str, function: UserFunction) {
    self.functions.insert(name.to_string(), function);
  }

  pub fn contains(&self, name: &str) -> bool {
    self.functions.contains_key(name)
  }

  pub fn call(&self, name: &str, args: &[String]) -> ContestResult<String> {
    let function = self
      .functions
      .get(name)
      .ok_or_else(|| ContestError::FunctionNotFound { name: name.to_string() })?;
    Ok(function(args)?)
  }

  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }
}

impl std::fmt::Debug for FunctionTable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FunctionTable").field("functions", &self.names()).finish()
  }
}

fn do_nothing(args: &[String]) -> Result<String> {
  match args.first() {
    Some(first) => Ok(first.clone()),
    None => bail!("do_nothing: no arg specified"),
  }
}
