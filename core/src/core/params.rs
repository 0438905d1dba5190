// contest/src/core/params.rs

//! Step parameters: a raw JSON object validated once before the pipeline
//! starts, decoded by each step into its own typed structure, and expanded
//! per target when it carries `{{ ... }}` templates.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::target::Target;
use crate::error::{ContestError, ContestResult, StepError};
use crate::functions::FunctionTable;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepParameters(Map<String, Value>);

impl StepParameters {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builds parameters from a JSON value, which must be an object (or null).
  pub fn from_value(value: Value) -> Result<Self, StepError> {
    match value {
      Value::Object(map) => Ok(StepParameters(map)),
      Value::Null => Ok(StepParameters::default()),
      other => Err(StepError::Parameters(format!(
        "step parameters must be a JSON object, got {}",
        other
      ))),
    }
  }

  pub fn with(mut self, name: &str, value: Value) -> Self {
    self.0.insert(name.to_string(), value);
    self
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.0.get(name)
  }

  pub fn get_str(&self, name: &str) -> Option<&str> {
    self.0.get(name).and_then(Value::as_str)
  }

  /// Returns the parameter or a `StepError::Parameters` naming the missing key.
  pub fn require(&self, name: &str) -> Result<&Value, StepError> {
    self
      .0
      .get(name)
      .ok_or_else(|| StepError::Parameters(format!("missing parameter '{}'", name)))
  }

  /// Decodes the whole parameter object into a step-defined type.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StepError> {
    serde_json::from_value(Value::Object(self.0.clone()))
      .map_err(|e| StepError::Parameters(format!("failed to deserialize parameters: {}", e)))
  }

  /// The untyped escape hatch.
  pub fn raw(&self) -> &Map<String, Value> {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Checks that every template only references known target fields and
  /// registered functions. Run once when the job is built.
  pub fn validate_templates(&self, functions: &FunctionTable) -> ContestResult<()> {
    let mut result = Ok(());
    visit_strings(&Value::Object(self.0.clone()), &mut |s| {
      if result.is_ok() {
        result = scan_templates(s).and_then(|exprs| {
          for expr in exprs {
            let tokens = tokenize(expr)?;
            if let Some(first) = tokens.first() {
              if !first.starts_with('.') && !functions.contains(first) {
                return Err(ContestError::FunctionNotFound { name: first.clone() });
              }
              for token in &tokens {
                if token.starts_with('.') {
                  target_field_name(token)?;
                }
              }
            }
          }
          Ok(())
        });
      }
    });
    result
  }

  /// Returns a copy with every `{{ ... }}` template resolved against `target`.
  ///
  /// `{{ .ID }}` and `{{ .FQDN }}` expand to target fields, `{{ fn a b }}`
  /// calls a user function with literal or field arguments.
  pub fn expand(&self, target: &Target, functions: &FunctionTable) -> ContestResult<StepParameters> {
    let mut expanded = Map::with_capacity(self.0.len());
    for (key, value) in &self.0 {
      expanded.insert(key.clone(), expand_value(value, target, functions)?);
    }
    Ok(StepParameters(expanded))
  }
}

fn visit_strings(value: &Value, f: &mut dyn FnMut(&str)) {
  match value {
    Value::String(s) => f(s),
    Value::Array(items) => items.iter().for_each(|v| visit_strings(v, f)),
    Value::Object(map) => map.values().for_each(|v| visit_strings(v, f)),
    _ => {}
  }
}

fn expand_value(value: &Value, target: &Target, functions: &FunctionTable) -> ContestResult<Value> {
  Ok(match value {
    Value::String(s) => Value::String(expand_str(s, target, functions)?),
    Value::Array(items) => Value::Array(
      items
        .iter()
        .map(|v| expand_value(v, target, functions))
        .collect::<ContestResult<Vec<_>>>()?,
    ),
    Value::Object(map) => {
      let mut out = Map::with_capacity(map.len());
      for (k, v) in map {
        out.insert(k.clone(), expand_value(v, target, functions)?);
      }
      Value::Object(out)
    }
    other => other.clone(),
  })
}

/// Returns the inner expressions of every `{{ ... }}` in `s`.
fn scan_templates(s: &str) -> ContestResult<Vec<&str>> {
  let mut exprs = Vec::new();
  let mut rest = s;
  while let Some(start) = rest.find("{{") {
    let after = &rest[start + 2..];
    let end = after
      .find("}}")
      .ok_or_else(|| template_error(s, "unterminated '{{'"))?;
    exprs.push(after[..end].trim());
    rest = &after[end + 2..];
  }
  Ok(exprs)
}

fn expand_str(s: &str, target: &Target, functions: &FunctionTable) -> ContestResult<String> {
  if !s.contains("{{") {
    return Ok(s.to_string());
  }
  let mut out = String::with_capacity(s.len());
  let mut rest = s;
  while let Some(start) = rest.find("{{") {
    out.push_str(&rest[..start]);
    let after = &rest[start + 2..];
    let end = after
      .find("}}")
      .ok_or_else(|| template_error(s, "unterminated '{{'"))?;
    out.push_str(&eval_expr(after[..end].trim(), target, functions)?);
    rest = &after[end + 2..];
  }
  out.push_str(rest);
  Ok(out)
}

fn eval_expr(expr: &str, target: &Target, functions: &FunctionTable) -> ContestResult<String> {
  let tokens = tokenize(expr)?;
  let (head, args) = tokens
    .split_first()
    .ok_or_else(|| template_error(expr, "empty template"))?;
  if head.starts_with('.') {
    if !args.is_empty() {
      return Err(template_error(expr, "a field reference takes no arguments"));
    }
    return resolve_field(head, target);
  }
  let args = args
    .iter()
    .map(|arg| {
      if arg.starts_with('.') {
        resolve_field(arg, target)
      } else {
        Ok(arg.clone())
      }
    })
    .collect::<ContestResult<Vec<_>>>()?;
  functions.call(head, &args)
}

fn tokenize(expr: &str) -> ContestResult<Vec<String>> {
  let mut tokens = Vec::new();
  let mut chars = expr.chars().peekable();
  while let Some(&c) = chars.peek() {
    if c.is_whitespace() {
      chars.next();
    } else if c == '"' {
      chars.next();
      let mut literal = String::new();
      let mut closed = false;
      for c in chars.by_ref() {
        if c == '"' {
          closed = true;
          break;
        }
        literal.push(c);
      }
      if !closed {
        return Err(template_error(expr, "unterminated string literal"));
      }
      tokens.push(literal);
    } else {
      let mut word = String::new();
      while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
          break;
        }
        word.push(c);
        chars.next();
      }
      tokens.push(word);
    }
  }
  Ok(tokens)
}

enum TargetField {
  Id,
  Fqdn,
}

fn target_field_name(token: &str) -> ContestResult<TargetField> {
  match token {
    ".ID" => Ok(TargetField::Id),
    ".FQDN" => Ok(TargetField::Fqdn),
    other => Err(template_error(other, "unknown target field")),
  }
}

fn resolve_field(token: &str, target: &Target) -> ContestResult<String> {
  Ok(match target_field_name(token)? {
    TargetField::Id => target.id.to_string(),
    TargetField::Fqdn => target.fqdn.clone().unwrap_or_default(),
  })
}

fn template_error(input: &str, message: &str) -> ContestError {
  ContestError::InvalidParameters {
    step: String::new(),
    message: format!("template '{}': {}", input, message),
  }
}
