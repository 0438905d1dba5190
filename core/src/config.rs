// contest/src/config.rs

//! Engine-wide tunables.
//!
//! Defaults are sane for tests and small labs. `EngineConfig::from_env` reads
//! `CONTEST_*` overrides (a `.env` file is honoured when present).

use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::{ContestError, ContestResult};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Capacity of every bounded channel between two step runners.
  pub channel_capacity: usize,
  /// Upper bound of concurrent step invocations per step.
  pub step_parallelism: usize,
  /// How long a step invocation may keep running after a stop request.
  pub step_grace_period: Duration,
  /// Deadline for a pause to quiesce every in-flight target.
  pub pause_timeout: Duration,
  /// Deadline for a cancel to quiesce every in-flight target.
  pub cancel_timeout: Duration,
  /// Retries of a step invocation that failed with a transport error.
  pub max_transport_retries: u32,
  pub transport_retry_backoff: Duration,
  /// Wait before re-invoking a step that suspended itself outside a pause.
  pub suspend_backoff: Duration,
  /// Used by descriptors that leave the target manager timeouts unset.
  pub default_acquire_timeout: Duration,
  pub default_release_timeout: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      channel_capacity: 16,
      step_parallelism: 8,
      step_grace_period: Duration::from_secs(5),
      pause_timeout: Duration::from_secs(30),
      cancel_timeout: Duration::from_secs(30),
      max_transport_retries: 3,
      transport_retry_backoff: Duration::from_millis(100),
      suspend_backoff: Duration::from_secs(1),
      default_acquire_timeout: Duration::from_secs(60),
      default_release_timeout: Duration::from_secs(60),
    }
  }
}

impl EngineConfig {
  /// Defaults overlaid with any `CONTEST_*` environment variable that is set.
  ///
  /// Durations are given in milliseconds, e.g. `CONTEST_PAUSE_TIMEOUT_MS=5000`.
  pub fn from_env() -> ContestResult<Self> {
    dotenvy::dotenv().ok();
    let defaults = Self::default();

    let config = Self {
      channel_capacity: env_parse("CONTEST_CHANNEL_CAPACITY", defaults.channel_capacity)?,
      step_parallelism: env_parse("CONTEST_STEP_PARALLELISM", defaults.step_parallelism)?,
      step_grace_period: env_millis("CONTEST_STEP_GRACE_PERIOD_MS", defaults.step_grace_period)?,
      pause_timeout: env_millis("CONTEST_PAUSE_TIMEOUT_MS", defaults.pause_timeout)?,
      cancel_timeout: env_millis("CONTEST_CANCEL_TIMEOUT_MS", defaults.cancel_timeout)?,
      max_transport_retries: env_parse("CONTEST_MAX_TRANSPORT_RETRIES", defaults.max_transport_retries)?,
      transport_retry_backoff: env_millis("CONTEST_TRANSPORT_RETRY_BACKOFF_MS", defaults.transport_retry_backoff)?,
      suspend_backoff: env_millis("CONTEST_SUSPEND_BACKOFF_MS", defaults.suspend_backoff)?,
      default_acquire_timeout: env_millis("CONTEST_ACQUIRE_TIMEOUT_MS", defaults.default_acquire_timeout)?,
      default_release_timeout: env_millis("CONTEST_RELEASE_TIMEOUT_MS", defaults.default_release_timeout)?,
    };
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> ContestResult<()> {
    if self.channel_capacity == 0 {
      return Err(ContestError::Config("channel_capacity must be greater than zero".to_string()));
    }
    if self.step_parallelism == 0 {
      return Err(ContestError::Config("step_parallelism must be greater than zero".to_string()));
    }
    let durations = [
      ("pause_timeout", self.pause_timeout),
      ("cancel_timeout", self.cancel_timeout),
      ("default_acquire_timeout", self.default_acquire_timeout),
      ("default_release_timeout", self.default_release_timeout),
    ];
    for (name, value) in durations {
      if value.is_zero() {
        return Err(ContestError::Config(format!("{} must be greater than zero", name)));
      }
    }
    Ok(())
  }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> ContestResult<T>
where
  T::Err: std::fmt::Display,
{
  match env::var(key) {
    Ok(raw) => raw
      .trim()
      .parse()
      .map_err(|e| ContestError::Config(format!("{}='{}' is invalid: {}", key, raw, e))),
    Err(_) => Ok(default),
  }
}

fn env_millis(key: &str, default: Duration) -> ContestResult<Duration> {
  let millis = env_parse(key, default.as_millis() as u64)?;
  Ok(Duration::from_millis(millis))
}
