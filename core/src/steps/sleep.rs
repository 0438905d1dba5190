// contest/src/steps/sleep.rs

//! Waits a fixed time per target. When the job is paused mid-wait the step
//! checkpoints the time still owed, so a resumed job finishes the wait
//! instead of starting it over.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::{
  Checkpoint, StepContext, StepEmitter, StepParameters, StepRun, StepVariables, StopReason, Target, TestStep,
};
use crate::error::StepError;
use crate::job::descriptor::parse_duration;

pub const EVENT_SLEEP_STARTED: &str = "SleepStarted";
pub const EVENT_SLEEP_FINISHED: &str = "SleepFinished";

#[derive(Debug, Default, Clone, Copy)]
pub struct SleepStep;

impl SleepStep {
  pub const NAME: &'static str = "sleep";
}

#[derive(Debug, Deserialize)]
struct SleepParams {
  duration: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SleepCheckpoint {
  remaining_ms: u64,
}

fn duration_of(params: &StepParameters) -> Result<Duration, StepError> {
  let p: SleepParams = params.decode()?;
  parse_duration(&p.duration).map_err(StepError::Parameters)
}

#[async_trait]
impl TestStep for SleepStep {
  fn name(&self) -> &str {
    Self::NAME
  }

  fn events(&self) -> &[&'static str] {
    &[EVENT_SLEEP_STARTED, EVENT_SLEEP_FINISHED]
  }

  fn validate_parameters(&self, params: &StepParameters) -> Result<(), StepError> {
    duration_of(params).map(|_| ())
  }

  async fn run(
    &self,
    ctx: &StepContext,
    target: &Target,
    emitter: &StepEmitter,
    variables: &StepVariables,
    params: &StepParameters,
    resume: Option<Checkpoint>,
  ) -> Result<StepRun, StepError> {
    let total = duration_of(params)?;
    let owed = match resume {
      Some(cp) => {
        let saved: SleepCheckpoint = serde_json::from_slice(cp.as_bytes())
          .map_err(|e| StepError::Fatal(format!("corrupt sleep checkpoint: {}", e)))?;
        Duration::from_millis(saved.remaining_ms)
      }
      None => total,
    };

    emitter
      .emit(EVENT_SLEEP_STARTED, Some(&target.id), Some(serde_json::json!({ "ms": owed.as_millis() as u64 })))
      .map_err(|e| StepError::Fatal(e.to_string()))?;

    let deadline = Instant::now() + owed;
    tokio::select! {
      _ = tokio::time::sleep_until(deadline) => {}
      _ = ctx.stopped() => {
        let remaining = deadline.saturating_duration_since(Instant::now());
        return match ctx.stop_reason() {
          Some(StopReason::Pause) => {
            let bytes = serde_json::to_vec(&SleepCheckpoint { remaining_ms: remaining.as_millis() as u64 })
              .map_err(|e| StepError::Fatal(e.to_string()))?;
            Ok(StepRun::Suspend(Checkpoint::new(bytes)))
          }
          _ => Err(StepError::target("sleep interrupted")),
        };
      }
    }

    variables.add(&target.id, "slept_ms", serde_json::json!(total.as_millis() as u64))?;
    emitter
      .emit(EVENT_SLEEP_FINISHED, Some(&target.id), None)
      .map_err(|e| StepError::Fatal(e.to_string()))?;
    Ok(StepRun::Done)
  }
}
