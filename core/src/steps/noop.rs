// contest/src/steps/noop.rs

use async_trait::async_trait;

use crate::core::{Checkpoint, StepContext, StepEmitter, StepParameters, StepRun, StepVariables, Target, TestStep};
use crate::error::StepError;

/// Passes every target straight through. Accepts no parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStep;

impl NoopStep {
  pub const NAME: &'static str = "noop";
}

#[async_trait]
impl TestStep for NoopStep {
  fn name(&self) -> &str {
    Self::NAME
  }

  fn validate_parameters(&self, params: &StepParameters) -> Result<(), StepError> {
    if params.is_empty() {
      Ok(())
    } else {
      Err(StepError::Parameters("noop takes no parameters".to_string()))
    }
  }

  async fn run(
    &self,
    _ctx: &StepContext,
    _target: &Target,
    _emitter: &StepEmitter,
    _variables: &StepVariables,
    _params: &StepParameters,
    _resume: Option<Checkpoint>,
  ) -> Result<StepRun, StepError> {
    Ok(StepRun::Done)
  }
}
