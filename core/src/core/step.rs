// contest/src/core/step.rs

//! The test step plugin contract.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::checkpoint::Checkpoint;
use crate::core::control::StepContext;
use crate::core::event::StepEmitter;
use crate::core::params::StepParameters;
use crate::core::target::Target;
use crate::core::variables::StepVariables;
use crate::error::StepError;

/// Successful return of [`TestStep::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepRun {
  /// The step is finished with this target; it moves on to the next step.
  Done,
  /// Not yet done. The runner hands the checkpoint back to the same step on
  /// the next invocation for this target, either after a short back-off or
  /// after the job is resumed from a pause.
  Suspend(Checkpoint),
}

/// A pluggable unit of work applied to every target in pipeline order.
///
/// The runner owns the pipeline channels; a step is invoked once per target
/// it has to process (possibly concurrently for distinct targets) and returns
/// either `Done`, a checkpoint, or a classified [`StepError`].
///
/// Implementations must honour `ctx.is_stopping()`: when a pause is requested
/// they should return `StepRun::Suspend` with whatever they need to continue,
/// within the job's grace period. Invocations that overrun the grace period
/// are dropped.
#[async_trait]
pub trait TestStep: Send + Sync {
  /// Name used to look this step up in the registry.
  fn name(&self) -> &str;

  /// Event names this step may emit through its [`StepEmitter`].
  fn events(&self) -> &[&'static str] {
    &[]
  }

  fn validate_parameters(&self, params: &StepParameters) -> Result<(), StepError>;

  async fn run(
    &self,
    ctx: &StepContext,
    target: &Target,
    emitter: &StepEmitter,
    variables: &StepVariables,
    params: &StepParameters,
    resume: Option<Checkpoint>,
  ) -> Result<StepRun, StepError>;
}

pub type StepFactory = Arc<dyn Fn() -> Arc<dyn TestStep> + Send + Sync>;

/// A step instance as it sits in a job: the plugin, its unique label and its
/// validated parameters.
#[derive(Clone)]
pub struct StepBundle {
  pub label: String,
  pub step: Arc<dyn TestStep>,
  pub parameters: StepParameters,
}

impl StepBundle {
  pub fn new(label: impl Into<String>, step: Arc<dyn TestStep>, parameters: StepParameters) -> Self {
    Self {
      label: label.into(),
      step,
      parameters,
    }
  }
}

impl std::fmt::Debug for StepBundle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StepBundle")
      .field("label", &self.label)
      .field("step", &self.step.name())
      .field("parameters", &self.parameters)
      .finish()
  }
}
