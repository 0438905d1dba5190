// contest/src/pipeline/runner.rs

//! Drives one test step for one run: receives targets from its input
//! channel, invokes the step once per target (up to `step_parallelism` at a
//! time), and forwards, reports or parks each target.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{event, instrument, Level};

use crate::config::EngineConfig;
use crate::core::checkpoint::{Checkpoint, TargetCheckpoint};
use crate::core::control::{JobSignal, StepContext, StopReason, TargetOutcome};
use crate::core::event::{
  Event, EventSink, StepEmitter, EVENT_TARGET_ERR, EVENT_TARGET_IN, EVENT_TARGET_OUT, EVENT_TARGET_SUSPENDED,
};
use crate::core::step::{StepBundle, StepRun};
use crate::core::target::TargetId;
use crate::core::variables::StepsVariables;
use crate::error::StepError;
use crate::functions::FunctionTable;
use crate::job::JobId;
use crate::pipeline::topology::{park, send_report, StepLinks, StepReport, TargetToken};
use crate::target_manager::InFlightSet;

/// Knobs a runner takes from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunnerLimits {
  pub parallelism: usize,
  pub grace_period: Duration,
  pub max_transport_retries: u32,
  pub transport_retry_backoff: Duration,
  pub suspend_backoff: Duration,
}

impl From<&EngineConfig> for RunnerLimits {
  fn from(config: &EngineConfig) -> Self {
    Self {
      parallelism: config.step_parallelism.max(1),
      grace_period: config.step_grace_period,
      max_transport_retries: config.max_transport_retries,
      transport_retry_backoff: config.transport_retry_backoff,
      suspend_backoff: config.suspend_backoff,
    }
  }
}

/// Everything a runner shares with the rest of the run.
#[derive(Clone)]
pub(crate) struct RunnerShared {
  pub job_id: JobId,
  pub run: u32,
  pub signal: JobSignal,
  pub sink: Arc<dyn EventSink>,
  pub variables: StepsVariables,
  pub functions: Arc<FunctionTable>,
  pub inflight: Arc<InFlightSet>,
  pub limits: RunnerLimits,
}

/// How one per-target invocation ended.
#[derive(Debug)]
enum Verdict {
  Done,
  Failed(StepError),
  Fatal(StepError),
  Suspended(Option<Checkpoint>),
  Aborted,
}

pub(crate) struct StepRunner {
  index: usize,
  bundle: StepBundle,
  shared: RunnerShared,
}

impl StepRunner {
  pub fn new(index: usize, bundle: StepBundle, shared: RunnerShared) -> Self {
    Self { index, bundle, shared }
  }

  /// Runs until the input channel is closed and every spawned invocation
  /// has been accounted for. Dropping the output sender on return is what
  /// closes the next step's input.
  #[instrument(
    name = "StepRunner::run",
    skip_all,
    fields(job_id = %self.shared.job_id, run = self.shared.run, step = %self.bundle.label, index = self.index)
  )]
  pub async fn run(self, links: StepLinks, reports: mpsc::UnboundedSender<StepReport>) {
    let StepLinks { mut input, output } = links;
    let this = Arc::new(self);
    let signal = this.shared.signal.clone();
    let mut tasks: JoinSet<Verdict> = JoinSet::new();
    let mut owned: HashMap<tokio::task::Id, TargetToken> = HashMap::new();
    let mut input_closed = false;
    event!(Level::DEBUG, "Step runner started.");

    loop {
      if input_closed && tasks.is_empty() {
        break;
      }
      let stopping = signal.is_stopping();
      let has_capacity = tasks.len() < this.shared.limits.parallelism;

      tokio::select! {
        biased;
        _ = signal.stopped(), if !stopping => {
          event!(Level::DEBUG, reason = ?signal.stop_reason(), "Step runner observed stop request.");
        }
        Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
          let (id, verdict) = match joined {
            Ok((id, verdict)) => (id, verdict),
            Err(err) => {
              event!(Level::ERROR, error = %err, "Step invocation panicked or was aborted.");
              let verdict = if err.is_cancelled() {
                Verdict::Aborted
              } else {
                Verdict::Failed(StepError::target(format!("step invocation panicked: {}", err)))
              };
              (err.id(), verdict)
            }
          };
          if let Some(token) = owned.remove(&id) {
            this.settle(token, verdict, &output, &reports).await;
          }
        }
        received = input.recv(), if !input_closed && (stopping || has_capacity) => {
          match received {
            None => input_closed = true,
            Some(token) if signal.is_stopping() => {
              send_report(&reports, park(&signal, this.index, &this.bundle.label, token));
            }
            Some(token) => {
              let worker = this.clone();
              let task_token = token.clone();
              let handle = tasks.spawn(async move { worker.process(task_token).await });
              owned.insert(handle.id(), token);
            }
          }
        }
      }
    }
    event!(Level::DEBUG, "Step runner finished.");
  }

  /// Routes a finished invocation's target to where it belongs.
  async fn settle(
    &self,
    token: TargetToken,
    verdict: Verdict,
    output: &mpsc::Sender<TargetToken>,
    reports: &mpsc::UnboundedSender<StepReport>,
  ) {
    let label = &self.bundle.label;
    let target = token.target;
    let report = match verdict {
      Verdict::Done => {
        self.shared.inflight.advance(&target.id, self.index + 1);
        match output.send(TargetToken::new(target)).await {
          Ok(()) => return,
          Err(mpsc::error::SendError(lost)) => {
            event!(Level::WARN, target = %lost.target.id, "Downstream closed; target aborted.");
            StepReport::Finished {
              target: lost.target,
              outcome: TargetOutcome::Aborted { step: label.clone() },
            }
          }
        }
      }
      Verdict::Failed(error) => StepReport::Finished {
        target,
        outcome: TargetOutcome::Failed {
          step: label.clone(),
          error,
        },
      },
      Verdict::Fatal(error) => StepReport::Fatal {
        target,
        step: label.clone(),
        error,
      },
      Verdict::Suspended(state) => {
        self.emit(
          EVENT_TARGET_SUSPENDED,
          &target.id,
          Some(serde_json::json!({ "checkpoint": state.is_some() })),
        );
        StepReport::Finished {
          target: target.clone(),
          outcome: TargetOutcome::Suspended(TargetCheckpoint {
            target,
            step_index: self.index,
            step_label: label.clone(),
            state,
          }),
        }
      }
      Verdict::Aborted => StepReport::Finished {
        target,
        outcome: TargetOutcome::Aborted { step: label.clone() },
      },
    };
    send_report(reports, report);
  }

  fn emit(&self, name: &str, target: &TargetId, payload: Option<serde_json::Value>) {
    let mut e = Event::new(self.shared.job_id, name)
      .run(self.shared.run)
      .step(self.bundle.label.clone())
      .target(target.clone());
    if let Some(payload) = payload {
      e = e.payload(payload);
    }
    self.shared.sink.emit(e);
  }

  /// What a stop turns an unfinished target into.
  fn stopped_verdict(&self, checkpoint: Option<Checkpoint>) -> Verdict {
    match self.shared.signal.stop_reason() {
      Some(StopReason::Pause) => Verdict::Suspended(checkpoint),
      _ => Verdict::Aborted,
    }
  }

  /// One target through this step, including suspend back-offs and
  /// transport retries.
  async fn process(&self, token: TargetToken) -> Verdict {
    let shared = &self.shared;
    let signal = &shared.signal;
    let step = &self.bundle.step;
    let target = &token.target;

    let params = match self.bundle.parameters.expand(target, &shared.functions) {
      Ok(params) => params,
      Err(err) => return Verdict::Fatal(StepError::Parameters(err.to_string())),
    };
    let ctx = StepContext {
      job_id: shared.job_id,
      run: shared.run,
      step_label: self.bundle.label.clone(),
      target_id: target.id.clone(),
      signal: signal.clone(),
    };
    let emitter = StepEmitter::new(
      shared.sink.clone(),
      shared.job_id,
      shared.run,
      self.bundle.label.clone(),
      Arc::from(step.events().to_vec()),
    );
    let variables = shared.variables.for_step(&self.bundle.label);

    let mut checkpoint = token.checkpoint.clone();
    let mut attempts = 0u32;
    self.emit(EVENT_TARGET_IN, &target.id, None);

    loop {
      let invocation = step.run(&ctx, target, &emitter, &variables, &params, checkpoint.clone());
      let result = tokio::select! {
        result = invocation => result,
        _ = signal.grace_expired(shared.limits.grace_period) => {
          event!(Level::WARN, target = %target.id, step = %self.bundle.label, "Step overran its grace period; invocation dropped.");
          return self.stopped_verdict(checkpoint);
        }
      };

      match result {
        Ok(StepRun::Done) => {
          self.emit(EVENT_TARGET_OUT, &target.id, None);
          return Verdict::Done;
        }
        Ok(StepRun::Suspend(cp)) => {
          shared.inflight.record_checkpoint(&target.id, cp.clone());
          checkpoint = Some(cp);
          if signal.is_stopping() {
            return self.stopped_verdict(checkpoint);
          }
          event!(Level::TRACE, target = %target.id, "Step suspended; re-invoking after back-off.");
          tokio::select! {
            _ = tokio::time::sleep(shared.limits.suspend_backoff) => {}
            _ = signal.stopped() => return self.stopped_verdict(checkpoint),
          }
        }
        Err(err) if signal.stop_reason().is_some_and(|r| r != StopReason::Pause) => {
          event!(Level::DEBUG, target = %target.id, error = %err, "Step error while stopping; target aborted.");
          return Verdict::Aborted;
        }
        Err(err) if err.is_fatal() => {
          event!(Level::ERROR, target = %target.id, step = %self.bundle.label, error = %err, "Fatal step error.");
          self.emit(EVENT_TARGET_ERR, &target.id, Some(serde_json::json!({ "error": err.to_string(), "fatal": true })));
          return Verdict::Fatal(err);
        }
        Err(err) if err.is_retryable() && attempts < shared.limits.max_transport_retries => {
          attempts += 1;
          event!(Level::WARN, target = %target.id, attempt = attempts, error = %err, "Transport error; retrying step.");
          if signal.is_stopping() {
            return self.stopped_verdict(checkpoint);
          }
          tokio::select! {
            _ = tokio::time::sleep(shared.limits.transport_retry_backoff) => {}
            _ = signal.stopped() => return self.stopped_verdict(checkpoint),
          }
        }
        Err(err) => {
          event!(Level::INFO, target = %target.id, step = %self.bundle.label, error = %err, "Step failed for target.");
          self.emit(EVENT_TARGET_ERR, &target.id, Some(serde_json::json!({ "error": err.to_string() })));
          return Verdict::Failed(err);
        }
      }
    }
  }
}
