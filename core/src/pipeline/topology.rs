// contest/src/pipeline/topology.rs

//! Channel wiring between step runners.
//!
//! Step `i` reads from input channel `i` and writes to input channel `i + 1`;
//! the last step writes to the done channel the orchestrator drains. Every
//! channel is bounded, so a slow step stalls the ones in front of it. Targets
//! that leave the pipeline any other way (failure, pause, cancel) travel on a
//! separate unbounded report channel as explicit [`StepReport`]s.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{event, Level};

use crate::core::checkpoint::{Checkpoint, TargetCheckpoint};
use crate::core::control::{JobSignal, StopReason, TargetOutcome};
use crate::core::target::Target;
use crate::error::StepError;

/// A target travelling between steps. The checkpoint, if any, is for the step
/// that receives the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetToken {
  pub target: Target,
  pub checkpoint: Option<Checkpoint>,
}

impl TargetToken {
  pub fn new(target: Target) -> Self {
    Self {
      target,
      checkpoint: None,
    }
  }

  pub fn resuming(target: Target, checkpoint: Option<Checkpoint>) -> Self {
    Self { target, checkpoint }
  }
}

/// What the orchestrator learns about a target that did not reach the end.
#[derive(Debug, Clone, PartialEq)]
pub enum StepReport {
  Finished { target: Target, outcome: TargetOutcome },
  /// The step failed in a way that fails the whole job.
  Fatal { target: Target, step: String, error: StepError },
}

impl StepReport {
  pub fn target(&self) -> &Target {
    match self {
      StepReport::Finished { target, .. } | StepReport::Fatal { target, .. } => target,
    }
  }
}

/// Hands `report` to the orchestrator. Returns false, after logging, when
/// nobody is draining reports any more.
pub(crate) fn send_report(reports: &mpsc::UnboundedSender<StepReport>, report: StepReport) -> bool {
  match reports.send(report) {
    Ok(()) => true,
    Err(mpsc::error::SendError(lost)) => {
      event!(Level::WARN, target = %lost.target().id, "Report channel closed; target report dropped.");
      false
    }
  }
}

/// The two ends a step runner works with.
#[derive(Debug)]
pub struct StepLinks {
  pub input: mpsc::Receiver<TargetToken>,
  pub output: mpsc::Sender<TargetToken>,
}

#[derive(Debug)]
pub struct Topology {
  /// Sender into each step's input, used to inject (and re-inject) targets.
  pub entries: Vec<mpsc::Sender<TargetToken>>,
  /// One pair per step, in pipeline order.
  pub links: Vec<StepLinks>,
  pub done: mpsc::Receiver<TargetToken>,
  pub reports_tx: mpsc::UnboundedSender<StepReport>,
  pub reports: mpsc::UnboundedReceiver<StepReport>,
}

impl Topology {
  pub fn build(steps: usize, capacity: usize) -> Self {
    let (done_tx, done) = mpsc::channel(capacity);
    let (reports_tx, reports) = mpsc::unbounded_channel();

    let (entries, inputs): (Vec<_>, Vec<_>) = (0..steps).map(|_| mpsc::channel(capacity)).unzip();
    let links = inputs
      .into_iter()
      .enumerate()
      .map(|(index, input)| StepLinks {
        input,
        output: entries.get(index + 1).cloned().unwrap_or_else(|| done_tx.clone()),
      })
      .collect();
    drop(done_tx);

    Self {
      entries,
      links,
      done,
      reports_tx,
      reports,
    }
  }
}

/// Turns a token that will not be processed into the report for it: a
/// checkpoint at `step_index` on pause, an abort otherwise.
pub(crate) fn park(signal: &JobSignal, step_index: usize, step_label: &str, token: TargetToken) -> StepReport {
  let outcome = match signal.stop_reason() {
    Some(StopReason::Pause) => TargetOutcome::Suspended(TargetCheckpoint {
      target: token.target.clone(),
      step_index,
      step_label: step_label.to_string(),
      state: token.checkpoint,
    }),
    _ => TargetOutcome::Aborted {
      step: step_label.to_string(),
    },
  };
  StepReport::Finished {
    target: token.target,
    outcome,
  }
}

/// Injects each `(step index, token)` pair into its step. Stops injecting as
/// soon as the job is asked to stop; everything not yet injected is parked.
pub(crate) async fn feed(
  entries: Vec<mpsc::Sender<TargetToken>>,
  tokens: Vec<(usize, TargetToken)>,
  labels: Arc<[String]>,
  signal: JobSignal,
  reports: mpsc::UnboundedSender<StepReport>,
) {
  let mut pending = tokens.into_iter();
  while let Some((index, token)) = pending.next() {
    let permit = match entries.get(index) {
      Some(entry) => tokio::select! {
        biased;
        _ = signal.stopped() => None,
        permit = entry.reserve() => permit.ok(),
      },
      None => None,
    };
    match permit {
      Some(permit) => permit.send(token),
      None => {
        let label = labels.get(index).map(String::as_str).unwrap_or_default();
        send_report(&reports, park(&signal, index, label, token));
        for (index, token) in pending.by_ref() {
          let label = labels.get(index).map(String::as_str).unwrap_or_default();
          send_report(&reports, park(&signal, index, label, token));
        }
        event!(Level::DEBUG, "Feeder stopped early; remaining targets parked.");
        break;
      }
    }
  }
}
