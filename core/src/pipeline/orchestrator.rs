// contest/src/pipeline/orchestrator.rs

//! Top-level coordinator of a job.
//!
//! For every run the orchestrator acquires targets, wires a fresh topology,
//! spawns one [`StepRunner`] per step and drains the done and report
//! channels until every injected target is accounted for. It is the only
//! writer of the job's state; every transition is emitted as an event.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

use crate::config::EngineConfig;
use crate::core::checkpoint::{ResumeState, TargetCheckpoint};
use crate::core::control::{JobSignal, StopReason, TargetOutcome};
use crate::core::event::{
  Event, EventSink, TracingEventSink, EVENT_REPORTER_FAILED, EVENT_RUN_FINISHED, EVENT_RUN_STARTED,
  EVENT_TARGETS_ACQUIRED, EVENT_TARGETS_RELEASED, EVENT_TARGET_ACQUIRE_FAILED, EVENT_TARGET_RELEASE_LEAK,
};
use crate::core::target::{Target, TargetId};
use crate::core::variables::StepsVariables;
use crate::error::{ContestError, ContestResult, ReporterError};
use crate::functions::FunctionTable;
use crate::job::{Job, JobId, JobState, JobStateMachine, ReporterBundle};
use crate::pipeline::runner::{RunnerLimits, RunnerShared, StepRunner};
use crate::pipeline::topology::{feed, StepReport, TargetToken, Topology};
use crate::reporter::{FinalResults, Report, ReportPhase, ReportRecord, RunResult, TargetFailure};
use crate::target_manager::{AcquireCriteria, InFlightSet, ReleaseOutcome, TargetManager, TargetMediator};

/// Caller's grip on a running job: request a pause or a cancel, watch the
/// state. Use a fresh handle for every execution (run, resume).
#[derive(Debug, Clone)]
pub struct JobHandle {
  signal: JobSignal,
  state: watch::Sender<JobState>,
}

impl Default for JobHandle {
  fn default() -> Self {
    Self::new()
  }
}

impl JobHandle {
  pub fn new() -> Self {
    let (state, _) = watch::channel(JobState::Unknown);
    Self {
      signal: JobSignal::new(),
      state,
    }
  }

  pub fn pause(&self) {
    event!(Level::INFO, "Pause requested.");
    self.signal.pause();
  }

  pub fn cancel(&self) {
    event!(Level::INFO, "Cancel requested.");
    self.signal.cancel();
  }

  pub fn state(&self) -> JobState {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<JobState> {
    self.state.subscribe()
  }

  /// Waits until the job enters `wanted`.
  pub async fn wait_for(&self, wanted: JobState) -> ContestResult<()> {
    let mut rx = self.subscribe();
    rx.wait_for(|state| *state == wanted)
      .await
      .map(|_| ())
      .map_err(|_| ContestError::Internal("job state channel closed".to_string()))
  }
}

/// Structured result of every execution that got past validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
  pub job_id: JobId,
  /// State the execution ended in.
  pub state: JobState,
  /// Differs from `state` only after a failed pause or cancel attempt.
  /// After `CancellationFailed` the execution is over: its targets are
  /// released (or leaked) and `resume` is `None`.
  pub logical_state: JobState,
  pub succeeded: usize,
  pub failed: usize,
  pub aborted: usize,
  pub leaked: usize,
  /// Otherwise fine, but at least one target release leaked.
  pub degraded: bool,
  pub runs: Vec<RunResult>,
  pub run_reports: Vec<ReportRecord>,
  pub final_reports: Vec<ReportRecord>,
  pub error: Option<String>,
  /// Present when the job can be resumed.
  pub resume: Option<ResumeState>,
}

/// Runs jobs against one target manager.
pub struct Orchestrator {
  config: EngineConfig,
  target_manager: Arc<dyn TargetManager>,
  sink: Arc<dyn EventSink>,
  functions: Arc<FunctionTable>,
}

impl Orchestrator {
  pub fn new(config: EngineConfig, target_manager: Arc<dyn TargetManager>) -> Self {
    Self {
      config,
      target_manager,
      sink: Arc::new(TracingEventSink),
      functions: Arc::new(FunctionTable::with_builtins()),
    }
  }

  pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
    self.sink = sink;
    self
  }

  /// Functions available to step parameter templates; usually
  /// `PluginRegistry::functions()`.
  pub fn with_functions(mut self, functions: Arc<FunctionTable>) -> Self {
    self.functions = functions;
    self
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Runs `job` to its end. Nobody can pause or cancel it.
  pub async fn run(&self, job: Job) -> ContestResult<JobSummary> {
    self.run_controlled(job, &JobHandle::new()).await
  }

  /// Runs `job` until it ends or `handle` pauses or cancels it.
  ///
  /// Fails only when the job is rejected before it starts.
  #[instrument(name = "Orchestrator::run", skip_all, fields(job_id = %job.id, job_name = %job.name), err(Display))]
  pub async fn run_controlled(&self, mut job: Job, handle: &JobHandle) -> ContestResult<JobSummary> {
    self.prepare(&mut job)?;
    let machine = JobStateMachine::new().observed_by(handle.state.clone());
    let mut exec = Execution::new(self, job, machine, handle.signal.clone(), StepsVariables::new());
    exec.transition(JobState::Started, None);
    Ok(exec.drive(1, Vec::new(), None).await)
  }

  /// Continues a paused job from its [`ResumeState`]. The suspended targets
  /// are re-acquired and each is re-injected at the step it stopped in,
  /// together with that step's checkpoint.
  #[instrument(name = "Orchestrator::resume", skip_all, fields(job_id = %job.id, run = state.run), err(Display))]
  pub async fn resume(&self, mut job: Job, handle: &JobHandle, state: ResumeState) -> ContestResult<JobSummary> {
    self.prepare(&mut job)?;
    check_resume_state(&job, &state)?;

    let machine = JobStateMachine::restore(JobState::Paused).observed_by(handle.state.clone());
    let variables = StepsVariables::restore(&state.variables);
    let mut exec = Execution::new(self, job, machine, handle.signal.clone(), variables);
    exec.runs = state.completed_runs;
    exec.transition(JobState::Started, None);
    Ok(exec.drive(state.run, state.targets, state.partial_run).await)
  }

  /// Cancels a paused job. Its targets were released on pause, so there is
  /// nothing to drain; only final reporters run.
  #[instrument(name = "Orchestrator::cancel_paused", skip_all, fields(job_id = %job.id), err(Display))]
  pub async fn cancel_paused(&self, mut job: Job, state: ResumeState) -> ContestResult<JobSummary> {
    self.prepare(&mut job)?;
    check_resume_state(&job, &state)?;

    let machine = JobStateMachine::restore(JobState::Paused);
    let mut exec = Execution::new(self, job, machine, JobSignal::new(), StepsVariables::restore(&state.variables));
    exec.runs = state.completed_runs;
    if let Some(mut partial) = state.partial_run {
      partial.aborted.extend(state.targets.into_iter().map(|cp| cp.target.id));
      exec.runs.push(partial);
    }
    Ok(exec.commit_cancel().await)
  }

  fn prepare(&self, job: &mut Job) -> ContestResult<()> {
    self.config.validate()?;
    if job.target_manager_acquire_timeout.is_zero() {
      job.target_manager_acquire_timeout = self.config.default_acquire_timeout;
    }
    if job.target_manager_release_timeout.is_zero() {
      job.target_manager_release_timeout = self.config.default_release_timeout;
    }
    job.validate().map_err(|err| {
      event!(Level::ERROR, error = %err, "Job rejected before start.");
      err
    })
  }
}

impl std::fmt::Debug for Orchestrator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Orchestrator")
      .field("config", &self.config)
      .field("functions", &self.functions)
      .finish()
  }
}

fn check_resume_state(job: &Job, state: &ResumeState) -> ContestResult<()> {
  if state.job_id != job.id {
    return Err(ContestError::InvalidJob(format!(
      "resume state belongs to job {}, not {}",
      state.job_id, job.id
    )));
  }
  for cp in &state.targets {
    match job.steps.get(cp.step_index) {
      Some(bundle) if bundle.label == cp.step_label => {}
      _ => {
        return Err(ContestError::InvalidJob(format!(
          "checkpoint of target {} refers to unknown step '{}' (#{})",
          cp.target.id, cp.step_label, cp.step_index
        )))
      }
    }
  }
  Ok(())
}

/// How the drain of one run ended.
enum RunEnd {
  /// Every target accounted for without a stop request.
  Drained,
  Paused(Vec<TargetCheckpoint>),
  /// Paused before any target entered the pipeline. The run is still owed.
  PausedBeforeInjection {
    pending: Vec<TargetCheckpoint>,
    resuming: bool,
  },
  Cancelled,
  Fatal(String),
  /// Pause or cancel did not drain in time.
  TimedOut {
    reason: StopReason,
    checkpoints: Vec<TargetCheckpoint>,
    remaining: usize,
  },
}

enum DrainExit {
  Drained,
  TimedOut,
  /// Every channel closed with targets still unaccounted for.
  Lost,
}

/// State of one execution of one job.
struct Execution<'a> {
  orchestrator: &'a Orchestrator,
  job: Job,
  machine: JobStateMachine,
  signal: JobSignal,
  mediator: TargetMediator,
  variables: StepsVariables,
  labels: Arc<[String]>,
  runs: Vec<RunResult>,
  run_reports: Vec<ReportRecord>,
  final_reports: Vec<ReportRecord>,
  error: Option<String>,
  reporter_failure: Option<String>,
}

impl<'a> Execution<'a> {
  fn new(
    orchestrator: &'a Orchestrator,
    job: Job,
    machine: JobStateMachine,
    signal: JobSignal,
    variables: StepsVariables,
  ) -> Self {
    let mediator = TargetMediator::new(
      orchestrator.target_manager.clone(),
      job.id,
      job.target_manager_acquire_timeout,
      job.target_manager_release_timeout,
    );
    let labels: Arc<[String]> = job.steps.iter().map(|s| s.label.clone()).collect();
    Self {
      orchestrator,
      job,
      machine,
      signal,
      mediator,
      variables,
      labels,
      runs: Vec::new(),
      run_reports: Vec::new(),
      final_reports: Vec::new(),
      error: None,
      reporter_failure: None,
    }
  }

  fn emit(&self, e: Event) {
    self.orchestrator.sink.emit(e);
  }

  /// Requests a transition and emits the state's event when it is accepted.
  fn transition(&mut self, to: JobState, payload: Option<serde_json::Value>) -> bool {
    match self.machine.transition(to) {
      Ok(from) => {
        event!(Level::INFO, job_id = %self.job.id, %from, %to, "Job state changed.");
        let mut e = Event::new(self.job.id, to.name());
        if let Some(payload) = payload {
          e = e.payload(payload);
        }
        self.emit(e);
        true
      }
      Err(err) => {
        event!(Level::ERROR, job_id = %self.job.id, error = %err, "Job state transition refused.");
        false
      }
    }
  }

  fn enter_cancelling(&mut self) {
    if self.machine.current() != JobState::Cancelling {
      self.transition(JobState::Cancelling, None);
    }
  }

  fn is_last(&self, run: u32) -> bool {
    self.job.runs != 0 && run >= self.job.runs
  }

  async fn drive(
    mut self,
    first_run: u32,
    mut pending: Vec<TargetCheckpoint>,
    mut partial: Option<RunResult>,
  ) -> JobSummary {
    let mut run = first_run;
    loop {
      let (result, end) = self.execute_run(run, std::mem::take(&mut pending), partial.take()).await;
      if !matches!(end, RunEnd::PausedBeforeInjection { .. }) {
        self.emit(
          Event::new(self.job.id, EVENT_RUN_FINISHED).run(run).payload(serde_json::json!({
            "passed": result.passed.len(),
            "failed": result.failed.len(),
            "aborted": result.aborted.len(),
            "leaked": result.leaked,
          })),
        );
      }

      match end {
        RunEnd::Drained => self.finish_run(result).await,
        RunEnd::Paused(checkpoints) if checkpoints.is_empty() => {
          // every target finished before the pause took hold
          self.finish_run(result).await;
          if self.is_last(run) {
            return self.complete().await;
          }
          return self.commit_pause(run + 1, Vec::new(), None);
        }
        RunEnd::Paused(checkpoints) => return self.commit_pause(run, checkpoints, Some(result)),
        RunEnd::PausedBeforeInjection { pending, resuming } => {
          return self.commit_pause(run, pending, resuming.then_some(result));
        }
        RunEnd::Cancelled => {
          self.runs.push(result);
          return self.commit_cancel().await;
        }
        RunEnd::Fatal(message) => {
          self.finish_run(result).await;
          self.error = Some(message);
          if self.machine.current() == JobState::Cancelling {
            return self.commit_cancel().await;
          }
          return self.conclude(JobState::Failed).await;
        }
        RunEnd::TimedOut {
          reason,
          checkpoints,
          remaining,
        } => return self.stop_failed(reason, run, checkpoints, result, remaining),
      }

      if self.reporter_failure.is_some() || self.is_last(run) {
        break;
      }

      if !self.job.run_interval.is_zero() {
        tokio::select! {
          _ = tokio::time::sleep(self.job.run_interval) => {}
          _ = self.signal.stopped() => {}
        }
      }
      match self.signal.stop_reason() {
        Some(StopReason::Pause) => return self.commit_pause(run + 1, Vec::new(), None),
        Some(_) => return self.commit_cancel().await,
        None => {}
      }
      run += 1;
    }
    self.complete().await
  }

  /// One run: acquire, inject, drain, release.
  #[instrument(name = "Execution::run", skip_all, fields(job_id = %self.job.id, run = run))]
  async fn execute_run(
    &mut self,
    run: u32,
    pending: Vec<TargetCheckpoint>,
    partial: Option<RunResult>,
  ) -> (RunResult, RunEnd) {
    let resuming = partial.is_some() || !pending.is_empty();
    let mut result = partial.unwrap_or_else(|| RunResult::new(run));
    self.emit(Event::new(self.job.id, EVENT_RUN_STARTED).run(run));

    let criteria = AcquireCriteria {
      job_id: self.job.id,
      run,
      tags: self.job.tags.clone(),
      parameters: self.job.acquire_parameters.clone(),
      pinned: pending.iter().map(|cp| cp.target.clone()).collect(),
    };
    let targets = match self.mediator.acquire(&criteria, &self.signal).await {
      Ok(targets) => targets,
      Err(err) => {
        if let Some(reason) = self.signal.stop_reason() {
          let end = self.stopped_before_injection(reason, pending, resuming, &mut result);
          return (result, end);
        }
        event!(Level::WARN, job_id = %self.job.id, run, error = %err, suspended = pending.len(), "Run could not acquire targets.");
        self.emit(
          Event::new(self.job.id, EVENT_TARGET_ACQUIRE_FAILED)
            .run(run)
            .payload(serde_json::json!({ "error": err.to_string(), "suspended": pending.len() })),
        );
        // suspended targets that cannot be re-acquired are lost to this run
        result.aborted.extend(pending.into_iter().map(|cp| cp.target.id));
        result.acquisition_error = Some(err.to_string());
        return (result, RunEnd::Drained);
      }
    };
    if !resuming {
      result.acquired = targets.len();
    }
    self.emit(
      Event::new(self.job.id, EVENT_TARGETS_ACQUIRED)
        .run(run)
        .payload(serde_json::json!({ "count": targets.len() })),
    );

    let tokens = self.tokens_for(&targets, pending, &mut result).await;
    let inflight = Arc::new(InFlightSet::new());
    for (index, token) in &tokens {
      inflight.insert(token.target.clone(), *index, token.checkpoint.clone());
    }

    let Topology {
      entries,
      links,
      mut done,
      reports_tx,
      mut reports,
    } = Topology::build(self.job.steps.len(), self.orchestrator.config.channel_capacity);
    let shared = RunnerShared {
      job_id: self.job.id,
      run,
      signal: self.signal.clone(),
      sink: self.orchestrator.sink.clone(),
      variables: self.variables.clone(),
      functions: self.orchestrator.functions.clone(),
      inflight: inflight.clone(),
      limits: RunnerLimits::from(&self.orchestrator.config),
    };
    let mut workers = JoinSet::new();
    for ((index, bundle), link) in self.job.steps.iter().cloned().enumerate().zip(links) {
      let runner = StepRunner::new(index, bundle, shared.clone());
      workers.spawn(runner.run(link, reports_tx.clone()));
    }
    workers.spawn(feed(entries, tokens, self.labels.clone(), self.signal.clone(), reports_tx));

    let signal = self.signal.clone();
    let mut observed: Option<StopReason> = None;
    let mut deadline: Option<Instant> = None;
    let mut fatal: Option<String> = None;
    let mut checkpoints: Vec<TargetCheckpoint> = Vec::new();
    let (mut done_open, mut reports_open) = (true, true);

    let exit = loop {
      if inflight.is_empty() {
        break DrainExit::Drained;
      }
      if !done_open && !reports_open {
        break DrainExit::Lost;
      }
      tokio::select! {
        biased;
        _ = signal.stopped(), if observed.is_none() => {
          self.observe_stop(&mut observed, &mut deadline);
        }
        _ = signal.cancelled(), if observed == Some(StopReason::Pause) => {
          self.observe_stop(&mut observed, &mut deadline);
        }
        _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
          event!(Level::ERROR, job_id = %self.job.id, run, remaining = inflight.len(), "In-flight targets did not drain in time.");
          break DrainExit::TimedOut;
        }
        token = done.recv(), if done_open => {
          match token {
            Some(token) => {
              inflight.remove(&token.target.id);
              result.passed.push(token.target.id);
            }
            None => done_open = false,
          }
        }
        report = reports.recv(), if reports_open => {
          match report {
            Some(report) => absorb(report, &inflight, &mut result, &mut checkpoints, &mut fatal, &signal),
            None => reports_open = false,
          }
        }
      }
    };

    let mut remaining = 0;
    match exit {
      DrainExit::Drained => workers.shutdown().await,
      DrainExit::TimedOut | DrainExit::Lost => {
        if matches!(exit, DrainExit::Lost) && fatal.is_none() && observed.is_none() {
          fatal = Some(format!("pipeline lost track of {} target(s)", inflight.len()));
        }
        signal.abort();
        workers.shutdown().await;
        let leftovers = inflight.drain();
        remaining = leftovers.len();
        for entry in leftovers {
          if entry.step_index >= self.job.steps.len() {
            result.passed.push(entry.target.id);
          } else if observed == Some(StopReason::Pause) {
            checkpoints.push(TargetCheckpoint {
              step_label: self.labels[entry.step_index].clone(),
              step_index: entry.step_index,
              state: entry.checkpoint,
              target: entry.target,
            });
          } else {
            result.aborted.push(entry.target.id);
          }
        }
      }
    }

    let released = self.mediator.release(&targets).await;
    self.record_release(run, &released, &mut result);

    let end = if let Some(message) = fatal {
      RunEnd::Fatal(message)
    } else if matches!(exit, DrainExit::TimedOut) {
      RunEnd::TimedOut {
        reason: observed.unwrap_or(StopReason::Cancel),
        checkpoints,
        remaining,
      }
    } else {
      match observed {
        None => RunEnd::Drained,
        Some(StopReason::Pause) => RunEnd::Paused(checkpoints),
        Some(_) => {
          result.aborted.extend(checkpoints.into_iter().map(|cp| cp.target.id));
          RunEnd::Cancelled
        }
      }
    };
    (result, end)
  }

  /// Turns acquired targets into the tokens to inject. On resume only the
  /// pinned targets that came back are injected, each at its step.
  async fn tokens_for(
    &mut self,
    targets: &[Target],
    pending: Vec<TargetCheckpoint>,
    result: &mut RunResult,
  ) -> Vec<(usize, TargetToken)> {
    if pending.is_empty() {
      return targets.iter().map(|t| (0, TargetToken::new(t.clone()))).collect();
    }
    let mut returned: HashMap<TargetId, Target> = targets.iter().map(|t| (t.id.clone(), t.clone())).collect();
    let mut tokens = Vec::with_capacity(pending.len());
    for cp in pending {
      match returned.remove(&cp.target.id) {
        Some(target) => tokens.push((cp.step_index, TargetToken::resuming(target, cp.state))),
        None => {
          event!(Level::WARN, target = %cp.target.id, "Suspended target was not re-acquired.");
          result.aborted.push(cp.target.id);
        }
      }
    }
    if !returned.is_empty() {
      let extra: Vec<Target> = returned.into_values().collect();
      let released = self.mediator.release(&extra).await;
      result.leaked += released.leaked;
    }
    tokens
  }

  fn stopped_before_injection(
    &mut self,
    reason: StopReason,
    pending: Vec<TargetCheckpoint>,
    resuming: bool,
    result: &mut RunResult,
  ) -> RunEnd {
    match reason {
      StopReason::Pause => RunEnd::PausedBeforeInjection { pending, resuming },
      _ => {
        result.aborted.extend(pending.into_iter().map(|cp| cp.target.id));
        self.enter_cancelling();
        RunEnd::Cancelled
      }
    }
  }

  fn observe_stop(&mut self, observed: &mut Option<StopReason>, deadline: &mut Option<Instant>) {
    let Some(reason) = self.signal.stop_reason() else {
      return;
    };
    let config = &self.orchestrator.config;
    let timeout = match reason {
      StopReason::Pause => config.pause_timeout,
      StopReason::Cancel | StopReason::Abort => config.cancel_timeout,
    };
    event!(Level::INFO, job_id = %self.job.id, ?reason, ?timeout, "Draining in-flight targets.");
    *observed = Some(reason);
    *deadline = Some(Instant::now() + timeout);
    if reason == StopReason::Cancel {
      self.enter_cancelling();
    }
  }

  fn record_release(&self, run: u32, released: &ReleaseOutcome, result: &mut RunResult) {
    result.leaked += released.leaked;
    if released.released > 0 {
      self.emit(
        Event::new(self.job.id, EVENT_TARGETS_RELEASED)
          .run(run)
          .payload(serde_json::json!({ "count": released.released })),
      );
    }
    if released.leaked > 0 {
      let error = released.error.as_ref().map(|e| e.to_string());
      self.emit(
        Event::new(self.job.id, EVENT_TARGET_RELEASE_LEAK)
          .run(run)
          .payload(serde_json::json!({ "count": released.leaked, "error": error })),
      );
    }
  }

  async fn finish_run(&mut self, result: RunResult) {
    let bundles = self.job.run_reporters.clone();
    for bundle in &bundles {
      let outcome = bundle.reporter.run_report(&bundle.parameters, &result).await;
      self.record_report(bundle, ReportPhase::Run(result.run), outcome, true);
    }
    self.runs.push(result);
  }

  fn record_report(
    &mut self,
    bundle: &ReporterBundle,
    phase: ReportPhase,
    outcome: Result<Report, ReporterError>,
    run_phase: bool,
  ) {
    let name = bundle.reporter.name().to_string();
    if let Err(err) = &outcome {
      event!(Level::WARN, job_id = %self.job.id, reporter = %name, error = %err, "Reporter failed.");
      self.emit(
        Event::new(self.job.id, EVENT_REPORTER_FAILED).payload(serde_json::json!({
          "reporter": name,
          "error": err.to_string(),
        })),
      );
      if let ReporterError::Unrecoverable(message) = err {
        if self.reporter_failure.is_none() {
          self.reporter_failure = Some(
            ContestError::ReporterUnrecoverable {
              reporter: name.clone(),
              message: message.clone(),
            }
            .to_string(),
          );
        }
      }
    }
    let record = ReportRecord {
      reporter: name,
      phase,
      outcome: outcome.map_err(|e| e.to_string()),
    };
    if run_phase {
      self.run_reports.push(record);
    } else {
      self.final_reports.push(record);
    }
  }

  /// All runs are over.
  async fn complete(mut self) -> JobSummary {
    let last_acquisition = self.runs.last().and_then(|r| r.acquisition_error.clone());
    if let Some(err) = last_acquisition {
      self.error.get_or_insert(format!("last run could not acquire targets: {}", err));
      return self.conclude(JobState::Failed).await;
    }
    self.conclude(JobState::Completed).await
  }

  /// Runs the final reporters and enters `state` (Completed or Failed).
  async fn conclude(mut self, state: JobState) -> JobSummary {
    let mut state = if self.reporter_failure.is_some() {
      JobState::Failed
    } else {
      state
    };
    self.final_report(state).await;
    if state == JobState::Completed && self.reporter_failure.is_some() {
      state = JobState::Failed;
    }
    if state == JobState::Failed && self.error.is_none() {
      self.error = self.reporter_failure.clone();
    }
    let payload = self.error.as_ref().map(|e| serde_json::json!({ "error": e }));
    self.transition(state, payload);
    self.summary(None)
  }

  async fn final_report(&mut self, state: JobState) {
    let results = FinalResults {
      job_id: self.job.id,
      state,
      runs: self.runs.clone(),
    };
    let bundles = self.job.final_reporters.clone();
    for bundle in &bundles {
      let outcome = bundle.reporter.final_report(&bundle.parameters, &results).await;
      self.record_report(bundle, ReportPhase::Final, outcome, false);
    }
  }

  fn commit_pause(mut self, run: u32, targets: Vec<TargetCheckpoint>, partial: Option<RunResult>) -> JobSummary {
    event!(Level::INFO, job_id = %self.job.id, run, checkpoints = targets.len(), "Pause committed.");
    self.transition(JobState::Paused, None);
    let resume = self.resume_state(run, targets, partial);
    self.summary(Some(resume))
  }

  async fn commit_cancel(mut self) -> JobSummary {
    self.enter_cancelling();
    self.final_report(JobState::Cancelled).await;
    self.transition(JobState::Cancelled, None);
    self.summary(None)
  }

  /// A pause or cancel overran its deadline. Workers were aborted and the
  /// leftovers released; the failed attempt is recorded.
  ///
  /// A failed pause keeps its checkpoints. A failed cancel is final for this
  /// execution: the leftovers count as aborted and there is nothing to resume
  /// or cancel again.
  fn stop_failed(
    mut self,
    reason: StopReason,
    run: u32,
    checkpoints: Vec<TargetCheckpoint>,
    result: RunResult,
    remaining: usize,
  ) -> JobSummary {
    let config = &self.orchestrator.config;
    let (state, error) = match reason {
      StopReason::Pause => (
        JobState::PauseFailed,
        ContestError::PauseTimeout {
          timeout: config.pause_timeout,
          remaining,
        },
      ),
      _ => (
        JobState::CancellationFailed,
        ContestError::CancelTimeout {
          timeout: config.cancel_timeout,
          remaining,
        },
      ),
    };
    let message = error.to_string();
    self.transition(state, Some(serde_json::json!({ "error": message })));
    self.error = Some(message);

    if state == JobState::PauseFailed {
      let resume = self.resume_state(run, checkpoints, Some(result));
      self.summary(Some(resume))
    } else {
      self.runs.push(result);
      self.summary(None)
    }
  }

  fn resume_state(&self, run: u32, targets: Vec<TargetCheckpoint>, partial: Option<RunResult>) -> ResumeState {
    ResumeState {
      job_id: self.job.id,
      run,
      targets,
      partial_run: partial,
      completed_runs: self.runs.clone(),
      variables: self.variables.snapshot(),
    }
  }

  fn summary(self, resume: Option<ResumeState>) -> JobSummary {
    let mut runs = self.runs;
    if let Some(partial) = resume.as_ref().and_then(|r| r.partial_run.clone()) {
      runs.push(partial);
    }
    let succeeded = runs.iter().map(|r| r.passed.len()).sum();
    let failed = runs.iter().map(|r| r.failed.len()).sum();
    let aborted = runs.iter().map(|r| r.aborted.len()).sum();
    let leaked: usize = runs.iter().map(|r| r.leaked).sum();
    JobSummary {
      job_id: self.job.id,
      state: self.machine.current(),
      logical_state: self.machine.logical(),
      succeeded,
      failed,
      aborted,
      leaked,
      degraded: leaked > 0,
      runs,
      run_reports: self.run_reports,
      final_reports: self.final_reports,
      error: self.error,
      resume,
    }
  }
}

/// Folds one report into the run's bookkeeping.
fn absorb(
  report: StepReport,
  inflight: &InFlightSet,
  result: &mut RunResult,
  checkpoints: &mut Vec<TargetCheckpoint>,
  fatal: &mut Option<String>,
  signal: &JobSignal,
) {
  match report {
    StepReport::Finished { target, outcome } => {
      inflight.remove(&target.id);
      match outcome {
        TargetOutcome::Passed => result.passed.push(target.id),
        TargetOutcome::Failed { step, error } => result.failed.push(TargetFailure {
          target: target.id,
          step,
          error: error.to_string(),
        }),
        TargetOutcome::Suspended(cp) => checkpoints.push(cp),
        TargetOutcome::Aborted { .. } => result.aborted.push(target.id),
      }
    }
    StepReport::Fatal { target, step, error } => {
      inflight.remove(&target.id);
      result.failed.push(TargetFailure {
        target: target.id,
        step: step.clone(),
        error: error.to_string(),
      });
      if fatal.is_none() {
        *fatal = Some(ContestError::StepFatal { step, source: error }.to_string());
        signal.abort();
      }
    }
  }
}
