// tests/common/mod.rs
#![allow(dead_code)] // Allow unused code in this common test module

use async_trait::async_trait;
use contest::core::{Checkpoint, StepBundle, StepContext, StepEmitter, StepParameters, StepRun, StepVariables};
use contest::error::ReporterError;
use contest::job::ReporterBundle;
use contest::reporter::ReportPhase;
use contest::{
  AcquireCriteria, FinalResults, Job, JobId, Report, Reporter, RunResult, StepError, Target, TargetError,
  TargetManager, TestStep,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::Level;

// --- Target manager ---

/// Hands out `pool` fresh targets per run (`target-1`..`target-N`), or
/// exactly the pinned ones when asked for them. Counts every target that
/// goes out and comes back.
#[derive(Default)]
pub struct FakeTargetManager {
  pub pool: usize,
  /// The first `slow_acquires` acquire calls take this long.
  pub acquire_delay: Duration,
  pub slow_acquires: usize,
  /// Every release fails with a transport error.
  pub failing_release: bool,
  /// When set, every later acquire call takes this long.
  stall: Mutex<Option<Duration>>,
  acquire_calls: AtomicUsize,
  acquired: AtomicUsize,
  released: AtomicUsize,
  held: Mutex<HashSet<String>>,
}

impl FakeTargetManager {
  pub fn new(pool: usize) -> Self {
    Self {
      pool,
      ..Self::default()
    }
  }

  pub fn slow_first(mut self, calls: usize, delay: Duration) -> Self {
    self.slow_acquires = calls;
    self.acquire_delay = delay;
    self
  }

  pub fn failing_release(mut self) -> Self {
    self.failing_release = true;
    self
  }

  /// Makes every acquire from now on hang for `delay`.
  pub fn stall_acquires(&self, delay: Duration) {
    *self.stall.lock() = Some(delay);
  }

  pub fn acquire_calls(&self) -> usize {
    self.acquire_calls.load(Ordering::SeqCst)
  }

  pub fn acquired(&self) -> usize {
    self.acquired.load(Ordering::SeqCst)
  }

  pub fn released(&self) -> usize {
    self.released.load(Ordering::SeqCst)
  }

  pub fn held(&self) -> usize {
    self.held.lock().len()
  }
}

#[async_trait]
impl TargetManager for FakeTargetManager {
  async fn acquire(&self, criteria: &AcquireCriteria, _deadline: Instant) -> Result<Vec<Target>, TargetError> {
    let call = self.acquire_calls.fetch_add(1, Ordering::SeqCst);
    if call < self.slow_acquires {
      tokio::time::sleep(self.acquire_delay).await;
    }
    let stall = *self.stall.lock();
    if let Some(delay) = stall {
      tokio::time::sleep(delay).await;
    }
    let targets: Vec<Target> = if criteria.pinned.is_empty() {
      (1..=self.pool)
        .map(|i| Target::new(format!("target-{}", i)).with_fqdn(format!("target-{}.lab", i)))
        .collect()
    } else {
      criteria.pinned.clone()
    };
    self.acquired.fetch_add(targets.len(), Ordering::SeqCst);
    self.held.lock().extend(targets.iter().map(|t| t.id.as_str().to_string()));
    Ok(targets)
  }

  async fn release(&self, _job_id: JobId, targets: &[Target], _deadline: Instant) -> Result<(), TargetError> {
    if self.failing_release {
      return Err(TargetError::Transport("lab inventory unreachable".to_string()));
    }
    let mut held = self.held.lock();
    for t in targets {
      held.remove(t.id.as_str());
    }
    self.released.fetch_add(targets.len(), Ordering::SeqCst);
    Ok(())
  }
}

// --- Scripted test steps ---

/// Passes every target. Counts invocations.
#[derive(Default)]
pub struct PassStep {
  pub calls: AtomicUsize,
}

#[async_trait]
impl TestStep for PassStep {
  fn name(&self) -> &str {
    "pass"
  }

  fn validate_parameters(&self, _params: &StepParameters) -> Result<(), StepError> {
    Ok(())
  }

  async fn run(
    &self,
    _ctx: &StepContext,
    target: &Target,
    _emitter: &StepEmitter,
    variables: &StepVariables,
    _params: &StepParameters,
    _resume: Option<Checkpoint>,
  ) -> Result<StepRun, StepError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    variables.add(&target.id, "visited", serde_json::json!(true))?;
    Ok(StepRun::Done)
  }
}

/// Fails the named target, passes the rest.
pub struct FailTargetStep {
  pub failing: &'static str,
}

#[async_trait]
impl TestStep for FailTargetStep {
  fn name(&self) -> &str {
    "failtarget"
  }

  fn validate_parameters(&self, _params: &StepParameters) -> Result<(), StepError> {
    Ok(())
  }

  async fn run(
    &self,
    _ctx: &StepContext,
    target: &Target,
    _emitter: &StepEmitter,
    _variables: &StepVariables,
    _params: &StepParameters,
    _resume: Option<Checkpoint>,
  ) -> Result<StepRun, StepError> {
    if target.id.as_str() == self.failing {
      tracing::warn!(target: "test_steps", target_id = %target.id, "failing on purpose");
      return Err(StepError::target("probe returned non-zero"));
    }
    Ok(StepRun::Done)
  }
}

/// Fails the whole job on its first target.
pub struct FatalStep;

#[async_trait]
impl TestStep for FatalStep {
  fn name(&self) -> &str {
    "fatal"
  }

  fn validate_parameters(&self, _params: &StepParameters) -> Result<(), StepError> {
    Ok(())
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
    Err(StepError::Fatal("firmware image missing".to_string()))
  }
}

/// Returns a transport error `hiccups` times per target, then passes.
pub struct FlakyStep {
  pub hiccups: usize,
  seen: Mutex<std::collections::HashMap<String, usize>>,
}

impl FlakyStep {
  pub fn new(hiccups: usize) -> Self {
    Self {
      hiccups,
      seen: Mutex::new(Default::default()),
    }
  }

  pub fn attempts(&self, target: &str) -> usize {
    self.seen.lock().get(target).copied().unwrap_or(0)
  }
}

#[async_trait]
impl TestStep for FlakyStep {
  fn name(&self) -> &str {
    "flaky"
  }

  fn validate_parameters(&self, _params: &StepParameters) -> Result<(), StepError> {
    Ok(())
  }

  async fn run(
    &self,
    _ctx: &StepContext,
    target: &Target,
    _emitter: &StepEmitter,
    _variables: &StepVariables,
    _params: &StepParameters,
    _resume: Option<Checkpoint>,
  ) -> Result<StepRun, StepError> {
    let attempt = {
      let mut seen = self.seen.lock();
      let n = seen.entry(target.id.as_str().to_string()).or_insert(0);
      *n += 1;
      *n
    };
    if attempt <= self.hiccups {
      return Err(StepError::Transport("connection reset".to_string()));
    }
    Ok(StepRun::Done)
  }
}

/// Holds every fresh target until the job is stopped. On pause it
/// checkpoints `cp-<target>`; on cancel it gives up. A resumed invocation
/// records the checkpoint it got and passes.
#[derive(Default)]
pub struct WaitStep {
  entered: AtomicUsize,
  resumed: Mutex<Vec<(String, Vec<u8>)>>,
}

impl WaitStep {
  pub fn entered(&self) -> usize {
    self.entered.load(Ordering::SeqCst)
  }

  pub fn resumed(&self) -> Vec<(String, Vec<u8>)> {
    let mut resumed = self.resumed.lock().clone();
    resumed.sort();
    resumed
  }

  /// Polls until `n` targets are parked inside the step.
  pub async fn wait_entered(&self, n: usize) {
    while self.entered() < n {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  }
}

#[async_trait]
impl TestStep for WaitStep {
  fn name(&self) -> &str {
    "wait"
  }

  fn validate_parameters(&self, _params: &StepParameters) -> Result<(), StepError> {
    Ok(())
  }

  async fn run(
    &self,
    ctx: &StepContext,
    target: &Target,
    _emitter: &StepEmitter,
    _variables: &StepVariables,
    _params: &StepParameters,
    resume: Option<Checkpoint>,
  ) -> Result<StepRun, StepError> {
    if let Some(cp) = resume {
      self.resumed.lock().push((target.id.as_str().to_string(), cp.into_bytes()));
      return Ok(StepRun::Done);
    }
    self.entered.fetch_add(1, Ordering::SeqCst);
    ctx.stopped().await;
    if ctx.is_pausing() {
      Ok(StepRun::Suspend(Checkpoint::new(format!("cp-{}", target.id).into_bytes())))
    } else {
      Err(StepError::target("interrupted"))
    }
  }
}

/// Ignores stop requests entirely.
pub struct StubbornStep;

#[async_trait]
impl TestStep for StubbornStep {
  fn name(&self) -> &str {
    "stubborn"
  }

  fn validate_parameters(&self, _params: &StepParameters) -> Result<(), StepError> {
    Ok(())
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
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(StepRun::Done)
  }
}

// --- Reporter ---

/// Records every report it is asked for; optionally declares the job
/// unrecoverable after the first run.
#[derive(Default)]
pub struct RecordingReporter {
  pub unrecoverable: bool,
  pub phases: Mutex<Vec<ReportPhase>>,
  pub runs: Mutex<Vec<RunResult>>,
}

impl RecordingReporter {
  pub fn unrecoverable() -> Self {
    Self {
      unrecoverable: true,
      ..Self::default()
    }
  }

  pub fn phases(&self) -> Vec<ReportPhase> {
    self.phases.lock().clone()
  }
}

#[async_trait]
impl Reporter for RecordingReporter {
  fn name(&self) -> &str {
    "recording"
  }

  async fn run_report(&self, _params: &serde_json::Value, result: &RunResult) -> Result<Report, ReporterError> {
    self.phases.lock().push(ReportPhase::Run(result.run));
    self.runs.lock().push(result.clone());
    if self.unrecoverable {
      return Err(ReporterError::Unrecoverable("device bricked".to_string()));
    }
    Ok(Report {
      success: result.failed.is_empty(),
      data: serde_json::json!({ "passed": result.passed.len() }),
    })
  }

  async fn final_report(&self, _params: &serde_json::Value, results: &FinalResults) -> Result<Report, ReporterError> {
    self.phases.lock().push(ReportPhase::Final);
    Ok(Report {
      success: results.failed() == 0,
      data: serde_json::json!({ "state": results.state.name() }),
    })
  }
}

// --- Job builders ---

pub fn job_with(steps: Vec<(&str, Arc<dyn TestStep>)>, runs: u32, reporter: Arc<dyn Reporter>) -> Job {
  Job {
    id: JobId(42),
    name: "integration".to_string(),
    tags: vec!["lab".to_string()],
    runs,
    run_interval: Duration::ZERO,
    target_manager_acquire_timeout: Duration::from_secs(5),
    target_manager_release_timeout: Duration::from_secs(5),
    acquire_parameters: serde_json::json!({ "pool": "default" }),
    steps: steps
      .into_iter()
      .map(|(label, step)| StepBundle::new(label, step, StepParameters::new()))
      .collect(),
    run_reporters: vec![ReporterBundle::new(reporter.clone(), serde_json::Value::Null)],
    final_reporters: vec![ReporterBundle::new(reporter, serde_json::Value::Null)],
  }
}

pub fn target_ids(ids: &[contest::TargetId]) -> Vec<String> {
  let mut ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
  ids.sort();
  ids
}

// --- Helper for Tracing Setup (call once per test run if needed) ---
use once_cell::sync::Lazy;
static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer() // Important for tests to capture output
    .try_init()
    .ok(); // Allow multiple initializations in tests (ok if fails)
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}
