// contest/examples/pause_resume.rs

use async_trait::async_trait;
use contest::{
  AcquireCriteria, Descriptor, EngineConfig, JobHandle, JobId, JobState, Orchestrator, PluginRegistryBuilder, Target,
  TargetError, TargetManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

// Hands out the same three machines every run, or exactly the pinned ones
// when a paused job comes back for them.
struct StaticTargetManager;

#[async_trait]
impl TargetManager for StaticTargetManager {
  async fn acquire(&self, criteria: &AcquireCriteria, _deadline: Instant) -> Result<Vec<Target>, TargetError> {
    if !criteria.pinned.is_empty() {
      info!(count = criteria.pinned.len(), "Re-locking pinned targets.");
      return Ok(criteria.pinned.clone());
    }
    Ok(vec![Target::new("dut-1"), Target::new("dut-2"), Target::new("dut-3")])
  }

  async fn release(&self, _job_id: JobId, targets: &[Target], _deadline: Instant) -> Result<(), TargetError> {
    info!(count = targets.len(), "Released targets.");
    Ok(())
  }
}

const JOB: &str = r#"{
  "JobName": "long soak",
  "Version": "1.0",
  "Runs": 1,
  "TestStepDescriptors": [
    { "name": "sleep", "label": "soak", "parameters": { "duration": "2s" } },
    { "name": "noop", "label": "verify" }
  ],
  "Reporting": { "FinalReporters": [{ "Name": "targetsuccess" }] }
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

  info!("--- Pause / Resume Example ---");

  let registry = PluginRegistryBuilder::with_builtins().build();
  let config = EngineConfig::default();
  let job = Descriptor::from_json(JOB)?.build(JobId(7), &registry, &config)?;
  let orchestrator = Orchestrator::new(config, Arc::new(StaticTargetManager));

  // 1. Start the job and pause it half-way through the soak.
  let handle = JobHandle::new();
  let (paused, _) = tokio::join!(orchestrator.run_controlled(job.clone(), &handle), async {
    tokio::time::sleep(Duration::from_millis(800)).await;
    handle.pause();
  });
  let paused = paused?;
  info!(state = %paused.state, "First execution returned.");

  // 2. The resume state is plain data; it could be persisted between the two halves.
  let Some(resume) = paused.resume else {
    info!("Job finished before the pause took hold.");
    return Ok(());
  };
  info!(state = %serde_json::to_string_pretty(&resume)?, "Resume state.");

  // 3. Continue where the soak left off.
  let handle = JobHandle::new();
  let summary = orchestrator.resume(job, &handle, resume).await?;
  info!(state = %summary.state, succeeded = summary.succeeded, "Resumed execution returned.");
  assert_eq!(summary.state, JobState::Completed);
  Ok(())
}
