// contest/examples/basic_job.rs

use async_trait::async_trait;
use contest::core::MemoryEventSink;
use contest::{
  AcquireCriteria, ContestResult, Descriptor, EngineConfig, JobId, Orchestrator, PluginRegistryBuilder, Target,
  TargetError, TargetManager,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

// 1. A target manager backed by a fixed in-memory inventory.
//    Real deployments would lock machines in a lab inventory service.
struct InventoryTargetManager {
  free: Mutex<Vec<Target>>,
}

impl InventoryTargetManager {
  fn new(hosts: &[&str]) -> Self {
    Self {
      free: Mutex::new(
        hosts
          .iter()
          .map(|h| Target::new(*h).with_fqdn(format!("{}.lab.example", h)))
          .collect(),
      ),
    }
  }
}

#[async_trait]
impl TargetManager for InventoryTargetManager {
  async fn acquire(&self, criteria: &AcquireCriteria, _deadline: Instant) -> Result<Vec<Target>, TargetError> {
    let mut free = self.free.lock();
    if free.is_empty() {
      return Err(TargetError::Unavailable("inventory exhausted".to_string()));
    }
    info!(job_id = %criteria.job_id, run = criteria.run, count = free.len(), "Locking targets.");
    Ok(std::mem::take(&mut *free))
  }

  async fn release(&self, job_id: JobId, targets: &[Target], _deadline: Instant) -> Result<(), TargetError> {
    info!(%job_id, count = targets.len(), "Unlocking targets.");
    self.free.lock().extend_from_slice(targets);
    Ok(())
  }
}

// 2. The job, as a client would submit it.
const JOB: &str = r#"{
  "JobName": "smoke test",
  "Version": "1.0",
  "Runs": 2,
  "RunInterval": "100ms",
  "TestStepDescriptors": [
    { "name": "noop", "label": "check-power" },
    { "name": "sleep", "label": "soak", "parameters": { "duration": "250ms" } }
  ],
  "Reporting": {
    "RunReporters": [{ "Name": "TargetSuccess" }],
    "FinalReporters": [{ "Name": "TargetSuccess" }]
  }
}"#;

#[tokio::main]
async fn main() -> ContestResult<()> {
  // Initialize tracing (optional, for demonstration)
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

  info!("--- Basic Job Example ---");

  // 3. Plugins: the built-in steps and reporter are enough here.
  let registry = PluginRegistryBuilder::with_builtins().build();

  // 4. Descriptor -> Job
  let config = EngineConfig::from_env()?;
  let job = Descriptor::from_json(JOB)?.build(JobId(1), &registry, &config)?;

  // 5. Run it
  let sink = Arc::new(MemoryEventSink::new());
  let orchestrator = Orchestrator::new(config, Arc::new(InventoryTargetManager::new(&["node-a", "node-b", "node-c"])))
    .with_event_sink(sink.clone())
    .with_functions(registry.functions());
  let summary = orchestrator.run(job).await?;

  info!(
    state = %summary.state,
    succeeded = summary.succeeded,
    failed = summary.failed,
    events = sink.events().len(),
    "Job finished."
  );
  for record in &summary.final_reports {
    info!(reporter = %record.reporter, outcome = ?record.outcome, "Final report.");
  }
  Ok(())
}
