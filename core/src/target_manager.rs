// contest/src/target_manager.rs

//! The target manager capability and the mediator that puts deadlines around it.
//!
//! The mediator is the only component that talks to the target manager. It
//! guarantees that every acquired target gets exactly one release attempt,
//! that repeated release requests are no-ops, and that slow or failed
//! releases are counted as leaks instead of disappearing silently.
//!
//! [`InFlightSet`] is the orchestrator's view of which acquired targets have
//! not yet come out of the pipeline, and where each one currently is.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{event, instrument, Level};

use crate::core::checkpoint::Checkpoint;
use crate::core::control::JobSignal;
use crate::core::target::{Target, TargetId};
use crate::error::TargetError;
use crate::job::JobId;

/// What the orchestrator asks the target manager for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireCriteria {
  pub job_id: JobId,
  pub run: u32,
  pub tags: Vec<String>,
  /// Job-supplied selection parameters, opaque to the engine.
  pub parameters: serde_json::Value,
  /// When non-empty, exactly these targets are wanted back (resume after pause).
  pub pinned: Vec<Target>,
}

/// Pluggable source of targets.
///
/// Implementations should give up by `deadline`; the mediator enforces it
/// regardless and reports `TargetError::Timeout` when it passes.
#[async_trait]
pub trait TargetManager: Send + Sync {
  async fn acquire(&self, criteria: &AcquireCriteria, deadline: Instant) -> Result<Vec<Target>, TargetError>;

  async fn release(&self, job_id: JobId, targets: &[Target], deadline: Instant) -> Result<(), TargetError>;
}

/// Result of one release request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
  pub released: usize,
  pub leaked: usize,
  /// Targets that had already been released (or were never held).
  pub skipped: usize,
  pub error: Option<TargetError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLedger {
  pub acquired: usize,
  pub released: usize,
  pub leaked: usize,
}

impl TargetLedger {
  /// Every acquired target had its single release attempt.
  pub fn is_balanced(&self) -> bool {
    self.acquired == self.released + self.leaked
  }
}

#[derive(Debug, Default)]
struct Holdings {
  held: HashMap<TargetId, Target>,
  done: HashSet<TargetId>,
  ledger: TargetLedger,
}

/// Deadline-enforcing, idempotent front of a [`TargetManager`] for one job.
pub struct TargetMediator {
  manager: Arc<dyn TargetManager>,
  job_id: JobId,
  acquire_timeout: Duration,
  release_timeout: Duration,
  holdings: Mutex<Holdings>,
}

impl TargetMediator {
  pub fn new(
    manager: Arc<dyn TargetManager>,
    job_id: JobId,
    acquire_timeout: Duration,
    release_timeout: Duration,
  ) -> Self {
    Self {
      manager,
      job_id,
      acquire_timeout,
      release_timeout,
      holdings: Mutex::new(Holdings::default()),
    }
  }

  /// Acquires targets under the job's acquire timeout.
  ///
  /// An elapsed deadline is `TargetError::Timeout`, an empty answer is
  /// `TargetError::Unavailable`; neither leaves anything held. If the job is
  /// asked to stop while the call is outstanding, whatever comes back is
  /// released straight away.
  #[instrument(name = "TargetMediator::acquire", skip_all, fields(job_id = %self.job_id, run = criteria.run), err(Display))]
  pub async fn acquire(&self, criteria: &AcquireCriteria, signal: &JobSignal) -> Result<Vec<Target>, TargetError> {
    let deadline = Instant::now() + self.acquire_timeout;
    let targets = match timeout_at(deadline, self.manager.acquire(criteria, deadline)).await {
      Ok(result) => result?,
      Err(_) => {
        event!(Level::WARN, timeout = ?self.acquire_timeout, "Target acquisition timed out.");
        return Err(TargetError::Timeout(self.acquire_timeout));
      }
    };

    if targets.is_empty() {
      return Err(TargetError::Unavailable("target manager returned no targets".to_string()));
    }

    let mut unique = Vec::with_capacity(targets.len());
    {
      let mut holdings = self.holdings.lock();
      for target in targets {
        if holdings.held.contains_key(&target.id) || unique.iter().any(|t: &Target| t.id == target.id) {
          event!(Level::WARN, target = %target.id, "Target manager returned a target that is already held; ignoring.");
          continue;
        }
        unique.push(target);
      }
      for target in &unique {
        holdings.done.remove(&target.id);
        holdings.held.insert(target.id.clone(), target.clone());
      }
      holdings.ledger.acquired += unique.len();
    }
    event!(Level::DEBUG, count = unique.len(), "Targets acquired.");

    if signal.is_stopping() {
      event!(Level::INFO, "Job stopping during acquisition; releasing fresh targets.");
      self.release(&unique).await;
      return Err(TargetError::Unavailable("job is stopping".to_string()));
    }
    Ok(unique)
  }

  /// Releases the given targets under the job's release timeout.
  ///
  /// Targets that were already released, or never acquired through this
  /// mediator, are skipped. A release that errors or overruns its deadline
  /// marks the targets leaked; they are not retried.
  #[instrument(name = "TargetMediator::release", skip_all, fields(job_id = %self.job_id, requested = targets.len()))]
  pub async fn release(&self, targets: &[Target]) -> ReleaseOutcome {
    let mut outcome = ReleaseOutcome::default();
    let to_release: Vec<Target> = {
      let mut holdings = self.holdings.lock();
      let mut batch = Vec::new();
      for target in targets {
        match holdings.held.remove(&target.id) {
          Some(held) => {
            holdings.done.insert(held.id.clone());
            batch.push(held);
          }
          None => outcome.skipped += 1,
        }
      }
      batch
    };
    if to_release.is_empty() {
      return outcome;
    }

    let deadline = Instant::now() + self.release_timeout;
    let result = match timeout_at(deadline, self.manager.release(self.job_id, &to_release, deadline)).await {
      Ok(result) => result,
      Err(_) => Err(TargetError::Timeout(self.release_timeout)),
    };

    let mut holdings = self.holdings.lock();
    match result {
      Ok(()) => {
        outcome.released = to_release.len();
        holdings.ledger.released += to_release.len();
      }
      Err(err) => {
        let ids: Vec<&str> = to_release.iter().map(|t| t.id.as_str()).collect();
        event!(Level::ERROR, error = %err, targets = ?ids, "Target release failed; targets leaked.");
        outcome.leaked = to_release.len();
        outcome.error = Some(err);
        holdings.ledger.leaked += to_release.len();
      }
    }
    outcome
  }

  /// Releases everything still held. Used as the last line of cleanup.
  pub async fn release_all(&self) -> ReleaseOutcome {
    let held: Vec<Target> = self.holdings.lock().held.values().cloned().collect();
    self.release(&held).await
  }

  pub fn held(&self) -> usize {
    self.holdings.lock().held.len()
  }

  pub fn ledger(&self) -> TargetLedger {
    self.holdings.lock().ledger
  }
}

impl std::fmt::Debug for TargetMediator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TargetMediator")
      .field("job_id", &self.job_id)
      .field("acquire_timeout", &self.acquire_timeout)
      .field("release_timeout", &self.release_timeout)
      .field("ledger", &self.ledger())
      .finish()
  }
}

/// Where an in-flight target currently sits in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightEntry {
  pub target: Target,
  /// Index of the step that owns the target. Equal to the number of steps
  /// once the last step forwarded it.
  pub step_index: usize,
  /// Last checkpoint the owning step returned for this target.
  pub checkpoint: Option<Checkpoint>,
}

/// Targets injected into the pipeline that have not been accounted for yet.
///
/// A drain (normal, pause or cancel) is complete exactly when this set is
/// empty. Every method takes the lock and drops it before returning.
#[derive(Debug, Default)]
pub struct InFlightSet {
  entries: Mutex<HashMap<TargetId, InFlightEntry>>,
}

impl InFlightSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, target: Target, step_index: usize, checkpoint: Option<Checkpoint>) {
    let id = target.id.clone();
    self.entries.lock().insert(
      id,
      InFlightEntry {
        target,
        step_index,
        checkpoint,
      },
    );
  }

  /// Hands the target to the step at `step_index`; the old checkpoint belongs
  /// to the previous step and is dropped.
  pub fn advance(&self, id: &TargetId, step_index: usize) {
    if let Some(entry) = self.entries.lock().get_mut(id) {
      entry.step_index = step_index;
      entry.checkpoint = None;
    }
  }

  pub fn record_checkpoint(&self, id: &TargetId, checkpoint: Checkpoint) {
    if let Some(entry) = self.entries.lock().get_mut(id) {
      entry.checkpoint = Some(checkpoint);
    }
  }

  pub fn remove(&self, id: &TargetId) -> Option<InFlightEntry> {
    self.entries.lock().remove(id)
  }

  pub fn contains(&self, id: &TargetId) -> bool {
    self.entries.lock().contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  /// Empties the set, returning the entries ordered by target id.
  pub fn drain(&self) -> Vec<InFlightEntry> {
    let mut entries: Vec<InFlightEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
    entries.sort_by(|a, b| a.target.id.cmp(&b.target.id));
    entries
  }
}
