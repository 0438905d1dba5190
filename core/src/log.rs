// contest/src/log.rs

//! Job log storage: the entries produced from job events, the paginated
//! query model used to read them back, and an in-memory store.
//!
//! Serving these over a network is somebody else's job; this module only
//! fixes the data model and the `LogStore` contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::core::event::{Event, EventSink};
use crate::error::StorageError;

/// Largest page a query may ask for; larger requests are clamped to it.
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE: u32 = 0;
/// Upper bound of a single store access made on behalf of the engine.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
  pub job_id: u64,
  pub log_data: String,
  pub date: DateTime<Utc>,
  pub log_level: String,
}

/// Filters as a client sends them. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
  pub job_id: Option<u64>,
  pub text: Option<String>,
  pub log_level: Option<String>,
  pub start_date: Option<DateTime<Utc>>,
  pub end_date: Option<DateTime<Utc>>,
  pub page_size: Option<u32>,
  pub page: Option<u32>,
}

/// Filters as a store receives them: page and page size always set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageQuery {
  pub job_id: Option<u64>,
  pub text: Option<String>,
  pub log_level: Option<String>,
  pub start_date: Option<DateTime<Utc>>,
  pub end_date: Option<DateTime<Utc>>,
  pub page: u32,
  pub page_size: u32,
}

impl LogQuery {
  /// Fills in the defaults. A page size is honoured only when it is below
  /// [`MAX_PAGE_SIZE`].
  pub fn to_storage_query(&self) -> StorageQuery {
    let page_size = match self.page_size {
      Some(size) if size < MAX_PAGE_SIZE => size,
      _ => MAX_PAGE_SIZE,
    };
    StorageQuery {
      job_id: self.job_id,
      text: self.text.clone(),
      log_level: self.log_level.clone(),
      start_date: self.start_date,
      end_date: self.end_date,
      page: self.page.unwrap_or(DEFAULT_PAGE),
      page_size,
    }
  }
}

impl StorageQuery {
  pub fn matches(&self, entry: &LogEntry) -> bool {
    self.job_id.map_or(true, |id| entry.job_id == id)
      && self.text.as_deref().map_or(true, |t| entry.log_data.contains(t))
      && self.log_level.as_deref().map_or(true, |l| entry.log_level == l)
      && self.start_date.map_or(true, |d| entry.date >= d)
      && self.end_date.map_or(true, |d| entry.date <= d)
  }
}

/// One page of matching logs plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPage {
  pub logs: Vec<LogEntry>,
  pub count: u64,
  pub page: u32,
  pub page_size: u32,
}

#[async_trait]
pub trait LogStore: Send + Sync {
  async fn store_log(&self, entry: LogEntry) -> Result<(), StorageError>;

  async fn get_logs(&self, query: &StorageQuery) -> Result<LogPage, StorageError>;
}

/// Keeps logs in memory, ordered by date.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
  logs: RwLock<Vec<LogEntry>>,
}

impl MemoryLogStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.logs.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.logs.read().is_empty()
  }
}

#[async_trait]
impl LogStore for MemoryLogStore {
  async fn store_log(&self, entry: LogEntry) -> Result<(), StorageError> {
    let mut logs = self.logs.write();
    let at = logs.partition_point(|l| l.date <= entry.date);
    logs.insert(at, entry);
    Ok(())
  }

  async fn get_logs(&self, query: &StorageQuery) -> Result<LogPage, StorageError> {
    let logs = self.logs.read();
    let matching: Vec<&LogEntry> = logs.iter().filter(|l| query.matches(l)).collect();
    let skip = (query.page as usize).saturating_mul(query.page_size as usize);
    Ok(LogPage {
      logs: matching
        .iter()
        .skip(skip)
        .take(query.page_size as usize)
        .map(|l| (*l).clone())
        .collect(),
      count: matching.len() as u64,
      page: query.page,
      page_size: query.page_size,
    })
  }
}

/// Serves reads from another store and refuses every write.
pub struct ReadOnlyLogStore {
  inner: Arc<dyn LogStore>,
}

impl ReadOnlyLogStore {
  pub fn new(inner: Arc<dyn LogStore>) -> Self {
    Self { inner }
  }
}

#[async_trait]
impl LogStore for ReadOnlyLogStore {
  async fn store_log(&self, _entry: LogEntry) -> Result<(), StorageError> {
    Err(StorageError::ReadOnly)
  }

  async fn get_logs(&self, query: &StorageQuery) -> Result<LogPage, StorageError> {
    self.inner.get_logs(query).await
  }
}

/// Level a job event is logged at.
fn level_of(name: &str) -> &'static str {
  if name.ends_with("Failed") || name.ends_with("Err") || name.ends_with("Leak") {
    "error"
  } else {
    "info"
  }
}

impl From<&Event> for LogEntry {
  fn from(e: &Event) -> Self {
    LogEntry {
      job_id: e.job_id.0,
      log_data: serde_json::to_string(e).unwrap_or_else(|_| e.name.clone()),
      date: e.emitted_at,
      log_level: level_of(&e.name).to_string(),
    }
  }
}

/// Event sink that turns every event into a [`LogEntry`] and writes it to a
/// [`LogStore`] from a background task, so emitting never waits on storage.
#[derive(Debug, Clone)]
pub struct LogEventSink {
  tx: mpsc::UnboundedSender<LogEntry>,
}

impl LogEventSink {
  /// Starts the writer task. It ends once every clone of the sink is dropped
  /// and the backlog is written.
  pub fn spawn(store: Arc<dyn LogStore>) -> (Self, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<LogEntry>();
    let writer = tokio::spawn(async move {
      while let Some(entry) = rx.recv().await {
        match tokio::time::timeout(DEFAULT_STORE_TIMEOUT, store.store_log(entry)).await {
          Ok(Ok(())) => {}
          Ok(Err(err)) => event!(Level::ERROR, error = %err, "Failed to store job log."),
          Err(_) => event!(Level::ERROR, timeout = ?DEFAULT_STORE_TIMEOUT, "Storing job log timed out."),
        }
      }
    });
    (Self { tx }, writer)
  }
}

impl EventSink for LogEventSink {
  fn emit(&self, event: Event) {
    if self.tx.send(LogEntry::from(&event)).is_err() {
      event!(Level::WARN, event_name = %event.name, "Log writer is gone; event dropped.");
    }
  }
}
