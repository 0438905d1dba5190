// src/lib.rs

//! Contest: an asynchronous test job engine.
//!
//! A job is an ordered pipeline of pluggable test steps that runs one or
//! more times against targets leased from a target manager. Contest gives
//! you:
//!  - Per-step workers joined by bounded channels, so targets stream through
//!    the pipeline independently of each other.
//!  - A job state machine with pause, resume and cancel, where paused jobs
//!    carry per-target checkpoints.
//!  - A target lease ledger that releases every acquired target exactly once.
//!  - Plugin registries for steps, reporters and parameter template functions.
//!  - Run and final reporters evaluating the outcome of each run and the job.

pub mod config;
pub mod core;
pub mod error;
pub mod functions;
pub mod job;
pub mod log;
pub mod pipeline;
pub mod registry;
pub mod reporter;
pub mod steps;
pub mod target_manager;

// --- Re-exports for the Public API ---

// Plugin-facing types
pub use crate::core::{
  Checkpoint, Event, EventSink, MemoryEventSink, ResumeState, StepContext, StepEmitter, StepParameters, StepRun,
  StepVariables, StopReason, Target, TargetCheckpoint, TargetId, TargetOutcome, TestStep, TracingEventSink,
};
pub use crate::reporter::{FinalResults, Report, Reporter, RunResult};
pub use crate::target_manager::{AcquireCriteria, TargetManager};

// Jobs and their execution
pub use crate::config::EngineConfig;
pub use crate::job::{Descriptor, Job, JobId, JobState};
pub use crate::pipeline::{JobHandle, JobSummary, Orchestrator};
pub use crate::registry::{PluginRegistry, PluginRegistryBuilder};

pub use crate::error::{ContestError, ContestResult, StepError, TargetError};

/*
    Typical flow:
    1. Build a `PluginRegistry` with your steps, reporters and functions.
    2. Parse a `Descriptor` from JSON and `build` it into a `Job`.
    3. Create an `Orchestrator` around your `TargetManager`.
    4. `run` the job, or `run_controlled` it with a `JobHandle` you can pause
       or cancel from elsewhere.
    5. A paused job's `JobSummary::resume` feeds `Orchestrator::resume`.
*/
