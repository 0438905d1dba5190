// contest/src/pipeline/mod.rs

//! The test step pipeline: channel topology, per-step runners and the
//! orchestrator that drives a job through its runs.

pub mod orchestrator;
pub(crate) mod runner;
pub mod topology;

pub use orchestrator::{JobHandle, JobSummary, Orchestrator};
pub use topology::{StepReport, TargetToken, Topology};
