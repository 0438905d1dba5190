pub mod checkpoint;
pub mod control;
pub mod event;
pub mod params;
pub mod step;
pub mod target;
pub mod variables;

// Re-export key types for easier access from other contest modules (and lib.rs)
pub use checkpoint::{Checkpoint, ResumeState, TargetCheckpoint};
pub use control::{JobSignal, StepContext, StopReason, TargetOutcome};
pub use event::{Event, EventSink, MemoryEventSink, StepEmitter, TracingEventSink};
pub use params::StepParameters;
pub use step::{StepBundle, StepFactory, StepRun, TestStep};
pub use target::{Target, TargetId};
pub use variables::{StepVariables, StepsVariables};
