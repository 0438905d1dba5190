// contest/src/steps/mod.rs

//! Test steps shipped with the engine.

pub mod noop;
pub mod sleep;

pub use noop::NoopStep;
pub use sleep::SleepStep;
