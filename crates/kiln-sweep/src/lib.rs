//! # kiln-sweep
//!
//! Hyperparameter sweeps for Kiln.
//!
//! Provides the sweep space and grid generator that expands value lists into
//! one training configuration per combination, run tracking for a sweep in
//! progress, and a fan-out dispatcher that runs every configuration
//! concurrently and yields results in completion order.

mod dispatch;
mod run;
mod search;

pub use dispatch::{dispatch_all, Completions, DispatchConfig};
pub use run::{RunStatus, SweepId, SweepRun, SweepState, SweepStatus};
pub use search::{generate_sweep_configs, GridSweep, SweepPoint, SweepSpace, SweepValue};
