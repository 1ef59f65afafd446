//! # kiln-engine
//!
//! Runs the Dreambooth side of Kiln: launches fine-tuning through
//! `accelerate`, serves generated images from trained artifacts, evaluates
//! artifacts on test prompts, and drives whole sweeps.

pub mod evaluate;
pub mod exec;
pub mod infer;
pub mod sweep;
pub mod tracker;
pub mod train;

#[cfg(test)]
mod test_support;

pub use evaluate::{evaluate_model, image_key};
pub use exec::{CommandRunner, CommandSpec};
pub use infer::{
    ExternalLoader, ExternalPipeline, ImagePipeline, Model, ModelRegistry, PipelineLoader,
};
pub use sweep::{SweepDriver, MODEL_DIR};
pub use tracker::{ExperimentTracker, LocalTracker, TrackerRecord};
pub use train::{Trainer, TrainingJob, DEFAULT_TRAIN_TIMEOUT};
