//! Sweep driver: train every configuration concurrently, evaluate each
//! artifact as its training finishes.

use std::path::Path;
use std::sync::Arc;

use kiln_sweep::{dispatch_all, generate_sweep_configs, DispatchConfig, SweepStatus};
use kiln_types::{AppConfig, KilnResult, SweepConfig};
use tracing::{error, info};

use crate::evaluate::evaluate_model;
use crate::infer::ModelRegistry;
use crate::tracker::ExperimentTracker;
use crate::train::Trainer;

/// Mount point of the model volume as seen by training configs.
pub const MODEL_DIR: &str = "/model";

/// Everything a sweep needs besides its configuration.
pub struct SweepDriver {
    trainer: Arc<dyn Trainer>,
    registry: Arc<ModelRegistry>,
    tracker: Arc<dyn ExperimentTracker>,
    dispatch: DispatchConfig,
    app_config: AppConfig,
}

impl SweepDriver {
    pub fn new(
        trainer: Arc<dyn Trainer>,
        registry: Arc<ModelRegistry>,
        tracker: Arc<dyn ExperimentTracker>,
    ) -> Self {
        Self {
            trainer,
            registry,
            tracker,
            dispatch: DispatchConfig::default(),
            app_config: AppConfig::default(),
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_app_config(mut self, app_config: AppConfig) -> Self {
        self.app_config = app_config;
        self
    }

    /// Run the whole sweep. Failed runs are recorded in the returned status
    /// (which then ends `Failed`) rather than aborting the other runs; nothing
    /// is retried.
    pub async fn run(&self, sweep: &SweepConfig) -> KilnResult<SweepStatus> {
        let configs = generate_sweep_configs(sweep, Path::new(MODEL_DIR));
        let mut status = SweepStatus::new("sweep_summary", &configs);
        info!("Starting sweep {} with {} runs", status.id, configs.len());
        status.mark_running();

        let trainer = self.trainer.clone();
        let mut completions = dispatch_all(configs, &self.dispatch, move |config| {
            let trainer = trainer.clone();
            async move { trainer.train(config).await }
        });

        while let Some((index, result)) = completions.next().await {
            let artifact = match result {
                Ok(artifact) => artifact,
                Err(e) => {
                    error!("Training run {} failed: {}", index, e);
                    if let Some(run) = status.run_mut(index) {
                        run.mark_failed(e.to_string());
                    }
                    continue;
                }
            };
            info!("Training run {} finished: {}", index, artifact.name);

            let model = self.registry.model(&artifact);
            let evaluated = evaluate_model(
                model,
                &sweep.test_prompts,
                &self.app_config,
                self.tracker.as_ref(),
            )
            .await;

            if let Some(run) = status.run_mut(index) {
                run.mark_completed(artifact);
                if let Err(e) = evaluated {
                    error!("Evaluation of run {} failed: {}", index, e);
                    run.mark_failed(format!("evaluation failed: {e}"));
                }
            }
        }

        status.finish();
        info!(
            "Sweep {} finished: {:?} ({} failed)",
            status.id,
            status.state,
            status.count(kiln_sweep::RunStatus::Failed)
        );
        Ok(status)
    }
}
