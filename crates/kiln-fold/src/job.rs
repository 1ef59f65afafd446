//! A single predictor run in its own execution context.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_data::{
    download_to_volume, package_outputs, SnapshotOutcome, SnapshotRequest, SnapshotSource, Volume,
};
use kiln_engine::{CommandRunner, CommandSpec};
use kiln_types::{internal_error, FoldError, KilnResult, KilnSettings};
use tracing::info;

use crate::input::FoldInput;
use crate::options::PredictOptions;

/// Name the input document is written under on the worker.
pub const INPUT_FILE: &str = "input.yaml";

pub const DEFAULT_PREDICT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Directory the predictor writes for an input file.
pub fn results_dir_name(input_file: &str) -> String {
    let stem = Path::new(input_file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("boltz_results_{stem}")
}

/// Runs the predictor against the weights volume.
#[derive(Debug, Clone)]
pub struct FoldJob {
    predictor_program: String,
    weights_volume: Volume,
    contexts_dir: PathBuf,
    timeout: Duration,
}

impl FoldJob {
    pub fn new(
        predictor_program: impl Into<String>,
        weights_volume: Volume,
        contexts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            predictor_program: predictor_program.into(),
            weights_volume,
            contexts_dir: contexts_dir.into(),
            timeout: DEFAULT_PREDICT_TIMEOUT,
        }
    }

    pub fn from_settings(settings: &KilnSettings) -> KilnResult<Self> {
        let volume = Volume::from_name(settings.volumes_dir(), &settings.weights_volume, true)?;
        Ok(Self::new(
            settings.predictor_program.clone(),
            volume,
            settings.contexts_dir(),
        ))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn weights_volume(&self) -> &Volume {
        &self.weights_volume
    }

    /// Fetch a weights snapshot into the weights volume and commit it.
    pub async fn download_weights(
        &self,
        source: Arc<dyn SnapshotSource>,
        request: SnapshotRequest,
    ) -> KilnResult<SnapshotOutcome> {
        let mount = self
            .weights_volume
            .mount_in_new_context_async(&self.contexts_dir)
            .await?;
        let outcome = download_to_volume(source, request, &mount).await?;
        info!("Model weights in volume {}: {:?}", self.weights_volume.name(), outcome);
        Ok(outcome)
    }

    /// Run one prediction and return its results directory as a zip archive.
    /// The execution context, weights copy and scratch files included, is
    /// removed before this returns.
    pub async fn predict(
        &self,
        input: &FoldInput,
        options: &PredictOptions,
    ) -> KilnResult<Vec<u8>> {
        let mount = self
            .weights_volume
            .mount_in_new_context_async(&self.contexts_dir)
            .await?;
        let work_dir = mount
            .context_dir()
            .ok_or_else(|| internal_error!("weights mount has no execution context"))?
            .join("work");
        input.write_to(&work_dir, INPUT_FILE)?;

        let options = options.clone().with_cache(mount.path());
        let spec = CommandSpec::new(&self.predictor_program)
            .arg("predict")
            .arg(INPUT_FILE)
            .args(options.to_args());

        info!("Predicting structure using weights from {}", mount.path().display());
        CommandRunner::new()
            .working_dir(&work_dir)
            .timeout(self.timeout)
            .run(&spec)
            .await?;

        let results = work_dir.join(results_dir_name(INPUT_FILE));
        if !results.is_dir() {
            return Err(FoldError::NoResults {
                path: results.display().to_string(),
            }
            .into());
        }
        info!("Packaging up outputs from {}", results.display());
        package_outputs(&results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_dir_uses_input_stem() {
        assert_eq!(results_dir_name("input.yaml"), "boltz_results_input");
        assert_eq!(results_dir_name("8ayv.yml"), "boltz_results_8ayv");
    }
}
