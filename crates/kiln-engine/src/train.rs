//! Fine-tuning through the external `accelerate` launcher.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kiln_data::Volume;
use kiln_types::{
    config_error, validation_error, KilnResult, KilnSettings, TrainConfig, TrainedArtifact,
};
use tracing::{debug, info};

use crate::exec::{CommandRunner, CommandSpec};

/// Coarse ceiling on one training run.
pub const DEFAULT_TRAIN_TIMEOUT: Duration = Duration::from_secs(7200);

/// Anything that turns a training config into trained weights.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(&self, config: TrainConfig) -> KilnResult<TrainedArtifact>;
}

/// Runs the diffusers Dreambooth script in a fresh execution context with the
/// model volume mounted, then commits the volume.
#[derive(Debug, Clone)]
pub struct TrainingJob {
    volume: Volume,
    contexts_dir: PathBuf,
    accelerate_program: String,
    diffusers_dir: PathBuf,
    runner: CommandRunner,
}

impl TrainingJob {
    pub fn new(
        volume: Volume,
        contexts_dir: impl Into<PathBuf>,
        accelerate_program: impl Into<String>,
        diffusers_dir: impl Into<PathBuf>,
    ) -> Self {
        let diffusers_dir = diffusers_dir.into();
        Self {
            volume,
            contexts_dir: contexts_dir.into(),
            accelerate_program: accelerate_program.into(),
            runner: CommandRunner::new()
                .working_dir(diffusers_dir.clone())
                .timeout(DEFAULT_TRAIN_TIMEOUT),
            diffusers_dir,
        }
    }

    pub fn from_settings(settings: &KilnSettings) -> KilnResult<Self> {
        let volume = Volume::from_name(settings.volumes_dir(), &settings.model_volume, true)?;
        let mut job = Self::new(
            volume,
            settings.contexts_dir(),
            settings.accelerate_program.clone(),
            settings.diffusers_dir.clone(),
        );
        if let Some(ref token) = settings.hf_token {
            job.runner = job.runner.env("HF_TOKEN", token.clone());
        }
        Ok(job)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runner = self.runner.timeout(timeout);
        self
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Write a default accelerate config for the given precision.
    pub async fn prepare_accelerate(&self, mixed_precision: &str) -> KilnResult<()> {
        let spec = CommandSpec::new(&self.accelerate_program)
            .args(["config", "default", "--mixed_precision"])
            .arg(mixed_precision);
        self.runner.run(&spec).await
    }

    fn check_checkout(&self) -> KilnResult<()> {
        if self.diffusers_dir.is_dir() {
            Ok(())
        } else {
            Err(config_error!(
                "diffusers checkout not found at {}",
                self.diffusers_dir.display()
            ))
        }
    }
}

fn artifact_name(output_dir: &Path) -> KilnResult<String> {
    output_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            validation_error!("output_dir {} has no final component", output_dir.display())
        })
}

#[async_trait]
impl Trainer for TrainingJob {
    async fn train(&self, config: TrainConfig) -> KilnResult<TrainedArtifact> {
        config.validate()?;
        self.check_checkout()?;
        let name = artifact_name(&config.output_dir)?;

        // The context, with its copy of the volume, goes away with `mount`.
        let mount = self.volume.mount_in_new_context_async(&self.contexts_dir).await?;
        let local_output = mount.path().join(&name);
        let launch = config.clone().with_output_dir(local_output.clone());

        self.prepare_accelerate(&config.mixed_precision).await?;

        info!(
            "Launching training for {} (max_train_steps={}, rank={})",
            name, config.max_train_steps, config.rank
        );
        debug!("Instance phrase for {}: {:?}", name, config.training_prompt());
        let spec = CommandSpec::new(&self.accelerate_program).args(launch.launch_args());
        self.runner.run(&spec).await?;

        let local = TrainedArtifact {
            name,
            path: local_output,
            config,
        };
        local.save()?;

        let version = mount.commit_async().await?;
        info!("Training run {} committed at volume version {}", local.name, version);
        Ok(TrainedArtifact::new(local.config))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_script;
    use kiln_types::KilnError;
    use tempfile::tempdir;

    const STUB_ACCELERATE: &str = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/calls.log"
if [ "$1" = "launch" ]; then
  for arg in "$@"; do
    case "$arg" in
      --output_dir=*) out="${arg#--output_dir=}" ;;
      --max_train_steps=13) echo "diverged" >&2; exit 3 ;;
    esac
  done
  mkdir -p "$out"
  echo weights > "$out/pytorch_lora_weights.safetensors"
fi
"#;

    fn job(root: &Path) -> TrainingJob {
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let accelerate = write_script(&bin, "accelerate", STUB_ACCELERATE);
        let diffusers = root.join("diffusers");
        std::fs::create_dir_all(&diffusers).unwrap();

        let volume = Volume::from_name(root.join("volumes"), "dreambooth-flux", true).unwrap();
        TrainingJob::new(volume, root.join("contexts"), accelerate.display().to_string(), diffusers)
    }

    #[tokio::test]
    async fn train_commits_weights_and_returns_config() {
        let root = tempdir().unwrap();
        let job = job(root.path());
        let config = TrainConfig::default()
            .with_max_train_steps(10)
            .with_rank(4)
            .with_output_dir("/model/steps_10_rank_4");

        let artifact = job.train(config.clone()).await.unwrap();

        assert_eq!(artifact.name, "steps_10_rank_4");
        assert_eq!(artifact.path, PathBuf::from("/model/steps_10_rank_4"));
        assert_eq!(artifact.config, config);
        assert_eq!(job.volume().version().unwrap(), 1);
        // the training context is gone once the run returns
        assert_eq!(std::fs::read_dir(root.path().join("contexts")).unwrap().count(), 0);

        let reader = job.volume().mount_in_new_context(root.path().join("contexts")).unwrap();
        let weights = artifact
            .relocate(reader.path())
            .join("pytorch_lora_weights.safetensors");
        assert!(weights.is_file());
        let handle = TrainedArtifact::load(reader.path(), "steps_10_rank_4").unwrap();
        assert_eq!(handle.config, config);

        let calls = std::fs::read_to_string(root.path().join("bin/calls.log")).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], "config default --mixed_precision bf16");
        assert!(calls[1].starts_with("launch examples/dreambooth/train_dreambooth_lora_flux.py"));
        assert!(calls[1].contains("--rank=4"));
    }

    #[tokio::test]
    async fn failed_training_does_not_commit() {
        let root = tempdir().unwrap();
        let job = job(root.path());
        let config = TrainConfig::default()
            .with_max_train_steps(13)
            .with_output_dir("/model/steps_13_rank_16");

        let err = job.train(config).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(job.volume().version().unwrap(), 0);
        assert_eq!(std::fs::read_dir(root.path().join("contexts")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn invalid_config_never_launches() {
        let root = tempdir().unwrap();
        let job = job(root.path());

        let err = job.train(TrainConfig::default().with_rank(0)).await.unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));
        assert!(!root.path().join("bin/calls.log").exists());
    }
}
