//! Image generation from fine-tuned artifacts.
//!
//! A [`Model`] initializes its pipeline on first use and keeps it for the
//! rest of the process; [`ModelRegistry`] holds one `Model` per artifact.
//! Nothing is ever evicted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kiln_data::VolumeMount;
use kiln_types::{AppConfig, GeneratedImage, KilnResult, PipelineError, TrainedArtifact};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use crate::exec::{CommandRunner, CommandSpec};

/// An initialized text-to-image pipeline.
#[async_trait]
pub trait ImagePipeline: Send + Sync {
    async fn generate(&self, prompt: &str, config: &AppConfig) -> KilnResult<GeneratedImage>;
}

/// Builds a pipeline from a base model plus fine-tuned weights on disk.
#[async_trait]
pub trait PipelineLoader: Send + Sync {
    async fn load(
        &self,
        base_model: &str,
        weights_dir: &Path,
    ) -> KilnResult<Arc<dyn ImagePipeline>>;
}

/// Pipeline backed by an external generator program.
///
/// Each call runs `<program> --base-model <m> --lora-dir <d> --prompt <p>
/// --steps <n> --guidance-scale <g> --output <file.png>` and reads the PNG
/// back.
#[derive(Debug, Clone)]
pub struct ExternalPipeline {
    program: String,
    base_model: String,
    weights_dir: PathBuf,
    scratch_dir: PathBuf,
    runner: CommandRunner,
}

impl ExternalPipeline {
    fn command(&self, prompt: &str, config: &AppConfig, output: &Path) -> CommandSpec {
        CommandSpec::new(&self.program)
            .arg("--base-model")
            .arg(&self.base_model)
            .arg("--lora-dir")
            .arg(self.weights_dir.display().to_string())
            .arg("--prompt")
            .arg(prompt)
            .arg("--steps")
            .arg(config.num_inference_steps.to_string())
            .arg("--guidance-scale")
            .arg(config.guidance_scale.to_string())
            .arg("--output")
            .arg(output.display().to_string())
    }
}

#[async_trait]
impl ImagePipeline for ExternalPipeline {
    async fn generate(&self, prompt: &str, config: &AppConfig) -> KilnResult<GeneratedImage> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let output = self.scratch_dir.join(format!("{}.png", Uuid::new_v4()));

        self.runner
            .run(&self.command(prompt, config, &output))
            .await
            .map_err(|e| PipelineError::GenerationFailed {
                prompt: prompt.to_string(),
                message: e.to_string(),
            })?;

        let png = tokio::fs::read(&output)
            .await
            .map_err(|_| PipelineError::NoImage {
                path: output.display().to_string(),
            })?;
        let _ = tokio::fs::remove_file(&output).await;

        Ok(GeneratedImage::new(png, prompt))
    }
}

/// Loader producing [`ExternalPipeline`]s.
#[derive(Debug, Clone)]
pub struct ExternalLoader {
    program: String,
    scratch_dir: PathBuf,
    runner: CommandRunner,
}

impl ExternalLoader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            scratch_dir: std::env::temp_dir().join("kiln-images"),
            runner: CommandRunner::new(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.runner = self.runner.env(key, value);
        self
    }
}

#[async_trait]
impl PipelineLoader for ExternalLoader {
    async fn load(
        &self,
        base_model: &str,
        weights_dir: &Path,
    ) -> KilnResult<Arc<dyn ImagePipeline>> {
        if !weights_dir.is_dir() {
            return Err(PipelineError::ArtifactMissing {
                path: weights_dir.display().to_string(),
            }
            .into());
        }
        Ok(Arc::new(ExternalPipeline {
            program: self.program.clone(),
            base_model: base_model.to_string(),
            weights_dir: weights_dir.to_path_buf(),
            scratch_dir: self.scratch_dir.clone(),
            runner: self.runner.clone(),
        }))
    }
}

/// One artifact served from one execution context.
pub struct Model {
    artifact: TrainedArtifact,
    mount: Arc<VolumeMount>,
    loader: Arc<dyn PipelineLoader>,
    pipeline: OnceCell<Arc<dyn ImagePipeline>>,
}

impl Model {
    pub fn new(
        artifact: TrainedArtifact,
        mount: Arc<VolumeMount>,
        loader: Arc<dyn PipelineLoader>,
    ) -> Self {
        Self {
            artifact,
            mount,
            loader,
            pipeline: OnceCell::new(),
        }
    }

    pub fn artifact(&self) -> &TrainedArtifact {
        &self.artifact
    }

    pub fn is_loaded(&self) -> bool {
        self.pipeline.initialized()
    }

    async fn pipeline(&self) -> KilnResult<&Arc<dyn ImagePipeline>> {
        self.pipeline
            .get_or_try_init(|| async {
                // pick up weights committed since this context was mounted
                let version = self.mount.reload_async().await?;
                let weights_dir = self.artifact.relocate(self.mount.path());
                info!(
                    "Loading pipeline for {} from {} (volume version {})",
                    self.artifact.name,
                    weights_dir.display(),
                    version
                );
                self.loader
                    .load(&self.artifact.config.shared.model_name, &weights_dir)
                    .await
            })
            .await
    }

    /// Generate one image for `prompt`.
    pub async fn inference(&self, prompt: &str, config: &AppConfig) -> KilnResult<GeneratedImage> {
        let pipeline = self.pipeline().await?;
        debug!("Generating {:?} with {}", prompt, self.artifact.name);
        pipeline.generate(prompt, config).await
    }
}

#[async_trait]
impl ImagePipeline for Model {
    async fn generate(&self, prompt: &str, config: &AppConfig) -> KilnResult<GeneratedImage> {
        self.inference(prompt, config).await
    }
}

/// Process-lifetime map from artifact name to its [`Model`].
pub struct ModelRegistry {
    mount: Arc<VolumeMount>,
    loader: Arc<dyn PipelineLoader>,
    models: DashMap<String, Arc<Model>>,
}

impl ModelRegistry {
    pub fn new(mount: Arc<VolumeMount>, loader: Arc<dyn PipelineLoader>) -> Self {
        Self {
            mount,
            loader,
            models: DashMap::new(),
        }
    }

    /// The model for `artifact`, created on first request.
    pub fn model(&self, artifact: &TrainedArtifact) -> Arc<Model> {
        self.models
            .entry(artifact.name.clone())
            .or_insert_with(|| {
                Arc::new(Model::new(
                    artifact.clone(),
                    self.mount.clone(),
                    self.loader.clone(),
                ))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
