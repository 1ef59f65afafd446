use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::TrainConfig;
use crate::errors::{KilnResult, PipelineError};

/// Handle file written inside every artifact directory.
pub const ARTIFACT_FILE: &str = "kiln-artifact.json";

/// Handle to fine-tuned weights written by one training run.
///
/// Training hands this back and evaluation/serving consume it as-is, so
/// nothing downstream needs to rebuild the directory name from parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedArtifact {
    /// Directory name under the model volume, e.g. `steps_2000_rank_8`.
    pub name: String,
    /// `<model_dir>/<name>` for handles returned by training; the path inside
    /// the mount for handles loaded with [`TrainedArtifact::load`].
    pub path: PathBuf,
    /// The configuration that produced the weights, unchanged.
    pub config: TrainConfig,
}

impl TrainedArtifact {
    pub fn new(config: TrainConfig) -> Self {
        let name = config
            .output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            path: config.output_dir.clone(),
            config,
        }
    }

    /// The same artifact as seen through another mount of the model volume.
    pub fn relocate(&self, mount_root: &Path) -> PathBuf {
        mount_root.join(&self.name)
    }

    /// Write the handle into the artifact directory.
    pub fn save(&self) -> KilnResult<()> {
        std::fs::create_dir_all(&self.path)?;
        std::fs::write(self.path.join(ARTIFACT_FILE), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Read the handle of artifact `name` from a mount of the model volume.
    /// The returned path points into that mount.
    pub fn load(mount_root: &Path, name: &str) -> KilnResult<Self> {
        let dir = mount_root.join(name);
        let raw = std::fs::read_to_string(dir.join(ARTIFACT_FILE)).map_err(|_| {
            PipelineError::ArtifactMissing {
                path: dir.display().to_string(),
            }
        })?;
        let mut artifact: Self = serde_json::from_str(&raw)?;
        artifact.path = dir;
        Ok(artifact)
    }
}

/// One generated image paired with the prompt that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    /// PNG-encoded bytes.
    pub png: Vec<u8>,
    pub prompt: String,
}

impl GeneratedImage {
    pub fn new(png: Vec<u8>, prompt: impl Into<String>) -> Self {
        Self {
            png,
            prompt: prompt.into(),
        }
    }
}
