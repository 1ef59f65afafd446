//! Shared fakes for engine tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_data::{Volume, VolumeMount};
use kiln_types::{AppConfig, GeneratedImage, KilnResult, PipelineError};
use tempfile::TempDir;

use crate::infer::{ImagePipeline, PipelineLoader};

/// Model volume in a scratch directory with one writer context.
pub struct TestVolume {
    root: TempDir,
    writer: VolumeMount,
}

impl TestVolume {
    pub fn with_artifacts(names: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let volume =
            Volume::from_name(root.path().join("volumes"), "dreambooth-flux", true).unwrap();
        let writer = volume.mount_in_new_context(root.path().join("contexts")).unwrap();
        let test_volume = Self { root, writer };
        for name in names {
            test_volume.commit_artifact(name);
        }
        test_volume
    }

    /// Write weights for `name` and commit them.
    pub fn commit_artifact(&self, name: &str) {
        let dir = self.writer.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("pytorch_lora_weights.safetensors"), name).unwrap();
        self.writer.commit().unwrap();
    }

    /// A mount in a fresh context.
    pub fn reader(&self) -> Arc<VolumeMount> {
        Arc::new(
            self.writer
                .volume()
                .mount_in_new_context(self.root.path().join("contexts"))
                .unwrap(),
        )
    }
}

/// Returns `png:<prompt>` as the image bytes.
pub struct FakePipeline;

#[async_trait]
impl ImagePipeline for FakePipeline {
    async fn generate(&self, prompt: &str, _config: &AppConfig) -> KilnResult<GeneratedImage> {
        Ok(GeneratedImage::new(format!("png:{prompt}").into_bytes(), prompt))
    }
}

#[derive(Default)]
pub struct FakeLoader {
    loads: AtomicUsize,
}

impl FakeLoader {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineLoader for FakeLoader {
    async fn load(
        &self,
        _base_model: &str,
        weights_dir: &Path,
    ) -> KilnResult<Arc<dyn ImagePipeline>> {
        if !weights_dir.is_dir() {
            return Err(PipelineError::ArtifactMissing {
                path: weights_dir.display().to_string(),
            }
            .into());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakePipeline))
    }
}

/// Write an executable script into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
