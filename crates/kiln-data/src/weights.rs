//! Model weight snapshots fetched from the Hugging Face Hub.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use kiln_types::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::volume::{run_blocking, VolumeMount};

const MARKER_FILE: &str = ".kiln-snapshot.json";
const DEFAULT_REVISION: &str = "main";

/// What to download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub repo_id: String,
    /// Commit, branch, or tag; `None` means `main`.
    pub revision: Option<String>,
    /// Fetch again even when the snapshot is already present.
    pub force_download: bool,
}

impl SnapshotRequest {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            revision: None,
            force_download: false,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_force_download(mut self, force: bool) -> Self {
        self.force_download = force;
        self
    }

    pub fn revision(&self) -> &str {
        self.revision.as_deref().unwrap_or(DEFAULT_REVISION)
    }

    /// Boltz-1 weights pinned to the revision the fold job was validated with.
    pub fn boltz1() -> Self {
        Self::new("boltz-community/boltz-1")
            .with_revision("7c1d83b779e4c65ecc37dfdf0c6b2788076f31e1")
    }
}

/// Written next to a completed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMarker {
    pub repo_id: String,
    pub revision: String,
    pub files: Vec<String>,
    pub downloaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    Downloaded { files: usize },
    AlreadyPresent,
}

/// Where snapshot files come from.
pub trait SnapshotSource: Send + Sync {
    /// Every file path in the repository at `revision`.
    fn list_files(&self, repo_id: &str, revision: &str) -> KilnResult<Vec<String>>;

    /// Fetch one file and return a local path to its contents.
    fn fetch(&self, repo_id: &str, revision: &str, file: &str) -> KilnResult<PathBuf>;
}

/// Hugging Face Hub source backed by the `hf-hub` sync client.
pub struct HubSource {
    api: Api,
}

impl HubSource {
    pub fn new(token: Option<String>) -> KilnResult<Self> {
        let api = ApiBuilder::new()
            .with_token(token)
            .with_progress(false)
            .build()
            .map_err(|e| KilnError::Download(format!("Failed to initialize HF API: {e}")))?;
        Ok(Self { api })
    }

    fn repo(&self, repo_id: &str, revision: &str) -> hf_hub::api::sync::ApiRepo {
        self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ))
    }
}

impl SnapshotSource for HubSource {
    fn list_files(&self, repo_id: &str, revision: &str) -> KilnResult<Vec<String>> {
        let info = self
            .repo(repo_id, revision)
            .info()
            .map_err(|e| KilnError::Download(format!("{repo_id}@{revision}: {e}")))?;
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    fn fetch(&self, repo_id: &str, revision: &str, file: &str) -> KilnResult<PathBuf> {
        self.repo(repo_id, revision)
            .get(file)
            .map_err(|e| KilnError::Download(format!("{repo_id}/{file}: {e}")))
    }
}

fn read_marker(local_dir: &Path) -> Option<SnapshotMarker> {
    let raw = std::fs::read_to_string(local_dir.join(MARKER_FILE)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Materialize a snapshot of `request` in `local_dir`.
///
/// A marker for the same repo and revision means the snapshot is present and
/// nothing is fetched, unless `force_download` is set.
pub fn download_snapshot(
    source: &dyn SnapshotSource,
    request: &SnapshotRequest,
    local_dir: &Path,
) -> KilnResult<SnapshotOutcome> {
    let revision = request.revision();

    if !request.force_download {
        if let Some(marker) = read_marker(local_dir) {
            if marker.repo_id == request.repo_id && marker.revision == revision {
                debug!(
                    "Snapshot {}@{} already in {}",
                    request.repo_id,
                    revision,
                    local_dir.display()
                );
                return Ok(SnapshotOutcome::AlreadyPresent);
            }
        }
    }

    let files = source.list_files(&request.repo_id, revision)?;
    std::fs::create_dir_all(local_dir)?;

    for file in &files {
        let cached = source.fetch(&request.repo_id, revision, file)?;
        let dest = local_dir.join(file);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&cached, &dest)?;
    }

    let marker = SnapshotMarker {
        repo_id: request.repo_id.clone(),
        revision: revision.to_string(),
        files: files.clone(),
        downloaded_at: Utc::now(),
    };
    std::fs::write(local_dir.join(MARKER_FILE), serde_json::to_vec_pretty(&marker)?)?;

    info!("Downloaded {} files of {}@{}", files.len(), request.repo_id, revision);
    Ok(SnapshotOutcome::Downloaded { files: files.len() })
}

/// Download into the root of `mount` and commit so other contexts see it.
pub async fn download_to_volume(
    source: Arc<dyn SnapshotSource>,
    request: SnapshotRequest,
    mount: &VolumeMount,
) -> KilnResult<SnapshotOutcome> {
    let local_dir = mount.path().to_path_buf();
    let outcome = run_blocking("download", move || {
        download_snapshot(source.as_ref(), &request, &local_dir)
    })
    .await?;

    mount.commit_async().await?;
    info!("Weights committed to volume {}", mount.volume().name());
    Ok(outcome)
}
