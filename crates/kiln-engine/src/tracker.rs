//! Experiment tracking for sweep evaluation.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_types::{GeneratedImage, KilnResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Sink for images and summary values produced while evaluating runs.
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    async fn log_image(&self, key: &str, image: &GeneratedImage) -> KilnResult<()>;

    async fn log_value(&self, key: &str, value: serde_json::Value) -> KilnResult<()>;
}

/// One line of a local tracker log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerRecord {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    pub logged_at: DateTime<Utc>,
}

/// Tracker writing under `<runs_dir>/<project>/<run_name>/`: images in
/// `images/`, one JSON record per line in `log.jsonl`.
#[derive(Debug)]
pub struct LocalTracker {
    dir: PathBuf,
    log: Mutex<()>,
}

impl LocalTracker {
    pub fn new(runs_dir: &Path, project: &str, run_name: &str) -> KilnResult<Self> {
        let dir = runs_dir.join(project).join(run_name);
        std::fs::create_dir_all(dir.join("images"))?;
        Ok(Self {
            dir,
            log: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// Every record logged so far.
    pub fn records(&self) -> KilnResult<Vec<TrackerRecord>> {
        let raw = match std::fs::read_to_string(self.log_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| -> KilnResult<TrackerRecord> { Ok(serde_json::from_str(l)?) })
            .collect()
    }

    fn append(&self, record: &TrackerRecord) -> KilnResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.log.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// File-system safe form of a tracker key.
fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[async_trait]
impl ExperimentTracker for LocalTracker {
    async fn log_image(&self, key: &str, image: &GeneratedImage) -> KilnResult<()> {
        let path = self.dir.join("images").join(format!("{}.png", file_stem(key)));
        tokio::fs::write(&path, &image.png).await?;
        debug!("Logged image {} to {}", key, path.display());

        self.append(&TrackerRecord {
            key: key.to_string(),
            image: Some(path),
            prompt: Some(image.prompt.clone()),
            value: None,
            logged_at: Utc::now(),
        })
    }

    async fn log_value(&self, key: &str, value: serde_json::Value) -> KilnResult<()> {
        self.append(&TrackerRecord {
            key: key.to_string(),
            image: None,
            prompt: None,
            value: Some(value),
            logged_at: Utc::now(),
        })
    }
}
