//! Tracking for a sweep in progress.

use chrono::{DateTime, Utc};
use kiln_types::{KilnResult, TrainConfig, TrainedArtifact};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Unique sweep identifier.
pub type SweepId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A single training run within a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRun {
    pub id: Uuid,
    pub sweep_id: SweepId,
    pub run_number: usize,
    pub run_name: String,
    pub config: TrainConfig,
    pub status: RunStatus,
    pub artifact: Option<TrainedArtifact>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SweepRun {
    pub fn new(sweep_id: SweepId, run_number: usize, config: TrainConfig) -> Self {
        let run_name = config
            .output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("run_{run_number}"));
        Self {
            id: Uuid::new_v4(),
            sweep_id,
            run_number,
            run_name,
            config,
            status: RunStatus::Pending,
            artifact: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, artifact: TrainedArtifact) {
        self.status = RunStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.artifact = Some(artifact);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = RunStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        Some((self.finished_at? - self.started_at?).num_seconds())
    }
}

/// Lifecycle state for a whole sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Aggregate status of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepStatus {
    pub id: SweepId,
    pub name: String,
    pub state: SweepState,
    pub runs: Vec<SweepRun>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SweepStatus {
    pub fn new(name: impl Into<String>, configs: &[TrainConfig]) -> Self {
        let id = Uuid::new_v4();
        let runs = configs
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, config)| SweepRun::new(id, i, config))
            .collect();
        Self {
            id,
            name: name.into(),
            state: SweepState::Pending,
            runs,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = SweepState::Running;
        self.started_at = Some(Utc::now());
        for run in &mut self.runs {
            run.mark_running();
        }
    }

    pub fn run_mut(&mut self, run_number: usize) -> Option<&mut SweepRun> {
        self.runs.get_mut(run_number)
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }

    /// Close the sweep once no run is outstanding. Any failed run fails the
    /// sweep.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.state = if self.count(RunStatus::Failed) > 0 {
            SweepState::Failed
        } else {
            SweepState::Completed
        };
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &TrainedArtifact> {
        self.runs.iter().filter_map(|r| r.artifact.as_ref())
    }

    pub fn save_json(&self, path: &Path) -> KilnResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}
