//! Sweep space definitions and the grid generator.

use kiln_types::{SweepConfig, TrainConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A concrete hyperparameter value on one sweep axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "param", content = "value", rename_all = "snake_case")]
pub enum SweepValue {
    MaxTrainSteps(u32),
    Rank(u32),
    LearningRate(f64),
    Resolution(u32),
}

impl SweepValue {
    /// Path fragment identifying this value in a run name.
    pub fn slug(&self) -> String {
        match self {
            Self::MaxTrainSteps(v) => format!("steps_{v}"),
            Self::Rank(v) => format!("rank_{v}"),
            Self::LearningRate(v) => format!("lr_{v}"),
            Self::Resolution(v) => format!("res_{v}"),
        }
    }

    pub fn apply(&self, config: &mut TrainConfig) {
        match *self {
            Self::MaxTrainSteps(v) => config.max_train_steps = v,
            Self::Rank(v) => config.rank = v,
            Self::LearningRate(v) => config.learning_rate = v,
            Self::Resolution(v) => config.resolution = v,
        }
    }
}

impl std::fmt::Display for SweepValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxTrainSteps(v) => write!(f, "max_train_steps={v}"),
            Self::Rank(v) => write!(f, "rank={v}"),
            Self::LearningRate(v) => write!(f, "learning_rate={v}"),
            Self::Resolution(v) => write!(f, "resolution={v}"),
        }
    }
}

/// The full sweep space: an ordered list of axes, each an ordered list of
/// values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SweepSpace {
    pub axes: Vec<Vec<SweepValue>>,
}

impl SweepSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_train_steps(mut self, steps: &[u32]) -> Self {
        self.axes
            .push(steps.iter().copied().map(SweepValue::MaxTrainSteps).collect());
        self
    }

    pub fn add_ranks(mut self, ranks: &[u32]) -> Self {
        self.axes.push(ranks.iter().copied().map(SweepValue::Rank).collect());
        self
    }

    pub fn add_learning_rates(mut self, rates: &[f64]) -> Self {
        self.axes
            .push(rates.iter().copied().map(SweepValue::LearningRate).collect());
        self
    }

    pub fn add_resolutions(mut self, resolutions: &[u32]) -> Self {
        self.axes
            .push(resolutions.iter().copied().map(SweepValue::Resolution).collect());
        self
    }

    /// Total number of grid points, or `None` on overflow.
    pub fn grid_size(&self) -> Option<usize> {
        self.axes
            .iter()
            .try_fold(1usize, |total, axis| total.checked_mul(axis.len()))
    }
}

/// One combination of axis values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub values: Vec<SweepValue>,
}

impl SweepPoint {
    /// Deterministic name built from the axis slugs, e.g. `steps_2000_rank_8`.
    pub fn run_name(&self) -> String {
        self.values
            .iter()
            .map(SweepValue::slug)
            .collect::<Vec<_>>()
            .join("_")
    }

    /// `base` with this point's values applied and its output directory set to
    /// `<model_dir>/<run_name>`.
    pub fn apply_to(&self, base: &TrainConfig, model_dir: &Path) -> TrainConfig {
        let mut config = base.clone();
        for value in &self.values {
            value.apply(&mut config);
        }
        config.output_dir = model_dir.join(self.run_name());
        config
    }
}

/// Exhaustive grid over the sweep space, in cartesian-product order with the
/// first axis varying slowest.
#[derive(Debug, Clone)]
pub struct GridSweep {
    cursor: usize,
    points: Vec<SweepPoint>,
}

impl GridSweep {
    pub fn new(space: &SweepSpace) -> Self {
        Self {
            cursor: 0,
            points: Self::build_grid(space),
        }
    }

    fn build_grid(space: &SweepSpace) -> Vec<SweepPoint> {
        let mut result: Vec<Vec<SweepValue>> = vec![Vec::new()];
        for axis in &space.axes {
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for value in axis {
                    let mut combo = existing.clone();
                    combo.push(*value);
                    next.push(combo);
                }
            }
            result = next;
        }

        result
            .into_iter()
            .map(|values| SweepPoint { values })
            .collect()
    }

    /// The next `count` points; fewer once the grid runs out.
    pub fn suggest(&mut self, count: usize) -> Vec<SweepPoint> {
        let end = self.cursor.saturating_add(count).min(self.points.len());
        let batch = self.points[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }

    pub fn remaining(&self) -> usize {
        self.points.len() - self.cursor
    }

    pub fn into_points(self) -> Vec<SweepPoint> {
        self.points
    }
}

/// One training configuration per (steps, rank) combination of `sweep`, each
/// writing to its own directory under `model_dir`.
pub fn generate_sweep_configs(sweep: &SweepConfig, model_dir: &Path) -> Vec<TrainConfig> {
    let space = SweepSpace::new()
        .add_train_steps(&sweep.train_steps)
        .add_ranks(&sweep.ranks);

    GridSweep::new(&space)
        .into_points()
        .iter()
        .map(|point| point.apply_to(&sweep.base, model_dir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    #[test]
    fn sweep_produces_full_product() {
        let sweep = SweepConfig::default()
            .with_train_steps(vec![2000, 3000, 4000])
            .with_ranks(vec![4, 8]);
        let configs = generate_sweep_configs(&sweep, Path::new("/model"));

        assert_eq!(configs.len(), 6);
        let dirs: HashSet<&PathBuf> = configs.iter().map(|c| &c.output_dir).collect();
        assert_eq!(dirs.len(), 6);

        let pairs: Vec<(u32, u32)> = configs
            .iter()
            .map(|c| (c.max_train_steps, c.rank))
            .collect();
        assert_eq!(
            pairs,
            vec![(2000, 4), (2000, 8), (3000, 4), (3000, 8), (4000, 4), (4000, 8)]
        );
        assert_eq!(configs[0].output_dir, PathBuf::from("/model/steps_2000_rank_4"));
    }

    #[test]
    fn sweep_keeps_base_fields() {
        let sweep = SweepConfig::default().with_train_steps(vec![250]).with_ranks(vec![8]);
        let configs = generate_sweep_configs(&sweep, Path::new("/model"));

        assert_eq!(configs.len(), 1);
        let mut expected = sweep.base.clone();
        expected.max_train_steps = 250;
        expected.rank = 8;
        expected.output_dir = PathBuf::from("/model/steps_250_rank_8");
        assert_eq!(configs[0], expected);
    }

    #[test]
    fn empty_list_gives_empty_sweep() {
        let sweep = SweepConfig::default().with_train_steps(vec![]);
        assert!(generate_sweep_configs(&sweep, Path::new("/model")).is_empty());

        let sweep = SweepConfig::default().with_ranks(vec![]);
        assert!(generate_sweep_configs(&sweep, Path::new("/model")).is_empty());
    }

    #[test]
    fn grid_cursor_advances() {
        let space = SweepSpace::new()
            .add_train_steps(&[100, 200, 300])
            .add_learning_rates(&[1.0, 0.5]);
        assert_eq!(space.grid_size(), Some(6));

        let mut grid = GridSweep::new(&space);
        assert_eq!(grid.suggest(4).len(), 4);
        assert_eq!(grid.remaining(), 2);
        let rest = grid.suggest(10);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].run_name(), "steps_300_lr_0.5");
        assert!(grid.suggest(1).is_empty());
    }

    #[test]
    fn point_applies_every_axis() {
        let point = SweepPoint {
            values: vec![SweepValue::Resolution(1024), SweepValue::LearningRate(0.25)],
        };
        let config = point.apply_to(&TrainConfig::default(), Path::new("/m"));
        assert_eq!(config.resolution, 1024);
        assert_eq!(config.learning_rate, 0.25);
        assert_eq!(config.output_dir, PathBuf::from("/m/res_1024_lr_0.25"));
        assert_eq!(point.values[0].to_string(), "resolution=1024");
    }
}
