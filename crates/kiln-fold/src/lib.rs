//! # kiln-fold
//!
//! Protein structure prediction with the `boltz` command-line predictor:
//! weights are fetched once into a shared volume, each prediction runs in its
//! own execution context, and the predictor's results directory comes back as
//! a zip archive.

pub mod input;
pub mod job;
pub mod options;

pub use input::{FoldInput, MsaRef};
pub use job::{results_dir_name, FoldJob, DEFAULT_PREDICT_TIMEOUT, INPUT_FILE};
pub use options::{split_args, Accelerator, OutputFormat, PredictOptions};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_data::{SnapshotRequest, SnapshotSource};
use kiln_types::{validation_error, KilnError, KilnResult};
use tracing::info;

/// One local fold invocation.
#[derive(Debug, Clone)]
pub struct FoldRequest {
    pub input: PathBuf,
    /// Free-form predictor arguments, split with shell quoting rules.
    pub args: String,
    pub out_dir: PathBuf,
    pub force_download: bool,
}

/// What to tell a user who ran a fold without an input file.
pub const MISSING_INPUT_MESSAGE: &str = "Provide input yaml by --input";

impl FoldRequest {
    /// Build a request from command-line values. A missing input is
    /// [`KilnError::MissingInput`] carrying [`MISSING_INPUT_MESSAGE`].
    pub fn from_cli(
        input: Option<PathBuf>,
        args: String,
        out_dir: PathBuf,
        force_download: bool,
    ) -> KilnResult<Self> {
        let input =
            input.ok_or_else(|| KilnError::MissingInput(MISSING_INPUT_MESSAGE.to_string()))?;
        Ok(Self {
            input,
            args,
            out_dir,
            force_download,
        })
    }
}

/// Archive path for an input file: `<out_dir>/boltz_<input file name>_result.zip`.
pub fn archive_path(out_dir: &Path, input: &Path) -> KilnResult<PathBuf> {
    let name = input
        .file_name()
        .ok_or_else(|| validation_error!("input {} has no file name", input.display()))?;
    Ok(out_dir.join(format!("boltz_{}_result.zip", name.to_string_lossy())))
}

/// Make sure weights are present, run the predictor on `request.input`, and
/// write the archive. Returns the archive path.
pub async fn run_fold(
    job: &FoldJob,
    source: Arc<dyn SnapshotSource>,
    request: &FoldRequest,
) -> KilnResult<PathBuf> {
    info!("Loading model weights");
    job.download_weights(
        source,
        SnapshotRequest::boltz1().with_force_download(request.force_download),
    )
    .await?;

    let input_path = request.input.canonicalize()?;
    let input = FoldInput::from_file(&input_path)?;
    let options = PredictOptions::default().with_extra_args(&request.args)?;

    info!("Running boltz with input from {}", request.input.display());
    let archive = job.predict(&input, &options).await?;

    let output_path = archive_path(&request.out_dir, &input_path)?;
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!("Writing output to {}", output_path.display());
    std::fs::write(&output_path, archive)?;
    Ok(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_is_reported_not_run() {
        let err =
            FoldRequest::from_cli(None, String::new(), PathBuf::from("./"), false).unwrap_err();
        match err {
            KilnError::MissingInput(message) => assert_eq!(message, MISSING_INPUT_MESSAGE),
            other => panic!("expected MissingInput, got {other:?}"),
        }

        let request = FoldRequest::from_cli(
            Some("protein.yaml".into()),
            "--sampling_steps 10".into(),
            "out".into(),
            true,
        )
        .unwrap();
        assert_eq!(request.input, PathBuf::from("protein.yaml"));
        assert!(request.force_download);
    }

    #[test]
    fn archive_is_named_after_the_input_file() {
        let path = archive_path(Path::new("out"), Path::new("/data/protein.yaml")).unwrap();
        assert_eq!(path, PathBuf::from("out/boltz_protein.yaml_result.zip"));
        assert!(archive_path(Path::new("out"), Path::new("/")).is_err());
    }
}
