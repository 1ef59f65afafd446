use thiserror::Error;

/// Main error type for Kiln
#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Subprocess failed with exit code {code}: {command}")]
    Subprocess { code: i32, command: String },

    #[error("Subprocess timed out after {seconds}s: {command}")]
    Timeout { seconds: u64, command: String },

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Fold error: {0}")]
    Fold(#[from] FoldError),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl KilnError {
    /// Exit code of the failed child process, if this is a subprocess failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Subprocess { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Volume-related errors
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("Volume not found: {name}")]
    NotFound { name: String },

    #[error("Invalid volume name: {name}")]
    InvalidName { name: String },

    #[error("Commit failed for volume {name}: {message}")]
    CommitFailed { name: String, message: String },

    #[error("Reload failed for volume {name}: {message}")]
    ReloadFailed { name: String, message: String },
}

/// Inference pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Artifact directory not found: {path}")]
    ArtifactMissing { path: String },

    #[error("Generation failed for prompt {prompt:?}: {message}")]
    GenerationFailed { prompt: String, message: String },

    #[error("Generator produced no image at {path}")]
    NoImage { path: String },
}

/// Protein folding errors
#[derive(Error, Debug)]
pub enum FoldError {
    #[error("Invalid input YAML: {message}")]
    InvalidInput { message: String },

    #[error("MSA file referenced by {sequence_id} not found: {path}")]
    MsaNotFound { sequence_id: String, path: String },

    #[error("Predictor produced no results directory at {path}")]
    NoResults { path: String },

    #[error("Invalid extra arguments: {args:?}")]
    InvalidArgs { args: String },
}

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::KilnError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::KilnError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::KilnError::Config(format!($($arg)*))
    };
}
