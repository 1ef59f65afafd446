//! Typed predictor options and free-form argument splitting.

use std::path::PathBuf;

use kiln_types::{FoldError, KilnResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Pdb,
    Mmcif,
}

impl OutputFormat {
    fn as_flag_value(&self) -> &'static str {
        match self {
            Self::Pdb => "pdb",
            Self::Mmcif => "mmcif",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Gpu,
    Cpu,
    Tpu,
}

impl Accelerator {
    fn as_flag_value(&self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
            Self::Tpu => "tpu",
        }
    }
}

/// Options for `boltz predict`. Unset values fall back to the predictor's own
/// defaults; `extra_args` are appended verbatim after every typed flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
    /// Weights cache directory.
    pub cache: Option<PathBuf>,
    pub use_msa_server: bool,
    pub sampling_steps: Option<u32>,
    pub recycling_steps: Option<u32>,
    pub diffusion_samples: Option<u32>,
    pub output_format: Option<OutputFormat>,
    pub devices: Option<u32>,
    pub accelerator: Option<Accelerator>,
    /// Overwrite existing predictions.
    pub override_existing: bool,
    pub extra_args: Vec<String>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            cache: None,
            use_msa_server: true,
            sampling_steps: None,
            recycling_steps: None,
            diffusion_samples: None,
            output_format: None,
            devices: None,
            accelerator: None,
            override_existing: false,
            extra_args: Vec::new(),
        }
    }
}

impl PredictOptions {
    pub fn with_cache(mut self, cache: impl Into<PathBuf>) -> Self {
        self.cache = Some(cache.into());
        self
    }

    pub fn with_sampling_steps(mut self, steps: u32) -> Self {
        self.sampling_steps = Some(steps);
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    /// Append tokens split from a free-form argument string.
    pub fn with_extra_args(mut self, args: &str) -> KilnResult<Self> {
        self.extra_args.extend(split_args(args)?);
        Ok(self)
    }

    /// Flags in a fixed order: typed options first, extra tokens last.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref cache) = self.cache {
            args.push("--cache".to_string());
            args.push(cache.display().to_string());
        }
        if self.use_msa_server {
            args.push("--use_msa_server".to_string());
        }
        let numeric = [
            ("--sampling_steps", self.sampling_steps),
            ("--recycling_steps", self.recycling_steps),
            ("--diffusion_samples", self.diffusion_samples),
            ("--devices", self.devices),
        ];
        for (flag, value) in numeric {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        if let Some(format) = self.output_format {
            args.push("--output_format".to_string());
            args.push(format.as_flag_value().to_string());
        }
        if let Some(accelerator) = self.accelerator {
            args.push("--accelerator".to_string());
            args.push(accelerator.as_flag_value().to_string());
        }
        if self.override_existing {
            args.push("--override".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Split a free-form argument string using POSIX shell quoting rules.
pub fn split_args(args: &str) -> KilnResult<Vec<String>> {
    shlex::split(args).ok_or_else(|| {
        FoldError::InvalidArgs {
            args: args.to_string(),
        }
        .into()
    })
}
