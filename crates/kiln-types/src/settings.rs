use std::path::PathBuf;

/// Process-wide settings, read from `KILN_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct KilnSettings {
    /// Root for volumes, execution contexts, and tracker runs.
    pub data_dir: PathBuf,
    pub web_addr: String,
    /// Checkout of the diffusers repository holding the training scripts.
    pub diffusers_dir: PathBuf,
    pub accelerate_program: String,
    pub generator_program: String,
    pub predictor_program: String,
    pub assets_dir: PathBuf,
    pub hf_token: Option<String>,
    /// Volume holding fine-tuned weights.
    pub model_volume: String,
    /// Volume holding predictor weights.
    pub weights_volume: String,
}

impl KilnSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let data_dir = var("KILN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("kiln")
            });

        Self {
            web_addr: var("KILN_WEB_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            diffusers_dir: var("KILN_DIFFUSERS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("diffusers")),
            accelerate_program: var("KILN_ACCELERATE").unwrap_or_else(|| "accelerate".to_string()),
            generator_program: var("KILN_GENERATOR").unwrap_or_else(|| "kiln-diffuse".to_string()),
            predictor_program: var("KILN_BOLTZ").unwrap_or_else(|| "boltz".to_string()),
            assets_dir: var("KILN_ASSETS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("assets")),
            hf_token: var("HF_TOKEN"),
            model_volume: var("KILN_MODEL_VOLUME")
                .unwrap_or_else(|| "dreambooth-flux".to_string()),
            weights_volume: var("KILN_WEIGHTS_VOLUME")
                .unwrap_or_else(|| "boltz1-models".to_string()),
            data_dir,
        }
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }

    pub fn contexts_dir(&self) -> PathBuf {
        self.data_dir.join("contexts")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }
}

impl Default for KilnSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
