use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{KilnError, KilnResult};

/// Configuration information shared across project components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    /// The "proper noun" taught to the model.
    pub instance_name: String,
    /// The class the instance belongs to (person, bird, style).
    pub class_name: String,
    /// Identifier of the pretrained model on the Hugging Face Hub.
    pub model_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            instance_name: "Heroicon".to_string(),
            class_name: "style".to_string(),
            model_name: "black-forest-labs/FLUX.1-dev".to_string(),
        }
    }
}

impl SharedConfig {
    /// `"{instance} the {class}"`, used by the UI prompts.
    pub fn instance_phrase(&self) -> String {
        format!("{} the {}", self.instance_name, self.class_name)
    }
}

/// Experiment tracker the training script reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportTo {
    Wandb,
    Tensorboard,
}

impl ReportTo {
    pub fn as_flag_value(&self) -> &'static str {
        match self {
            Self::Wandb => "wandb",
            Self::Tensorboard => "tensorboard",
        }
    }
}

/// Which diffusers training script the launcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingScript {
    /// Full Dreambooth fine-tune; ignores the rank.
    Dreambooth,
    /// Dreambooth with low-rank adaptation weights.
    DreamboothLora,
}

impl TrainingScript {
    /// Script path relative to the diffusers checkout.
    pub fn path(&self) -> &'static str {
        match self {
            Self::Dreambooth => "examples/dreambooth/train_dreambooth_flux.py",
            Self::DreamboothLora => "examples/dreambooth/train_dreambooth_lora_flux.py",
        }
    }

    pub fn uses_rank(&self) -> bool {
        matches!(self, Self::DreamboothLora)
    }
}

/// Configuration for the finetuning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    #[serde(flatten)]
    pub shared: SharedConfig,

    /// Hugging Face Hub dataset holding the instance images.
    pub dataset_name: String,
    pub caption_column: String,
    pub instance_prompt: String,
    /// Words placed around the instance phrase in [`TrainConfig::training_prompt`].
    pub prefix: String,
    pub postfix: String,

    pub resolution: u32,
    pub train_batch_size: u32,
    /// LoRA rank
    pub rank: u32,
    pub gradient_accumulation_steps: u32,
    pub learning_rate: f64,
    pub optimizer: String,
    pub lr_scheduler: String,
    pub lr_warmup_steps: u32,
    pub max_train_steps: u32,
    pub checkpointing_steps: u32,
    pub seed: u64,
    pub mixed_precision: String,

    pub script: TrainingScript,
    /// Experiment tracking target; `None` disables reporting.
    pub report_to: Option<ReportTo>,

    /// Where the trained weights land, inside the model volume mount.
    pub output_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            shared: SharedConfig::default(),
            dataset_name: "yirenlu/heroicons-subset-25-images".to_string(),
            caption_column: "text".to_string(),
            instance_prompt: "an HCON, in the style of TOK".to_string(),
            prefix: String::new(),
            postfix: String::new(),
            resolution: 512,
            train_batch_size: 1,
            rank: 16,
            gradient_accumulation_steps: 1,
            // prodigy adapts its own step size, so the nominal rate stays at 1
            learning_rate: 1.0,
            optimizer: "prodigy".to_string(),
            lr_scheduler: "constant".to_string(),
            lr_warmup_steps: 0,
            max_train_steps: 2000,
            checkpointing_steps: 1000,
            seed: 0,
            mixed_precision: "bf16".to_string(),
            script: TrainingScript::DreamboothLora,
            report_to: None,
            output_dir: PathBuf::from("/model"),
        }
    }
}

impl TrainConfig {
    pub fn with_max_train_steps(mut self, steps: u32) -> Self {
        self.max_train_steps = steps;
        self
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_report_to(mut self, report_to: Option<ReportTo>) -> Self {
        self.report_to = report_to;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> KilnResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// `"{prefix} {instance} the {class} {postfix}"` with empty parts skipped.
    pub fn training_prompt(&self) -> String {
        let phrase = self.shared.instance_phrase();
        [self.prefix.as_str(), phrase.as_str(), self.postfix.as_str()]
            .iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn validate(&self) -> KilnResult<()> {
        let positive = [
            ("resolution", self.resolution),
            ("train_batch_size", self.train_batch_size),
            ("rank", self.rank),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("max_train_steps", self.max_train_steps),
            ("checkpointing_steps", self.checkpointing_steps),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(KilnError::Validation(format!("{name} must be positive")));
            }
        }
        if !(self.learning_rate > 0.0) {
            return Err(KilnError::Validation(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.shared.model_name.is_empty() {
            return Err(KilnError::Validation("model_name is empty".to_string()));
        }
        Ok(())
    }

    /// Arguments for `accelerate`, starting at the `launch` subcommand.
    /// `--rank` is only passed to the LoRA script and `--report_to` only when
    /// tracking is on.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "launch".to_string(),
            self.script.path().to_string(),
            format!("--mixed_precision={}", self.mixed_precision),
            format!("--pretrained_model_name_or_path={}", self.shared.model_name),
            format!("--dataset_name={}", self.dataset_name),
            format!("--caption_column={}", self.caption_column),
            format!("--output_dir={}", self.output_dir.display()),
            format!("--instance_prompt={}", self.instance_prompt),
            format!("--resolution={}", self.resolution),
            format!("--train_batch_size={}", self.train_batch_size),
            format!(
                "--gradient_accumulation_steps={}",
                self.gradient_accumulation_steps
            ),
            format!("--optimizer={}", self.optimizer),
            format!("--learning_rate={}", self.learning_rate),
            format!("--lr_scheduler={}", self.lr_scheduler),
            format!("--lr_warmup_steps={}", self.lr_warmup_steps),
            format!("--max_train_steps={}", self.max_train_steps),
            format!("--checkpointing_steps={}", self.checkpointing_steps),
            format!("--seed={}", self.seed),
        ];
        if self.script.uses_rank() {
            args.push(format!("--rank={}", self.rank));
        }
        if let Some(report_to) = self.report_to {
            args.push(format!("--report_to={}", report_to.as_flag_value()));
        }
        args
    }
}

/// Configuration information for inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(flatten)]
    pub shared: SharedConfig,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            shared: SharedConfig::default(),
            num_inference_steps: 25,
            guidance_scale: 6.0,
        }
    }
}

impl AppConfig {
    pub fn with_inference_steps(mut self, steps: u32) -> Self {
        self.num_inference_steps = steps;
        self
    }

    /// Prompts offered as one-click examples in the web UI.
    pub fn example_prompts(&self) -> Vec<String> {
        let phrase = self.shared.instance_phrase();
        vec![
            phrase.clone(),
            format!(
                "a painting of {} With A Pearl Earring, by Vermeer",
                title_case(&phrase)
            ),
            format!("oil painting of {phrase} flying through space as an astronaut"),
            format!(
                "a painting of {phrase} in cyberpunk city. character design by cory loftis. \
                 volumetric light, detailed, rendered in octane"
            ),
            format!(
                "drawing of {phrase} high quality, cartoon, path traced, \
                 by studio ghibli and don bluth"
            ),
        ]
    }
}

const HCON_ICON_PREFIX: &str = "An HCON, a black and white minimalist icon";

/// Configuration for a hyperparameter sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub base: TrainConfig,
    pub train_steps: Vec<u32>,
    pub ranks: Vec<u32>,
    /// Prompts every trained artifact is evaluated on.
    pub test_prompts: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            base: TrainConfig::default(),
            train_steps: vec![2000, 3000, 4000],
            ranks: vec![8],
            test_prompts: [
                "that represents the international monetary system",
                "of a macbook pro laptop",
                "of a tiara",
                "of mountain peaks",
                "of that represents a bank account",
            ]
            .iter()
            .map(|subject| format!("{HCON_ICON_PREFIX} {subject}"))
            .collect(),
        }
    }
}

impl SweepConfig {
    pub fn with_train_steps(mut self, steps: Vec<u32>) -> Self {
        self.train_steps = steps;
        self
    }

    pub fn with_ranks(mut self, ranks: Vec<u32>) -> Self {
        self.ranks = ranks;
        self
    }

    pub fn from_json_file(path: &Path) -> KilnResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Uppercase the first letter of every word, lowercase the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_prompt_skips_empty_affixes() {
        let mut config = TrainConfig::default();
        assert_eq!(config.training_prompt(), "Heroicon the style");

        config.prefix = "a photo of".to_string();
        config.postfix = " ".to_string();
        assert_eq!(config.training_prompt(), "a photo of Heroicon the style");
    }

    #[test]
    fn launch_args_map_every_field() {
        let config = TrainConfig::default()
            .with_max_train_steps(250)
            .with_rank(4)
            .with_output_dir("/model/steps_250_rank_4");
        let args = config.launch_args();

        assert_eq!(args[0], "launch");
        assert_eq!(args[1], "examples/dreambooth/train_dreambooth_lora_flux.py");
        assert!(args.contains(&"--max_train_steps=250".to_string()));
        assert!(args.contains(&"--rank=4".to_string()));
        assert!(args.contains(&"--output_dir=/model/steps_250_rank_4".to_string()));
        assert!(args.contains(&"--learning_rate=1".to_string()));
        assert!(args.contains(&"--optimizer=prodigy".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--report_to")));
    }

    #[test]
    fn report_to_is_an_explicit_field() {
        let config = TrainConfig::default().with_report_to(Some(ReportTo::Wandb));
        assert!(config
            .launch_args()
            .contains(&"--report_to=wandb".to_string()));
    }

    #[test]
    fn full_finetune_omits_rank() {
        let mut config = TrainConfig::default();
        config.script = TrainingScript::Dreambooth;
        let args = config.launch_args();
        assert_eq!(args[1], "examples/dreambooth/train_dreambooth_flux.py");
        assert!(!args.iter().any(|a| a.starts_with("--rank")));
    }

    #[test]
    fn validate_rejects_zero_steps() {
        let config = TrainConfig::default().with_max_train_steps(0);
        assert!(matches!(config.validate(), Err(KilnError::Validation(_))));
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn example_prompts_use_instance_phrase() {
        let prompts = AppConfig::default().example_prompts();
        assert_eq!(prompts.len(), 5);
        assert_eq!(prompts[0], "Heroicon the style");
        assert!(prompts[1].contains("Heroicon The Style With A Pearl Earring"));
    }

    #[test]
    fn partial_json_takes_defaults() {
        let config: TrainConfig =
            serde_json::from_str(r#"{"max_train_steps": 10, "instance_name": "Qwerty"}"#).unwrap();
        assert_eq!(config.max_train_steps, 10);
        assert_eq!(config.shared.instance_name, "Qwerty");
        assert_eq!(config.resolution, 512);
    }

    #[test]
    fn sweep_defaults() {
        let sweep = SweepConfig::default();
        assert_eq!(sweep.train_steps, vec![2000, 3000, 4000]);
        assert_eq!(sweep.ranks, vec![8]);
        assert_eq!(sweep.test_prompts.len(), 5);
    }
}
