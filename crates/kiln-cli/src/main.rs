//! `kiln`: Dreambooth fine-tuning sweeps, inference, and protein folding on
//! local volumes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use kiln_data::{download_to_volume, HubSource, SnapshotOutcome, SnapshotRequest, Volume};
use kiln_engine::{
    ExternalLoader, LocalTracker, Model, ModelRegistry, SweepDriver, Trainer, TrainingJob,
    MODEL_DIR,
};
use kiln_fold::{run_fold, FoldJob, FoldRequest};
use kiln_sweep::{DispatchConfig, RunStatus, SweepState};
use kiln_types::{AppConfig, KilnError, KilnSettings, SweepConfig, TrainConfig, TrainedArtifact};
use kiln_web::{WebState, BUNDLED_ASSETS_DIR};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SWEEP_PROJECT: &str = "flux-lora-sweep";

#[derive(Parser)]
#[command(name = "kiln")]
#[command(
    about = "Fine-tune, evaluate, and serve Dreambooth artifacts; fold proteins with boltz",
    long_about = None
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Root for volumes, execution contexts, and tracker runs
    #[arg(long, global = true, env = "KILN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON file with a training (train) or sweep (sweep) config
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train every step/rank combination and evaluate each artifact
    Sweep {
        /// Comma-separated step counts, e.g. 2000,3000,4000
        #[arg(long, value_delimiter = ',')]
        train_steps: Option<Vec<u32>>,

        /// Comma-separated LoRA ranks
        #[arg(long, value_delimiter = ',')]
        ranks: Option<Vec<u32>>,

        /// Maximum number of training runs in flight
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Run one fine-tuning job
    Train {
        #[arg(long)]
        max_train_steps: Option<u32>,

        #[arg(long)]
        rank: Option<u32>,
    },

    /// Generate one image from a trained artifact
    Infer {
        /// Artifact directory on the model volume, e.g. steps_2000_rank_8
        #[arg(long)]
        artifact: String,

        #[arg(long)]
        prompt: String,

        #[arg(long, default_value = "dream.png")]
        out: PathBuf,

        /// Denoising steps
        #[arg(long)]
        steps: Option<u32>,
    },

    /// Serve the web UI for a trained artifact
    Serve {
        #[arg(long)]
        artifact: String,

        #[arg(long, env = "KILN_WEB_ADDR")]
        addr: Option<String>,

        /// Denoising steps per generated image
        #[arg(long)]
        steps: Option<u32>,
    },

    /// Predict a structure from a boltz YAML input
    Fold {
        #[arg(long)]
        input: Option<PathBuf>,

        /// Extra predictor arguments, split with shell quoting rules
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        args: String,

        #[arg(long, default_value = "./")]
        out_dir: PathBuf,

        /// Fetch weights again even if the volume has them
        #[arg(long)]
        force_download: bool,
    },

    /// Download a Hugging Face snapshot into a volume
    Download {
        /// Repository id; defaults to the pinned Boltz-1 weights
        #[arg(long)]
        repo: Option<String>,

        #[arg(long)]
        revision: Option<String>,

        #[arg(long)]
        force: bool,

        /// Target volume, defaults to KILN_WEIGHTS_VOLUME
        #[arg(long)]
        volume: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        command,
        verbose,
        data_dir,
        config,
    } = Cli::parse();

    init_tracing(verbose);
    let settings = load_settings(data_dir.as_deref());
    let config = config.as_deref();

    match command {
        Commands::Sweep {
            train_steps,
            ranks,
            max_concurrency,
        } => sweep(&settings, config, train_steps, ranks, max_concurrency).await,
        Commands::Train {
            max_train_steps,
            rank,
        } => train(&settings, config, max_train_steps, rank).await,
        Commands::Infer {
            artifact,
            prompt,
            out,
            steps,
        } => infer(&settings, &artifact, &prompt, &out, app_config(steps)).await,
        Commands::Serve {
            artifact,
            addr,
            steps,
        } => serve(&settings, &artifact, addr, app_config(steps)).await,
        Commands::Fold {
            input,
            args,
            out_dir,
            force_download,
        } => match FoldRequest::from_cli(input, args, out_dir, force_download) {
            Ok(request) => fold(&settings, request).await,
            Err(KilnError::MissingInput(message)) => {
                println!("{message}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Commands::Download {
            repo,
            revision,
            force,
            volume,
        } => download(&settings, repo, revision, force, volume).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Environment settings, with `--data-dir` standing in for `KILN_DATA_DIR`
/// so paths derived from it follow the flag.
fn load_settings(data_dir: Option<&Path>) -> KilnSettings {
    KilnSettings::from_lookup(|key| match (key, data_dir) {
        ("KILN_DATA_DIR", Some(dir)) => Some(dir.to_string_lossy().into_owned()),
        _ => std::env::var(key).ok(),
    })
}

fn image_loader(settings: &KilnSettings) -> ExternalLoader {
    let loader = ExternalLoader::new(settings.generator_program.clone())
        .with_scratch_dir(settings.data_dir.join("scratch"));
    match settings.hf_token {
        Some(ref token) => loader.with_env("HF_TOKEN", token.clone()),
        None => loader,
    }
}

fn app_config(steps: Option<u32>) -> AppConfig {
    match steps {
        Some(steps) => AppConfig::default().with_inference_steps(steps),
        None => AppConfig::default(),
    }
}

async fn sweep(
    settings: &KilnSettings,
    config: Option<&Path>,
    train_steps: Option<Vec<u32>>,
    ranks: Option<Vec<u32>>,
    max_concurrency: Option<usize>,
) -> Result<()> {
    let mut sweep = match config {
        Some(path) => SweepConfig::from_json_file(path)
            .with_context(|| format!("reading sweep config {}", path.display()))?,
        None => SweepConfig::default(),
    };
    if let Some(steps) = train_steps {
        sweep = sweep.with_train_steps(steps);
    }
    if let Some(ranks) = ranks {
        sweep = sweep.with_ranks(ranks);
    }
    let mut dispatch = DispatchConfig::default();
    if let Some(n) = max_concurrency {
        dispatch = dispatch.with_max_concurrent_tasks(n);
    }

    let trainer = TrainingJob::from_settings(settings)?;
    let mount = trainer
        .volume()
        .mount_in_new_context_async(settings.contexts_dir())
        .await?;
    let registry = ModelRegistry::new(Arc::new(mount), Arc::new(image_loader(settings)));
    let run_name = format!("sweep_summary_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let tracker = LocalTracker::new(&settings.runs_dir(), SWEEP_PROJECT, &run_name)?;
    let status_path = tracker.dir().join("status.json");

    let status = SweepDriver::new(Arc::new(trainer), Arc::new(registry), Arc::new(tracker))
        .with_dispatch(dispatch)
        .run(&sweep)
        .await?;

    status.save_json(&status_path)?;
    info!("Sweep status written to {}", status_path.display());

    for run in &status.runs {
        match run.error {
            Some(ref error) => println!("{:<24} {:?}: {}", run.run_name, run.status, error),
            None => println!("{:<24} {:?}", run.run_name, run.status),
        }
    }

    if status.state == SweepState::Failed {
        bail!(
            "{} of {} runs failed",
            status.count(RunStatus::Failed),
            status.runs.len()
        );
    }
    Ok(())
}

async fn train(
    settings: &KilnSettings,
    config_path: Option<&Path>,
    max_train_steps: Option<u32>,
    rank: Option<u32>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => TrainConfig::from_json_file(path)
            .with_context(|| format!("reading training config {}", path.display()))?,
        None => TrainConfig::default(),
    };
    let overridden = max_train_steps.is_some() || rank.is_some();
    if let Some(steps) = max_train_steps {
        config = config.with_max_train_steps(steps);
    }
    if let Some(rank) = rank {
        config = config.with_rank(rank);
    }
    if config_path.is_none() || overridden {
        let name = format!("steps_{}_rank_{}", config.max_train_steps, config.rank);
        config = config.with_output_dir(Path::new(MODEL_DIR).join(name));
    }

    let job = TrainingJob::from_settings(settings)?;
    let artifact = job.train(config).await?;
    println!("Trained {} ({})", artifact.name, artifact.path.display());
    Ok(())
}

/// A model served from its own context; the context goes away with the model.
async fn open_model(settings: &KilnSettings, name: &str) -> Result<Model> {
    let volume = Volume::from_name(settings.volumes_dir(), &settings.model_volume, false)
        .with_context(|| {
            format!("model volume {} has no trained artifacts", settings.model_volume)
        })?;
    let mount = volume
        .mount_in_new_context_async(settings.contexts_dir())
        .await?;
    let artifact = TrainedArtifact::load(mount.path(), name)?;
    Ok(Model::new(
        artifact,
        Arc::new(mount),
        Arc::new(image_loader(settings)),
    ))
}

async fn infer(
    settings: &KilnSettings,
    artifact: &str,
    prompt: &str,
    out: &Path,
    app_config: AppConfig,
) -> Result<()> {
    let model = open_model(settings, artifact).await?;
    let image = model.inference(prompt, &app_config).await?;

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out, &image.png)?;
    println!("Wrote {}", out.display());
    Ok(())
}

async fn serve(
    settings: &KilnSettings,
    artifact: &str,
    addr: Option<String>,
    app_config: AppConfig,
) -> Result<()> {
    let model = open_model(settings, artifact).await?;
    let assets_dir = if settings.assets_dir.is_dir() {
        settings.assets_dir.clone()
    } else {
        PathBuf::from(BUNDLED_ASSETS_DIR)
    };
    let addr = addr.unwrap_or_else(|| settings.web_addr.clone());

    let state = WebState::new(Arc::new(model), app_config, assets_dir);
    kiln_web::serve(state, &addr).await?;
    Ok(())
}

async fn fold(settings: &KilnSettings, request: FoldRequest) -> Result<()> {
    let job = FoldJob::from_settings(settings)?;
    let source = Arc::new(HubSource::new(settings.hf_token.clone())?);
    let archive = run_fold(&job, source, &request).await?;
    println!("Wrote {}", archive.display());
    Ok(())
}

async fn download(
    settings: &KilnSettings,
    repo: Option<String>,
    revision: Option<String>,
    force: bool,
    volume: Option<String>,
) -> Result<()> {
    let mut request = match repo {
        Some(repo) => SnapshotRequest::new(repo),
        None => SnapshotRequest::boltz1(),
    };
    if let Some(revision) = revision {
        request = request.with_revision(revision);
    }
    let request = request.with_force_download(force);
    let repo_id = request.repo_id.clone();

    let volume_name = volume.unwrap_or_else(|| settings.weights_volume.clone());
    let volume = Volume::from_name(settings.volumes_dir(), &volume_name, true)?;
    let source = Arc::new(HubSource::new(settings.hf_token.clone())?);

    let mount = volume
        .mount_in_new_context_async(settings.contexts_dir())
        .await?;

    match download_to_volume(source, request, &mount).await? {
        SnapshotOutcome::Downloaded { files } => {
            println!("Downloaded {} files of {} into {}", files, repo_id, volume_name)
        }
        SnapshotOutcome::AlreadyPresent => {
            println!("{} already present in {}", repo_id, volume_name)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sweep_lists_split_on_commas() {
        let cli = Cli::parse_from([
            "kiln",
            "sweep",
            "--train-steps",
            "2000,3000,4000",
            "--ranks",
            "8,16",
            "--max-concurrency",
            "2",
        ]);
        match cli.command {
            Commands::Sweep {
                train_steps,
                ranks,
                max_concurrency,
            } => {
                assert_eq!(train_steps, Some(vec![2000, 3000, 4000]));
                assert_eq!(ranks, Some(vec![8, 16]));
                assert_eq!(max_concurrency, Some(2));
            }
            _ => panic!("expected sweep"),
        }
    }

    #[test]
    fn fold_accepts_hyphenated_args_and_global_flags() {
        let cli = Cli::parse_from([
            "kiln",
            "fold",
            "--input",
            "protein.yaml",
            "--args",
            "--sampling_steps 10",
            "--data-dir",
            "/srv/kiln",
            "-v",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/srv/kiln")));
        match cli.command {
            Commands::Fold {
                input,
                args,
                out_dir,
                force_download,
            } => {
                assert_eq!(input, Some(PathBuf::from("protein.yaml")));
                assert_eq!(args, "--sampling_steps 10");
                assert_eq!(out_dir, PathBuf::from("./"));
                assert!(!force_download);
            }
            _ => panic!("expected fold"),
        }
    }

    #[test]
    fn steps_flag_sets_inference_steps() {
        let cli = Cli::parse_from([
            "kiln",
            "infer",
            "--artifact",
            "steps_2000_rank_8",
            "--prompt",
            "Heroicon the style",
            "--steps",
            "40",
        ]);
        match cli.command {
            Commands::Infer { steps, out, .. } => {
                assert_eq!(steps, Some(40));
                assert_eq!(out, PathBuf::from("dream.png"));
                assert_eq!(app_config(steps).num_inference_steps, 40);
            }
            _ => panic!("expected infer"),
        }
        assert_eq!(
            app_config(None).num_inference_steps,
            AppConfig::default().num_inference_steps
        );
    }

    #[test]
    fn fold_without_input_is_a_missing_input() {
        let cli = Cli::parse_from(["kiln", "fold"]);
        let Commands::Fold {
            input,
            args,
            out_dir,
            force_download,
        } = cli.command
        else {
            panic!("expected fold");
        };
        match FoldRequest::from_cli(input, args, out_dir, force_download) {
            Err(KilnError::MissingInput(message)) => {
                assert_eq!(message, "Provide input yaml by --input")
            }
            other => panic!("expected missing input, got {other:?}"),
        }
    }

    #[test]
    fn data_dir_flag_drives_derived_paths() {
        let settings = load_settings(Some(Path::new("/srv/kiln")));
        assert_eq!(settings.data_dir, PathBuf::from("/srv/kiln"));
        assert_eq!(settings.contexts_dir(), PathBuf::from("/srv/kiln/contexts"));
    }
}
