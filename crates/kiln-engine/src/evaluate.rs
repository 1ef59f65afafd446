use std::sync::Arc;

use kiln_sweep::{dispatch_all, DispatchConfig};
use kiln_types::{AppConfig, KilnResult};
use tracing::info;

use crate::infer::Model;
use crate::tracker::ExperimentTracker;

/// Tracker key for one evaluation image.
pub fn image_key(artifact_name: &str, prompt: &str) -> String {
    format!("test_image/{artifact_name}/{prompt}")
}

/// Generate an image for every prompt with `model`, all prompts in flight at
/// once, and log each under `test_image/<artifact>/<prompt>`. Stops at the
/// first failure. Returns the number of images logged.
pub async fn evaluate_model(
    model: Arc<Model>,
    prompts: &[String],
    app_config: &AppConfig,
    tracker: &dyn ExperimentTracker,
) -> KilnResult<usize> {
    let artifact_name = model.artifact().name.clone();
    info!("Evaluating {} on {} prompts", artifact_name, prompts.len());

    let mut completions = dispatch_all(prompts.to_vec(), &DispatchConfig::default(), |prompt| {
        let model = model.clone();
        let app_config = app_config.clone();
        async move { model.inference(&prompt, &app_config).await }
    });

    let mut logged = 0;
    while let Some((_, result)) = completions.next().await {
        let image = result?;
        tracker
            .log_image(&image_key(&artifact_name, &image.prompt), &image)
            .await?;
        logged += 1;
    }
    Ok(logged)
}
