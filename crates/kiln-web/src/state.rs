use std::path::PathBuf;
use std::sync::Arc;

use kiln_engine::ImagePipeline;
use kiln_types::AppConfig;

/// Shared server state.
pub struct WebState {
    pub pipeline: Arc<dyn ImagePipeline>,
    pub app_config: AppConfig,
    /// Prompts offered as one-click examples; the first one stands in for an
    /// empty request.
    pub examples: Vec<String>,
    pub assets_dir: PathBuf,
}

impl WebState {
    pub fn new(
        pipeline: Arc<dyn ImagePipeline>,
        app_config: AppConfig,
        assets_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipeline,
            examples: app_config.example_prompts(),
            app_config,
            assets_dir: assets_dir.into(),
        }
    }

    pub fn instance_phrase(&self) -> String {
        self.app_config.shared.instance_phrase()
    }
}

pub type SharedState = Arc<WebState>;
