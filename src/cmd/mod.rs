//! Command-line entry points.

use clap::Args;
use futures::StreamExt as _;

use crate::{
    config::{Config, FailurePolicy, TranslatorBackend},
    engines::Engines,
    error::ErrorKind,
    pipeline::{ProjectPipeline, ProjectRegistry},
    prelude::*,
    progress::ProgressKind,
    project::{ProjectStatus, Stage},
    ui::Ui,
};

pub mod cancel;
pub mod doctor;
pub mod new;
pub mod rebuild;
pub mod run;
pub mod schema;
pub mod status;

/// Options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct GlobalOpts {
    /// Directory containing our projects.
    #[clap(long, global = true, env = "LUMOS_OUTPUT_DIR", default_value = "output")]
    pub root: PathBuf,

    /// Configuration file. Defaults to `lumos.toml` in the output directory,
    /// if present.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Base URL of the OpenAI-compatible translation server.
    #[clap(long, global = true, env = "LUMOS_LMSTUDIO_URL")]
    pub lmstudio_url: Option<String>,

    /// API key for the translation server, if it needs one.
    #[clap(long, global = true, env = "LUMOS_LMSTUDIO_API_KEY", hide_env_values = true)]
    pub lmstudio_api_key: Option<String>,
}

impl GlobalOpts {
    /// Load our configuration, with command-line overrides applied.
    pub async fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref(), &self.root).await?;
        if let Some(url) = &self.lmstudio_url {
            config.engines.lmstudio_url = url.clone();
        }
        if let Some(key) = &self.lmstudio_api_key {
            config.engines.lmstudio_api_key = Some(key.clone());
        }
        Ok(config)
    }

    /// Build a registry for our output root.
    pub fn registry(&self, config: &Config) -> Result<ProjectRegistry> {
        config.validate()?;
        let engines = Engines::from_config(&config.engines)?;
        Ok(ProjectRegistry::new(
            &self.root,
            config.pipeline.clone(),
            engines,
        )?)
    }
}

/// Options for commands that run stages.
#[derive(Debug, Clone, Args)]
pub struct RunOpts {
    /// Number of pages to process at once.
    #[clap(short = 'j', long = "jobs")]
    pub concurrency: Option<usize>,

    /// What to do when a page fails.
    #[clap(long, value_enum)]
    pub failure_policy: Option<FailurePolicy>,

    /// Per-page timeout for each engine call, in seconds.
    #[clap(long)]
    pub page_timeout_secs: Option<u64>,

    /// Number of times to retry a page after a transient engine error.
    #[clap(long)]
    pub max_retries: Option<u32>,

    /// Which translation backend to use.
    #[clap(long, value_enum)]
    pub translator: Option<TranslatorBackend>,
}

impl RunOpts {
    /// Apply these options to `config`.
    pub fn apply(&self, config: &mut Config) {
        let pipeline = &mut config.pipeline;
        if let Some(concurrency) = self.concurrency {
            pipeline.concurrency = concurrency;
        }
        if let Some(failure_policy) = self.failure_policy {
            pipeline.failure_policy = failure_policy;
        }
        if let Some(secs) = self.page_timeout_secs {
            pipeline.page_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(max_retries) = self.max_retries {
            pipeline.retry.max_retries = max_retries;
        }
        if let Some(translator) = self.translator {
            config.engines.translator = translator;
        }
    }
}

/// Show progress until the project stops. Ctrl-C pauses the project, waiting
/// for pages in flight to finish.
#[instrument(level = "debug", skip_all, fields(project = %pipeline.id()))]
pub async fn follow_progress(ui: &Ui, pipeline: &ProjectPipeline) -> Result<ProjectStatus> {
    let project = pipeline.project().await;
    let stages = if project.wants_translation() {
        &Stage::ALL[..]
    } else {
        &Stage::ALL[..1]
    };
    let bars = ui.stage_bars(&pipeline.snapshot().await, stages);

    let mut events = pipeline.subscribe().await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                match &event.kind {
                    ProgressKind::Status(snapshot) => bars.update(snapshot),
                    ProgressKind::Page { stage, index, error: Some(error), replayed: false, .. } => {
                        warn!(%stage, page = index + 1, "Page failed: {}", error);
                    }
                    _ => {}
                }
            }
            _ = &mut ctrl_c => {
                info!("Pausing; waiting for pages in flight to finish");
                match pipeline.pause().await {
                    Ok(status) => info!(%status, "Project paused"),
                    // The run ended on its own.
                    Err(err) if err.kind() == ErrorKind::StateConflict => {}
                    Err(err) => return Err(err.into()),
                }
                break;
            }
        }
    }
    bars.update(&pipeline.snapshot().await);
    bars.finish();
    Ok(pipeline.wait().await)
}

/// Report how a run ended, turning failures into errors.
pub async fn report_outcome(pipeline: &ProjectPipeline, status: ProjectStatus) -> Result<()> {
    let project = pipeline.project().await;
    match status {
        ProjectStatus::Failed => {
            let reason = project
                .last_error
                .map(|err| err.message)
                .unwrap_or_else(|| "unknown error".to_owned());
            Err(anyhow!("project {:?} failed: {}", project.id, reason))
        }
        _ => {
            info!(project = %project.id, %status, "Stopped");
            for stage in Stage::ALL {
                let failed = project.counters(stage).failed;
                if failed > 0 {
                    warn!(
                        %stage,
                        failed,
                        "Some pages failed; use `lumos retry {} --stage {}` to try them again",
                        project.id,
                        stage
                    );
                }
            }
            Ok(())
        }
    }
}
