//! The `run` and `retry` subcommands.

use clap::Args;

use crate::{
    cmd::{GlobalOpts, RunOpts, follow_progress, report_outcome},
    pipeline::next_stage,
    prelude::*,
    project::Stage,
    ui::Ui,
};

/// `run` command line arguments.
#[derive(Debug, Args)]
pub struct RunCmdOpts {
    /// The project ID.
    pub project: String,

    /// Run this stage. Defaults to whatever comes next for the project.
    #[clap(long, value_enum)]
    pub stage: Option<Stage>,

    #[clap(flatten)]
    pub run_opts: RunOpts,
}

/// The `run` subcommand. Starts or resumes a project and shows progress until
/// it stops. Press Ctrl-C to pause.
#[instrument(level = "debug", skip_all, fields(project = %opts.project))]
pub async fn cmd_run(ui: Ui, global: &GlobalOpts, opts: &RunCmdOpts) -> Result<()> {
    let mut config = global.load_config().await?;
    opts.run_opts.apply(&mut config);
    let registry = global.registry(&config)?;
    let pipeline = registry.open(&opts.project).await?;

    let project = pipeline.project().await;
    let Some(stage) = opts.stage.or_else(|| next_stage(&project)) else {
        info!(status = %project.status, "Nothing left to do");
        return Ok(());
    };
    pipeline.start(stage).await?;
    let status = follow_progress(&ui, &pipeline).await?;
    report_outcome(&pipeline, status).await
}

/// `retry` command line arguments.
#[derive(Debug, Args)]
pub struct RetryOpts {
    /// The project ID.
    pub project: String,

    /// The stage whose failed pages should be retried.
    #[clap(long, value_enum, default_value = "extraction")]
    pub stage: Stage,

    #[clap(flatten)]
    pub run_opts: RunOpts,
}

/// The `retry` subcommand.
#[instrument(level = "debug", skip_all, fields(project = %opts.project))]
pub async fn cmd_retry(ui: Ui, global: &GlobalOpts, opts: &RetryOpts) -> Result<()> {
    let mut config = global.load_config().await?;
    opts.run_opts.apply(&mut config);
    let registry = global.registry(&config)?;
    let pipeline = registry.open(&opts.project).await?;

    let before = pipeline.project().await.status;
    let status = pipeline.retry_failed(opts.stage).await?;
    if status == before {
        info!(stage = %opts.stage, "No failed pages to retry");
        return Ok(());
    }
    let status = follow_progress(&ui, &pipeline).await?;
    report_outcome(&pipeline, status).await
}
