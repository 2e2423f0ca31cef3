//! The `cancel` subcommand.

use clap::Args;

use crate::{cmd::GlobalOpts, prelude::*};

/// `cancel` command line arguments.
#[derive(Debug, Args)]
pub struct CancelOpts {
    /// The project ID.
    pub project: String,
}

/// The `cancel` subcommand. Stored pages are kept, and the project can be
/// started again later.
#[instrument(level = "debug", skip_all, fields(project = %opts.project))]
pub async fn cmd_cancel(global: &GlobalOpts, opts: &CancelOpts) -> Result<()> {
    let config = global.load_config().await?;
    let pipeline = global.registry(&config)?.open(&opts.project).await?;
    let status = pipeline.cancel().await?;
    info!(%status, "Cancelled project");
    Ok(())
}
