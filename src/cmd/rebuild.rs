//! The `rebuild` subcommand.

use clap::Args;

use crate::{cmd::GlobalOpts, prelude::*};

/// `rebuild` command line arguments.
#[derive(Debug, Args)]
pub struct RebuildOpts {
    /// The project ID.
    pub project: String,
}

/// The `rebuild` subcommand. Regenerates `ocr.txt` and `translation.txt`
/// from the page cache, without calling any engines.
#[instrument(level = "debug", skip_all, fields(project = %opts.project))]
pub async fn cmd_rebuild(global: &GlobalOpts, opts: &RebuildOpts) -> Result<()> {
    let config = global.load_config().await?;
    let pipeline = global.registry(&config)?.open(&opts.project).await?;
    for path in pipeline.rebuild_artifacts().await? {
        info!(path = %path.display(), "Rebuilt");
        println!("{}", path.display());
    }
    Ok(())
}
