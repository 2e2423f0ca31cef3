//! The `new` subcommand.

use clap::Args;

use crate::{
    cmd::{GlobalOpts, RunOpts, follow_progress, report_outcome},
    prelude::*,
    project::{Stage, parse_languages},
    ui::Ui,
};

/// `new` command line arguments.
#[derive(Debug, Args)]
pub struct NewOpts {
    /// A name for the project. It will be turned into a safe directory name.
    pub name: String,

    /// The PDF or image to process.
    pub source: PathBuf,

    /// Tesseract OCR languages, such as `por+eng`.
    #[clap(short = 'l', long = "lang", default_value = "por+eng")]
    pub languages: String,

    /// Translate the OCR text into this language.
    #[clap(short = 't', long)]
    pub translate_to: Option<String>,

    /// Start processing right away.
    #[clap(long)]
    pub run: bool,

    #[clap(flatten)]
    pub run_opts: RunOpts,
}

/// The `new` subcommand.
#[instrument(level = "debug", skip_all, fields(name = %opts.name))]
pub async fn cmd_new(ui: Ui, global: &GlobalOpts, opts: &NewOpts) -> Result<()> {
    let mut config = global.load_config().await?;
    opts.run_opts.apply(&mut config);
    let registry = global.registry(&config)?;

    let pipeline = registry
        .create(
            &opts.name,
            &opts.source,
            parse_languages(&opts.languages),
            opts.translate_to.clone(),
        )
        .await?;
    let project = pipeline.project().await;
    info!(
        project = %project.id,
        pages = project.total_pages,
        folder = %pipeline.paths().folder().display(),
        "Created project"
    );
    println!("{}", project.id);

    if opts.run {
        pipeline.start(Stage::Extraction).await?;
        let status = follow_progress(&ui, &pipeline).await?;
        report_outcome(&pipeline, status).await?;
    }
    Ok(())
}
