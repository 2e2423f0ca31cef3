use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod aggregate;
mod async_utils;
mod cmd;
mod config;
mod cpu_limit;
mod engines;
mod error;
mod page_source;
mod pipeline;
mod prelude;
mod progress;
mod project;
mod rate_limit;
mod retry;
mod store;
mod toml_utils;
mod ui;

/// Resumable OCR and translation of scanned documents.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - LUMOS_OUTPUT_DIR (optional): Where projects are stored.
  - LUMOS_LMSTUDIO_URL (optional): Override the translation server URL.
  - LUMOS_LMSTUDIO_API_KEY (optional): API key for the translation server.

  These variables may be set in a standard `.env` file.

External Tools:
  `tesseract` for OCR, Poppler's `pdfinfo` and `pdftocairo` for PDFs, and
  either an OpenAI-compatible server (such as LM Studio) or `opencode` for
  translation. Run `lumos doctor` to check them.
"#
)]
struct Opts {
    #[clap(flatten)]
    global: cmd::GlobalOpts,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Create a project for a PDF or image.
    New(cmd::new::NewOpts),
    /// Start or resume a project. Ctrl-C pauses it.
    Run(cmd::run::RunCmdOpts),
    /// Retry the failed pages of a completed stage.
    Retry(cmd::run::RetryOpts),
    /// Cancel a project, keeping the pages done so far.
    Cancel(cmd::cancel::CancelOpts),
    /// Show the status of a project.
    Status(cmd::status::StatusOpts),
    /// Regenerate the whole-document text files from the page cache.
    Rebuild(cmd::rebuild::RebuildOpts),
    /// Check that the external tools we need are available.
    Doctor(cmd::doctor::DoctorOpts),
    /// Print schemas for our JSON formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Status(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
            _ => false,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    let global = &opts.global;
    match &opts.subcmd {
        Cmd::New(opts) => cmd::new::cmd_new(ui, global, opts).await?,
        Cmd::Run(opts) => cmd::run::cmd_run(ui, global, opts).await?,
        Cmd::Retry(opts) => cmd::run::cmd_retry(ui, global, opts).await?,
        Cmd::Cancel(opts) => cmd::cancel::cmd_cancel(global, opts).await?,
        Cmd::Status(opts) => cmd::status::cmd_status(global, opts).await?,
        Cmd::Rebuild(opts) => cmd::rebuild::cmd_rebuild(global, opts).await?,
        Cmd::Doctor(opts) => cmd::doctor::cmd_doctor(global, opts).await?,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await?,
    }
    Ok(())
}
