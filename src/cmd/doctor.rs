//! The `doctor` subcommand.

use clap::Args;
use tokio::process::Command;

use crate::{
    cmd::GlobalOpts,
    config::TranslatorBackend,
    engines::{lmstudio::LmStudioTranslator, tesseract::installed_languages},
    prelude::*,
    project::parse_languages,
};

/// `doctor` command line arguments.
#[derive(Debug, Args)]
pub struct DoctorOpts {
    /// OCR languages that should be installed.
    #[clap(short = 'l', long = "lang", default_value = "por+eng")]
    pub languages: String,

    /// Don't check the translation backend.
    #[clap(long)]
    pub skip_translator: bool,
}

/// The `doctor` subcommand. Checks that the external tools we need are
/// installed and reachable.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_doctor(global: &GlobalOpts, opts: &DoctorOpts) -> Result<()> {
    let config = global.load_config().await?;
    config.validate()?;
    let mut problems = 0;

    match installed_languages().await {
        Ok(installed) => {
            let missing = parse_languages(&opts.languages)
                .into_iter()
                .filter(|lang| !installed.contains(lang))
                .collect::<Vec<_>>();
            if missing.is_empty() {
                info!(languages = %installed.join(", "), "tesseract: ok");
            } else {
                problems += 1;
                error!(missing = %missing.join(", "), "tesseract: missing language packs");
            }
        }
        Err(err) => {
            problems += 1;
            error!("tesseract: {:#}", err);
        }
    }

    for tool in ["pdfinfo", "pdftocairo"] {
        match tool_version(tool).await {
            Ok(version) => info!(%version, "{}: ok", tool),
            Err(err) => {
                problems += 1;
                error!("{}: {:#}", tool, err);
            }
        }
    }

    if !opts.skip_translator {
        let checked = match config.engines.translator {
            TranslatorBackend::LmStudio => {
                let translator = LmStudioTranslator::new(&config.engines)?;
                translator.list_models().await.map(|models| models.join(", "))
            }
            TranslatorBackend::OpenCode => tool_version("opencode").await,
        };
        match checked {
            Ok(details) => info!(%details, "translator: ok"),
            Err(err) => {
                problems += 1;
                error!("translator: {:#}", err);
            }
        }
    }

    if problems > 0 {
        return Err(anyhow!("found {} problem(s)", problems));
    }
    Ok(())
}

/// Run `tool -v` and return the first line it prints.
async fn tool_version(tool: &str) -> Result<String> {
    let output = Command::new(tool)
        .arg("-v")
        .output()
        .await
        .with_context(|| format!("cannot run {tool}; is it installed?"))?;
    // Poppler prints its version on stderr.
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(text.lines().next().unwrap_or_default().trim().to_owned())
}
