//! The `status` subcommand.

use std::fmt::Write as _;

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    cmd::GlobalOpts,
    prelude::*,
    progress::{PageRef, StatusSnapshot},
    project::{Project, Stage},
};

/// `status` command line arguments.
#[derive(Debug, Args)]
pub struct StatusOpts {
    /// The project ID.
    pub project: String,

    /// Print JSON instead of a summary.
    #[clap(long)]
    pub json: bool,
}

/// What `status --json` prints.
#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    #[serde(flatten)]
    project: &'a Project,
    failed_pages: &'a [PageRef],
}

/// The `status` subcommand.
#[instrument(level = "debug", skip_all, fields(project = %opts.project))]
pub async fn cmd_status(global: &GlobalOpts, opts: &StatusOpts) -> Result<()> {
    let config = global.load_config().await?;
    let pipeline = global.registry(&config)?.open(&opts.project).await?;
    let project = pipeline.project().await;
    let snapshot = pipeline.snapshot().await;

    let mut output = if opts.json {
        let report = StatusReport {
            project: &project,
            failed_pages: &snapshot.failed_pages,
        };
        serde_json::to_string_pretty(&report).context("failed to serialize status")?
    } else {
        format_summary(&project, &snapshot)
    };
    output.push('\n');

    let mut wtr = create_writer(None).await?;
    wtr.write_all(output.as_bytes())
        .await
        .context("failed to write status")?;
    wtr.flush().await.context("failed to flush status")?;
    Ok(())
}

/// Format a human-readable summary.
fn format_summary(project: &Project, snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Project:  {}", project.id);
    let _ = writeln!(
        out,
        "Source:   {} ({} pages)",
        project.source.display(),
        project.total_pages
    );
    let _ = writeln!(out, "Status:   {}", snapshot.status);
    for stage in Stage::ALL {
        if stage == Stage::Translation && !project.wants_translation() {
            continue;
        }
        let counters = project.counters(stage);
        let label = match stage {
            Stage::Extraction => "OCR".to_owned(),
            Stage::Translation => format!(
                "Translation to {}",
                project.target_language.as_deref().unwrap_or_default()
            ),
        };
        let _ = write!(
            out,
            "{label}: {}/{} done",
            counters.completed, counters.total
        );
        let failed = snapshot
            .failed_pages
            .iter()
            .filter(|page| page.stage == stage)
            .map(|page| (page.index + 1).to_string())
            .collect::<Vec<_>>();
        if !failed.is_empty() {
            let _ = write!(out, ", failed pages: {}", failed.join(", "));
        }
        if counters.remaining() > 0 {
            let _ = write!(out, ", {} remaining", counters.remaining());
        }
        out.push('\n');
    }
    if let Some(err) = &snapshot.last_error {
        let _ = writeln!(out, "Last error: {}", err.message);
    }
    out.trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectStatus;

    #[test]
    fn summary_lists_failed_pages() {
        let mut project = Project::new(
            "book".to_owned(),
            PathBuf::from("/scans/book.pdf"),
            4,
            vec!["por".to_owned()],
            Some("English".to_owned()),
        );
        project.status = ProjectStatus::TranslationRunning;
        project.extraction.completed = 3;
        project.extraction.failed = 1;
        let snapshot = StatusSnapshot {
            status: project.status,
            extraction: project.extraction,
            translation: project.translation,
            last_error: None,
            failed_pages: vec![PageRef {
                stage: Stage::Extraction,
                index: 2,
            }],
        };
        let summary = format_summary(&project, &snapshot);
        assert!(summary.contains("Status:   translating"), "{summary}");
        assert!(summary.contains("OCR: 3/4 done, failed pages: 3"), "{summary}");
        assert!(
            summary.contains("Translation to English: 0/4 done, 4 remaining"),
            "{summary}"
        );
    }
}
