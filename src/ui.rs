//! Application UI. For now, this is mostly progress bars.
//!
//! This is adapted from `substudy` by Eric Kidd, which is licensed under
//! Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::{
    progress::StatusSnapshot,
    project::{Stage, StageCounters},
};

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    /// Our progress bars.
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI. This sets up logging and and progress bars.
    pub fn init() -> Ui {
        let multi_progress = Arc::new(MultiProgress::new());
        Ui { multi_progress }
    }

    /// Create a new UI for unit tests.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        let multi_progress =
            Arc::new(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()));
        Ui { multi_progress }
    }

    /// Hide all our progress bars completely, for when we're writing actual
    /// output to `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Get a writer than can be used to write to stderr, for use with `tracing`
    /// and other output code.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Get a reference to our progress bars.
    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi_progress
    }

    /// Create a new progress bar with default settings.
    pub fn new_progress_bar(&self, config: &ProgressConfig<'_>, len: u64) -> ProgressBar {
        let pb = ProgressBar::new(len).with_style(default_progress_style());
        let pb = self.multi_progress.add(pb);
        #[cfg(test)]
        pb.set_draw_target(ProgressDrawTarget::hidden());
        pb.set_prefix(config.emoji.to_owned());
        pb.set_message(config.msg.to_owned());
        pb.enable_steady_tick(Duration::from_millis(250));
        pb.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }

    /// Create one progress bar per stage of a project.
    pub fn stage_bars(&self, snapshot: &StatusSnapshot, stages: &[Stage]) -> StageBars {
        let bars = stages
            .iter()
            .map(|&stage| {
                let config = match stage {
                    Stage::Extraction => ProgressConfig {
                        emoji: "🔍",
                        msg: "OCR",
                        done_msg: "OCR finished",
                    },
                    Stage::Translation => ProgressConfig {
                        emoji: "🌐",
                        msg: "Translating",
                        done_msg: "Translation finished",
                    },
                };
                let counters = stage_counters(snapshot, stage);
                let bar = self.new_progress_bar(&config, counters.total as u64);
                (stage, bar)
            })
            .collect::<Vec<_>>();
        let bars = StageBars { bars };
        bars.update(snapshot);
        bars
    }
}

fn stage_counters(snapshot: &StatusSnapshot, stage: Stage) -> StageCounters {
    match stage {
        Stage::Extraction => snapshot.extraction,
        Stage::Translation => snapshot.translation,
    }
}

/// Progress bars for the stages of one project.
pub struct StageBars {
    bars: Vec<(Stage, ProgressBar)>,
}

impl StageBars {
    /// Show the counters from a status snapshot.
    pub fn update(&self, snapshot: &StatusSnapshot) {
        for (stage, bar) in &self.bars {
            let counters = stage_counters(snapshot, *stage);
            bar.set_position((counters.completed + counters.failed) as u64);
            if counters.failed > 0 {
                bar.set_message(format!("{} ({} failed)", stage, counters.failed));
            }
        }
    }

    /// Finish all bars, leaving their final state on screen.
    pub fn finish(&self) {
        for (_, bar) in &self.bars {
            bar.finish_using_style();
        }
    }
}

/// Configuration for a progress bar.
pub struct ProgressConfig<'a> {
    /// Emoji to display in the progress bar.
    pub emoji: &'a str,
    /// Message to display in a running progress bar.
    pub msg: &'a str,
    /// Message to display in a progress bar when it is done.
    pub done_msg: &'a str,
}

fn default_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{msg:25} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
        .expect("bad progress bar template")
}

/// A writer which can used to write to `stderr`. It will hide and show progress
/// bars as needed, so that they don't interfere with the output.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

// The `tracing-indicatif` crate suggests that we should implement the following
// methods.
impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress().suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress().suspend(|| io::stderr().flush())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_vectored(bufs))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_all(buf))
    }

    fn write_fmt(&mut self, fmt: std::fmt::Arguments<'_>) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_fmt(fmt))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectStatus;

    #[test]
    fn stage_bars_track_counters() {
        let ui = Ui::init_for_tests();
        let mut snapshot = StatusSnapshot {
            status: ProjectStatus::ExtractionRunning,
            extraction: StageCounters::new(4),
            translation: StageCounters::new(4),
            last_error: None,
            failed_pages: vec![],
        };
        let bars = ui.stage_bars(&snapshot, &Stage::ALL);
        snapshot.extraction.completed = 2;
        snapshot.extraction.failed = 1;
        bars.update(&snapshot);
        assert_eq!(bars.bars[0].1.position(), 3);
        assert_eq!(bars.bars[0].1.length(), Some(4));
        assert_eq!(bars.bars[1].1.position(), 0);
        bars.finish();
    }
}
