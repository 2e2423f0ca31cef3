//! Project records and the project status state machine.
//!
//! Each project lives in its own directory under the output root:
//!
//! ```text
//! <root>/<project-id>/
//!     project.json            metadata and status
//!     pages/extraction/       one record per OCRed page
//!     pages/translation/      one record per translated page
//!     ocr.txt                 whole-document OCR text (derived)
//!     translation.txt         whole-document translation (derived)
//! ```

use std::{fmt, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use schemars::JsonSchema;

use crate::{
    async_utils::io::{read_optional, write_atomic},
    error::{LastError, StorageError},
    prelude::*,
};

/// One processing phase, applied page by page.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Eq,
    Serialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// OCR of the rasterized page.
    Extraction,
    /// Translation of the OCRed page text.
    Translation,
}

impl Stage {
    /// Both stages, in processing order.
    pub const ALL: [Stage; 2] = [Stage::Extraction, Stage::Translation];

    /// The directory name used for this stage's page cache.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Translation => "translation",
        }
    }

    /// The file name of this stage's whole-document artifact.
    pub fn artifact_name(self) -> &'static str {
        match self {
            Stage::Extraction => "ocr.txt",
            Stage::Translation => "translation.txt",
        }
    }

    /// The status of a project while this stage is running.
    pub fn running(self) -> ProjectStatus {
        match self {
            Stage::Extraction => ProjectStatus::ExtractionRunning,
            Stage::Translation => ProjectStatus::TranslationRunning,
        }
    }

    /// The status of a project while this stage is paused.
    pub fn paused(self) -> ProjectStatus {
        match self {
            Stage::Extraction => ProjectStatus::ExtractionPaused,
            Stage::Translation => ProjectStatus::TranslationPaused,
        }
    }

    /// The status of a project once this stage is complete.
    pub fn done(self) -> ProjectStatus {
        match self {
            Stage::Extraction => ProjectStatus::ExtractionDone,
            Stage::Translation => ProjectStatus::TranslationDone,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Where a project is in its lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    ExtractionRunning,
    ExtractionPaused,
    ExtractionDone,
    TranslationRunning,
    TranslationPaused,
    TranslationDone,
    /// An unrecoverable error stopped the project. See `last_error`.
    Failed,
    /// The user cancelled the project. Cached pages remain valid.
    Cancelled,
}

impl ProjectStatus {
    /// The stage this status belongs to, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            ProjectStatus::ExtractionRunning
            | ProjectStatus::ExtractionPaused
            | ProjectStatus::ExtractionDone => Some(Stage::Extraction),
            ProjectStatus::TranslationRunning
            | ProjectStatus::TranslationPaused
            | ProjectStatus::TranslationDone => Some(Stage::Translation),
            ProjectStatus::Created | ProjectStatus::Failed | ProjectStatus::Cancelled => {
                None
            }
        }
    }

    /// Is a stage runner active?
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ProjectStatus::ExtractionRunning | ProjectStatus::TranslationRunning
        )
    }

    /// Is a stage paused?
    pub fn is_paused(self) -> bool {
        matches!(
            self,
            ProjectStatus::ExtractionPaused | ProjectStatus::TranslationPaused
        )
    }

    /// Terminal statuses never change on their own, and cannot be cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProjectStatus::TranslationDone | ProjectStatus::Failed | ProjectStatus::Cancelled
        )
    }

    /// A short human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            ProjectStatus::Created => "created",
            ProjectStatus::ExtractionRunning => "OCR in progress",
            ProjectStatus::ExtractionPaused => "OCR paused",
            ProjectStatus::ExtractionDone => "OCR done",
            ProjectStatus::TranslationRunning => "translating",
            ProjectStatus::TranslationPaused => "translation paused",
            ProjectStatus::TranslationDone => "done",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-stage progress counters.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct StageCounters {
    /// Pages with a `done` result.
    pub completed: usize,
    /// Pages whose latest result is `failed`.
    pub failed: usize,
    /// Total pages in the document.
    pub total: usize,
}

impl StageCounters {
    /// Create empty counters for a document of `total` pages.
    pub fn new(total: usize) -> Self {
        Self {
            completed: 0,
            failed: 0,
            total,
        }
    }

    /// Pages that have no terminal result yet.
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed + self.failed)
    }
}

/// The persisted project record (`project.json`).
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Project {
    /// The project ID, which is also its directory name.
    pub id: String,

    /// The document we are processing.
    pub source: PathBuf,

    /// Number of pages. Pages are indexed `0..total_pages`.
    pub total_pages: usize,

    /// Tesseract languages used for OCR, e.g. `["por", "eng"]`.
    pub ocr_languages: Vec<String>,

    /// Translate into this language after OCR, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,

    /// Current status.
    pub status: ProjectStatus,

    /// The stage that was active when the project was last running. Used to
    /// decide what to resume after `failed` or `cancelled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_stage: Option<Stage>,

    /// OCR progress.
    pub extraction: StageCounters,

    /// Translation progress.
    pub translation: StageCounters,

    /// The error that made this project fail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project record.
    pub fn new(
        id: String,
        source: PathBuf,
        total_pages: usize,
        ocr_languages: Vec<String>,
        target_language: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            source,
            total_pages,
            ocr_languages,
            target_language,
            status: ProjectStatus::Created,
            active_stage: None,
            extraction: StageCounters::new(total_pages),
            translation: StageCounters::new(total_pages),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Counters for a stage.
    pub fn counters(&self, stage: Stage) -> &StageCounters {
        match stage {
            Stage::Extraction => &self.extraction,
            Stage::Translation => &self.translation,
        }
    }

    /// Mutable counters for a stage.
    pub fn counters_mut(&mut self, stage: Stage) -> &mut StageCounters {
        match stage {
            Stage::Extraction => &mut self.extraction,
            Stage::Translation => &mut self.translation,
        }
    }

    /// Does this project want a translation?
    pub fn wants_translation(&self) -> bool {
        self.target_language.is_some()
    }

    /// Mark a stage that was running when its process went away as paused.
    /// Returns true if the status changed.
    pub fn recover_interrupted(&mut self) -> bool {
        if self.status.is_running()
            && let Some(stage) = self.status.stage()
        {
            self.status = stage.paused();
            self.touch();
            return true;
        }
        false
    }

    /// Update `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Persist this record atomically.
    pub async fn save(&self, paths: &ProjectPaths) -> Result<(), StorageError> {
        let path = paths.meta_path();
        let json = serde_json::to_vec_pretty(self)
            .map_err(|err| StorageError::new("serialize", &path, err.into()))?;
        write_atomic(&path, json).await?;
        trace!(path = %path.display(), status = %self.status, "Saved project record");
        Ok(())
    }

    /// Load a project record, if one exists.
    pub async fn load(paths: &ProjectPaths) -> Result<Option<Self>, StorageError> {
        let path = paths.meta_path();
        let Some(data) = read_optional(&path).await? else {
            return Ok(None);
        };
        let project = serde_json::from_slice(&data)
            .map_err(|err| StorageError::new("parse", &path, err.into()))?;
        Ok(Some(project))
    }
}

/// The on-disk layout of a single project.
#[derive(Clone, Debug)]
pub struct ProjectPaths {
    folder: PathBuf,
}

impl ProjectPaths {
    /// Paths for project `id` under `root`.
    pub fn new(root: &Path, id: &str) -> Self {
        Self {
            folder: root.join(id),
        }
    }

    /// The project directory.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// The project record.
    pub fn meta_path(&self) -> PathBuf {
        self.folder.join("project.json")
    }

    /// The root of the per-page cache.
    pub fn pages_dir(&self) -> PathBuf {
        self.folder.join("pages")
    }

    /// The whole-document artifact for a stage.
    pub fn artifact_path(&self, stage: Stage) -> PathBuf {
        self.folder.join(stage.artifact_name())
    }

    /// Held by whichever process is running the project.
    pub fn lock_path(&self) -> PathBuf {
        self.folder.join(".lock")
    }

    /// Pause and cancel requests from other processes.
    pub fn control_path(&self) -> PathBuf {
        self.folder.join("control")
    }
}

/// Characters that can't appear in directory names on common filesystems.
static UNSAFE_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("failed to compile regex")
});

/// Runs of whitespace.
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("failed to compile regex"));

/// Convert a display name into a safe project ID.
pub fn sanitize_project_name(name: &str) -> String {
    let safe = UNSAFE_CHARS.replace_all(name.trim(), "_");
    let safe = WHITESPACE.replace_all(&safe, "_");
    let safe = safe.trim_matches(|c| c == '.' || c == '_');
    if safe.is_empty() {
        "project".to_owned()
    } else {
        safe.to_owned()
    }
}

/// Parse a Tesseract-style language list such as `por+eng`.
pub fn parse_languages(spec: &str) -> Vec<String> {
    spec.split(['+', ','])
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_project_name_replaces_unsafe_characters() {
        assert_eq!(sanitize_project_name("My Scan: vol/2"), "My_Scan__vol_2");
        assert_eq!(sanitize_project_name("  spaced   out  "), "spaced_out");
        assert_eq!(sanitize_project_name("..hidden.."), "hidden");
        assert_eq!(sanitize_project_name("???"), "project");
        assert_eq!(sanitize_project_name(""), "project");
    }

    #[test]
    fn parse_languages_accepts_tesseract_syntax() {
        assert_eq!(parse_languages("por+eng"), vec!["por", "eng"]);
        assert_eq!(parse_languages(" deu , fra+"), vec!["deu", "fra"]);
        assert!(parse_languages("").is_empty());
    }

    #[test]
    fn statuses_know_their_stage() {
        for stage in Stage::ALL {
            assert_eq!(stage.running().stage(), Some(stage));
            assert_eq!(stage.paused().stage(), Some(stage));
            assert_eq!(stage.done().stage(), Some(stage));
            assert!(stage.running().is_running());
            assert!(stage.paused().is_paused());
        }
        assert!(ProjectStatus::Failed.is_terminal());
        assert!(!ProjectStatus::ExtractionDone.is_terminal());
    }

    #[test]
    fn interrupted_stages_recover_as_paused() {
        let mut project = Project::new(
            "p".to_owned(),
            PathBuf::from("p.pdf"),
            1,
            vec!["eng".to_owned()],
            None,
        );
        assert!(!project.recover_interrupted());
        project.status = ProjectStatus::TranslationRunning;
        assert!(project.recover_interrupted());
        assert_eq!(project.status, ProjectStatus::TranslationPaused);
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&ProjectStatus::TranslationPaused).unwrap();
        assert_eq!(json, r#""translation_paused""#);
    }

    #[tokio::test]
    async fn save_and_load_project_record() -> Result<()> {
        let root = tempfile::TempDir::new()?;
        let paths = ProjectPaths::new(root.path(), "book");
        assert!(Project::load(&paths).await?.is_none());

        let mut project = Project::new(
            "book".to_owned(),
            PathBuf::from("/tmp/book.pdf"),
            12,
            parse_languages("por+eng"),
            Some("Portuguese".to_owned()),
        );
        project.extraction.completed = 4;
        project.save(&paths).await?;

        let loaded = Project::load(&paths).await?.expect("project should exist");
        assert_eq!(loaded, project);
        assert_eq!(loaded.extraction.remaining(), 8);
        Ok(())
    }

    #[tokio::test]
    async fn load_rejects_corrupt_records() -> Result<()> {
        let root = tempfile::TempDir::new()?;
        let paths = ProjectPaths::new(root.path(), "broken");
        std::fs::create_dir_all(paths.folder())?;
        std::fs::write(paths.meta_path(), "{ not json")?;
        let err = Project::load(&paths).await.unwrap_err();
        assert_eq!(err.action, "parse");
        Ok(())
    }
}
