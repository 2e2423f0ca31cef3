//! Durable per-page results.
//!
//! The page store is what makes a run resumable. Every page that reaches a
//! terminal outcome gets one small JSON record, published atomically, at
//! `pages/<stage>/page_<NNNN>.json`. Anything that can't be parsed as a
//! complete record (a stray temporary file, a truncated write from some
//! other tool) is treated as absent, so the page will simply be processed
//! again.

use std::{collections::BTreeMap, io, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use schemars::JsonSchema;
use tokio::fs;

use crate::{
    async_utils::io::{read_optional, write_atomic},
    error::StorageError,
    prelude::*,
    project::Stage,
};

/// Matches the file names of published page records.
static PAGE_FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^page_(\d+)\.json$").expect("failed to compile regex"));

/// The terminal outcome of processing a page.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageOutcome {
    Done,
    Failed,
}

/// The stored result of running one stage over one page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageResult {
    pub stage: Stage,
    pub index: usize,
    pub outcome: PageOutcome,

    /// The page text. Empty for failed pages.
    pub content: String,

    /// Why the page failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

impl PageResult {
    /// Is this a successful result?
    pub fn is_done(&self) -> bool {
        self.outcome == PageOutcome::Done
    }
}

/// Filesystem-backed store of [`PageResult`]s.
///
/// Writes for different pages touch different files, so concurrent workers
/// never need to coordinate with each other.
#[derive(Clone, Debug)]
pub struct PageStore {
    root: PathBuf,
}

impl PageStore {
    /// Create a store rooted at `root` (usually `<project>/pages`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory holding one stage's records.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    /// The record path for a page.
    pub fn page_path(&self, stage: Stage, index: usize) -> PathBuf {
        self.stage_dir(stage).join(format!("page_{index:04}.json"))
    }

    /// Does this page have a `done` result?
    pub async fn has(&self, stage: Stage, index: usize) -> Result<bool, StorageError> {
        Ok(self
            .get(stage, index)
            .await?
            .is_some_and(|result| result.is_done()))
    }

    /// Fetch the stored result for a page, if any.
    pub async fn get(
        &self,
        stage: Stage,
        index: usize,
    ) -> Result<Option<PageResult>, StorageError> {
        let path = self.page_path(stage, index);
        let Some(data) = read_optional(&path).await? else {
            return Ok(None);
        };
        Ok(parse_record(&path, &data, stage, index))
    }

    /// Persist a page result.
    ///
    /// A `done` result is immutable: if one already exists, it is returned
    /// unchanged. A `failed` result may be replaced by a later attempt.
    #[instrument(level = "trace", skip(self, content, error))]
    pub async fn put(
        &self,
        stage: Stage,
        index: usize,
        outcome: PageOutcome,
        content: String,
        error: Option<String>,
    ) -> Result<PageResult, StorageError> {
        if let Some(existing) = self.get(stage, index).await?
            && existing.is_done()
        {
            debug!(%stage, index, "Page already done; keeping existing result");
            return Ok(existing);
        }

        let result = PageResult {
            stage,
            index,
            outcome,
            content,
            error,
            recorded_at: Utc::now(),
        };
        let path = self.page_path(stage, index);
        let json = serde_json::to_vec(&result)
            .map_err(|err| StorageError::new("serialize", &path, err.into()))?;
        write_atomic(&path, json).await?;
        Ok(result)
    }

    /// List the outcome of every recorded page for a stage, in index order.
    pub async fn list(
        &self,
        stage: Stage,
    ) -> Result<Vec<(usize, PageOutcome)>, StorageError> {
        Ok(self
            .load_all(stage)
            .await?
            .into_iter()
            .map(|(index, result)| (index, result.outcome))
            .collect())
    }

    /// Load every recorded page for a stage, keyed by index.
    pub async fn load_all(
        &self,
        stage: Stage,
    ) -> Result<BTreeMap<usize, PageResult>, StorageError> {
        let dir = self.stage_dir(stage);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(StorageError::new("list", &dir, err)),
        };

        let mut results = BTreeMap::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StorageError::new("list", &dir, err))?
        {
            let file_name = entry.file_name();
            let Some(index) = file_name
                .to_str()
                .and_then(|name| PAGE_FILE_NAME.captures(name))
                .and_then(|caps| caps[1].parse::<usize>().ok())
            else {
                // Temporary files and anything else we didn't write.
                trace!(file = ?file_name, "Ignoring unrecognized file in page store");
                continue;
            };
            let path = entry.path();
            let Some(data) = read_optional(&path).await? else {
                continue;
            };
            if let Some(result) = parse_record(&path, &data, stage, index) {
                results.insert(index, result);
            }
        }
        Ok(results)
    }
}

/// Parse a page record, discarding anything that isn't a complete record for
/// the expected page.
fn parse_record(path: &Path, data: &[u8], stage: Stage, index: usize) -> Option<PageResult> {
    match serde_json::from_slice::<PageResult>(data) {
        Ok(result) if result.stage == stage && result.index == index => Some(result),
        Ok(result) => {
            warn!(
                path = %path.display(),
                found_stage = %result.stage,
                found_index = result.index,
                "Page record does not match its location; ignoring it"
            );
            None
        }
        Err(err) => {
            warn!(path = %path.display(), "Ignoring unreadable page record: {}", err);
            None
        }
    }
}
