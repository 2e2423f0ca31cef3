//! Whole-document text, assembled from per-page results.
//!
//! The aggregate is derived state. [`Aggregator::rebuild`] computes it purely
//! from the [`PageStore`], and [`AggregateView`] maintains the same text
//! incrementally while a stage is running. Both use [`render_pages`], so an
//! incrementally-maintained artifact always matches a fresh rebuild.

use std::collections::BTreeMap;

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{
    async_utils::io::write_atomic,
    error::StorageError,
    prelude::*,
    project::{ProjectPaths, Stage},
    store::PageStore,
};

/// How to render pages that have no `done` result.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Render `[[page N unavailable]]` in place of the page.
    #[default]
    Placeholder,
    /// Leave the page out entirely.
    Omit,
}

/// Formatting options for aggregates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AggregateFormat {
    pub gaps: GapPolicy,

    /// Put a `--- Page N ---` header before each page of a multi-page
    /// document.
    pub page_headers: bool,
}

impl Default for AggregateFormat {
    fn default() -> Self {
        Self {
            gaps: GapPolicy::Placeholder,
            page_headers: true,
        }
    }
}

/// Render the text of a document from its completed pages.
///
/// Pages are always emitted in index order. A single-page document is just
/// its page text. Page numbers in headers and placeholders are 1-based.
pub fn render_pages(
    total_pages: usize,
    pages: &BTreeMap<usize, String>,
    format: AggregateFormat,
) -> String {
    let mut blocks = Vec::with_capacity(total_pages);
    for index in 0..total_pages {
        let number = index + 1;
        let text = match pages.get(&index) {
            Some(text) => text.clone(),
            None if format.gaps == GapPolicy::Placeholder => {
                format!("[[page {number} unavailable]]")
            }
            None => continue,
        };
        if format.page_headers && total_pages > 1 {
            blocks.push(format!("--- Page {number} ---\n\n{text}"));
        } else {
            blocks.push(text);
        }
    }
    blocks.join("\n\n")
}

/// Builds aggregates from the page store.
#[derive(Clone, Debug)]
pub struct Aggregator {
    store: PageStore,
    paths: ProjectPaths,
    total_pages: usize,
    format: AggregateFormat,
}

impl Aggregator {
    /// Create an aggregator for a project.
    pub fn new(
        store: PageStore,
        paths: ProjectPaths,
        total_pages: usize,
        format: AggregateFormat,
    ) -> Self {
        Self {
            store,
            paths,
            total_pages,
            format,
        }
    }

    /// Rebuild the full text of a stage from the page store.
    pub async fn rebuild(&self, stage: Stage) -> Result<String, StorageError> {
        let pages = self.done_pages(stage).await?;
        Ok(render_pages(self.total_pages, &pages, self.format))
    }

    /// Start an incremental view of a stage, seeded from the page store.
    pub async fn view(&self, stage: Stage) -> Result<AggregateView, StorageError> {
        Ok(AggregateView {
            stage,
            total_pages: self.total_pages,
            format: self.format,
            pages: self.done_pages(stage).await?,
        })
    }

    /// Rebuild a stage and write its artifact.
    #[instrument(level = "debug", skip(self))]
    pub async fn write_artifact(&self, stage: Stage) -> Result<String, StorageError> {
        let text = self.rebuild(stage).await?;
        self.write_text(stage, &text).await?;
        Ok(text)
    }

    /// Write already-rendered text as a stage's artifact.
    pub async fn write_text(&self, stage: Stage, text: &str) -> Result<(), StorageError> {
        write_atomic(&self.paths.artifact_path(stage), text.as_bytes().to_vec()).await
    }

    /// The content of every `done` page for a stage.
    async fn done_pages(
        &self,
        stage: Stage,
    ) -> Result<BTreeMap<usize, String>, StorageError> {
        Ok(self
            .store
            .load_all(stage)
            .await?
            .into_iter()
            .filter(|(index, result)| result.is_done() && *index < self.total_pages)
            .map(|(index, result)| (index, result.content))
            .collect())
    }
}

/// An in-memory aggregate, updated as pages complete.
#[derive(Clone, Debug)]
pub struct AggregateView {
    stage: Stage,
    total_pages: usize,
    format: AggregateFormat,
    pages: BTreeMap<usize, String>,
}

impl AggregateView {
    /// Which stage is this?
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Record a newly completed page.
    pub fn apply(&mut self, index: usize, content: &str) {
        if index < self.total_pages {
            self.pages.insert(index, content.to_owned());
        }
    }

    /// Length of the gap-free prefix of completed pages.
    pub fn confirmed_prefix(&self) -> usize {
        (0..self.total_pages)
            .take_while(|index| self.pages.contains_key(index))
            .count()
    }

    /// Render the current text.
    pub fn render(&self) -> String {
        render_pages(self.total_pages, &self.pages, self.format)
    }
}
