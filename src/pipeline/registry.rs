//! Creating and opening projects under an output root.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::{
    config::PipelineConfig,
    engines::Engines,
    error::PipelineError,
    prelude::*,
    project::{Project, ProjectPaths, sanitize_project_name},
};

use super::{ProjectPipeline, lock::ProjectLock};

/// Every project we have opened in this process, by ID.
pub struct ProjectRegistry {
    root: PathBuf,
    config: PipelineConfig,
    engines: Engines,
    projects: Mutex<HashMap<String, ProjectPipeline>>,
}

impl ProjectRegistry {
    /// Create a registry for projects under `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        config: PipelineConfig,
        engines: Engines,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            root: root.into(),
            config,
            engines,
            projects: Mutex::new(HashMap::new()),
        })
    }

    /// The output root.
    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a new project for the document at `source`.
    ///
    /// The project ID is derived from `name`. We open the document to count
    /// its pages, so unreadable or empty documents are rejected up front.
    #[instrument(level = "debug", skip(self, ocr_languages, target_language))]
    pub async fn create(
        &self,
        name: &str,
        source: &Path,
        ocr_languages: Vec<String>,
        target_language: Option<String>,
    ) -> Result<ProjectPipeline, PipelineError> {
        let mut projects = self.projects.lock().await;
        let id = sanitize_project_name(name);
        let paths = ProjectPaths::new(&self.root, &id);
        if projects.contains_key(&id) || Project::load(&paths).await?.is_some() {
            return Err(PipelineError::config(format!(
                "project {:?} already exists in {:?}",
                id,
                self.root.display()
            )));
        }
        if ocr_languages.is_empty() {
            return Err(PipelineError::config("at least one OCR language is required"));
        }
        let target_language = target_language
            .map(|lang| lang.trim().to_owned())
            .filter(|lang| !lang.is_empty());

        let source = std::path::absolute(source).map_err(|err| {
            PipelineError::config(format!("bad source path {:?}: {}", source.display(), err))
        })?;
        let document = self.engines.sources.open(&source).await.map_err(|err| {
            PipelineError::config(format!("cannot open {:?}: {:#}", source.display(), err))
        })?;
        let total_pages = document.page_count();
        if total_pages == 0 {
            return Err(PipelineError::config(format!(
                "{:?} has no pages",
                source.display()
            )));
        }

        let project = Project::new(
            id.clone(),
            source,
            total_pages,
            ocr_languages,
            target_language,
        );
        project.save(&paths).await?;
        info!(project = %id, total_pages, "Created project");
        let pipeline = ProjectPipeline::new(
            project,
            paths,
            self.config.clone(),
            self.engines.clone(),
            Some(document),
        )
        .await?;
        projects.insert(id, pipeline.clone());
        Ok(pipeline)
    }

    /// Open an existing project.
    ///
    /// A project whose record says it is running, but whose lock is free,
    /// was interrupted. It is recorded as paused before we hand it out. If
    /// another process holds the lock, the record is left alone.
    #[instrument(level = "debug", skip(self))]
    pub async fn open(&self, id: &str) -> Result<ProjectPipeline, PipelineError> {
        let mut projects = self.projects.lock().await;
        if let Some(pipeline) = projects.get(id) {
            return Ok(pipeline.clone());
        }

        let paths = ProjectPaths::new(&self.root, id);
        let Some(mut project) = Project::load(&paths).await? else {
            return Err(PipelineError::config(format!(
                "no project {:?} in {:?}",
                id,
                self.root.display()
            )));
        };
        if project.status.is_running() {
            match ProjectLock::try_acquire(&paths).await? {
                Some(_lock) => {
                    if project.recover_interrupted() {
                        warn!(project = %id, "Project was interrupted; marking it paused");
                        project.save(&paths).await?;
                    }
                }
                None => info!(project = %id, "Project is running in another process"),
            }
        }

        let pipeline = ProjectPipeline::new(
            project,
            paths,
            self.config.clone(),
            self.engines.clone(),
            None,
        )
        .await?;
        projects.insert(id.to_owned(), pipeline.clone());
        Ok(pipeline)
    }

    /// Get a project we've already opened.
    #[cfg(test)]
    pub async fn get(&self, id: &str) -> Option<ProjectPipeline> {
        self.projects.lock().await.get(id).cloned()
    }
}
