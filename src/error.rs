//! Error types for the page pipeline.
//!
//! Plumbing code (the CLI, engine adapters, the rasterizer) uses
//! [`anyhow::Error`]. The pipeline itself needs to tell different kinds of
//! failure apart, because they have very different consequences: an engine
//! failure costs us one page, but a storage failure means we can no longer
//! promise that a resumed run will see what we think we wrote.

use std::{fmt, io, time::Duration};

use schemars::JsonSchema;
use thiserror::Error;

use crate::{
    prelude::*,
    project::{ProjectStatus, Stage},
};

/// An external engine (rasterizer, OCR, translator) failed on a page.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine did not answer within the per-page timeout.
    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),

    /// The engine reported an error.
    #[error("engine call failed: {0:#}")]
    Failed(anyhow::Error),

    /// The page had no usable input, so the engine was never called.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// We stopped retrying because the run is pausing or cancelling. The page
    /// is left unrecorded.
    #[error("interrupted before the engine call could be retried")]
    Interrupted,
}

/// Reading or writing the page cache or project metadata failed.
#[derive(Debug, Error)]
#[error("could not {action} {path:?}: {source}")]
pub struct StorageError {
    /// What we were trying to do, phrased as a verb ("write", "list", ...).
    pub action: &'static str,

    /// The file or directory involved.
    pub path: PathBuf,

    /// The underlying I/O error.
    #[source]
    pub source: io::Error,
}

impl StorageError {
    /// Build a new [`StorageError`].
    pub fn new(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Errors reported by pipeline commands.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An engine failure that the failure policy could not absorb.
    #[error("{stage} of page {index} failed: {source}")]
    Engine {
        stage: Stage,
        index: usize,
        #[source]
        source: EngineError,
    },

    /// The page cache or project record could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The command is not valid in the project's current state.
    #[error("cannot {op} project {project:?} while it is {status}")]
    StateConflict {
        op: &'static str,
        project: String,
        status: ProjectStatus,
    },

    /// Bad configuration or inputs, detected before any processing.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Which kind of error is this?
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Engine { .. } => ErrorKind::Engine,
            PipelineError::Storage(_) => ErrorKind::Storage,
            PipelineError::StateConflict { .. } => ErrorKind::StateConflict,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Shorthand for building a [`PipelineError::Config`].
    pub fn config(msg: impl fmt::Display) -> Self {
        PipelineError::Config(msg.to_string())
    }
}

/// The coarse kind of a [`PipelineError`], for the project record and for
/// progress subscribers.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Engine,
    Storage,
    StateConflict,
    Config,
}

/// The most recent error that moved a project to `failed`.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// What kind of error was it?
    pub kind: ErrorKind,

    /// A human-readable description.
    pub message: String,
}

impl From<&PipelineError> for LastError {
    fn from(err: &PipelineError) -> Self {
        LastError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
