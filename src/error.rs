use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the pipeline stages, the job queue and the status lookup.
///
/// Stage errors (`Extraction`, `NoFrames`, `Detector`, `TrackingInput`,
/// `Blob`, `Cancelled`, `Workspace`, `Panicked`) end the current job as
/// `failed`. `Queue` errors are
/// retried by the runner with backoff.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("no frames found in {}", .0.display())]
    NoFrames(PathBuf),
    #[error("detector failed on {frame}: {message}")]
    Detector { frame: String, message: String },
    #[error("malformed detection map: {0}")]
    TrackingInput(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("queue error: {0}")]
    Queue(String),
    #[error("blob store: {0}")]
    Blob(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("job workspace: {0}")]
    Workspace(String),
    #[error("stage panicked: {0}")]
    Panicked(String),
}

impl PipelineError {
    /// Transport-level failures are retried; everything else is terminal for the job.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Queue(_))
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Queue(err.to_string())
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
