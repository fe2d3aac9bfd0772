//! Error taxonomy for the translation pipeline.
//!
//! Every failure a run can hit maps onto one [`PipelineError`] variant. The
//! variant decides whether the Run Controller halts ([`PipelineError::is_fatal`])
//! and whether re-invoking the run from saved progress is expected to help
//! ([`PipelineError::is_resumable`]).

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The uploaded table could not be parsed.
    #[error("Failed to parse input table: {0}")]
    Parse(String),

    /// A translate/refine response did not match the rows that were sent.
    #[error("{stage} response does not match request: {message}")]
    SchemaMismatch { stage: String, message: String },

    /// The spell-check response array is not aligned with the request array.
    #[error("Spell check returned {actual} result(s) for {expected} row(s)")]
    LengthMismatch { expected: usize, actual: usize },

    /// The collaborator was unreachable, returned an error status, or timed out.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// A polled collaborator job reached a non-successful terminal state.
    #[error("Collaborator job {id} ended with status '{status}'")]
    JobFailed { id: String, status: String },

    /// Missing credential, missing column selection, or invalid settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn schema_mismatch(stage: &str, message: impl Into<String>) -> Self {
        PipelineError::SchemaMismatch {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Parse(_) => ErrorKind::Parse,
            PipelineError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            PipelineError::LengthMismatch { .. } => ErrorKind::LengthMismatch,
            PipelineError::Transport(_) | PipelineError::JobFailed { .. } => {
                ErrorKind::TransportFailure
            }
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::LengthMismatch { .. })
    }

    /// Pre-run errors cannot be fixed by resuming; everything else can.
    pub fn is_resumable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Parse(_) | PipelineError::Configuration(_)
        )
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::Transport(format!("request timed out: {err}"))
        } else {
            PipelineError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Parse,
    SchemaMismatch,
    LengthMismatch,
    TransportFailure,
    Configuration,
    Cancelled,
}

/// Serializable summary of a failure carried by a terminal `RunState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Zero-based offset of the batch that failed, when the failure happened mid-run.
    pub batch_offset: Option<usize>,
    pub resumable: bool,
}

impl ErrorInfo {
    pub fn from_error(err: &PipelineError, batch_offset: Option<usize>) -> Self {
        ErrorInfo {
            kind: err.kind(),
            message: err.to_string(),
            batch_offset,
            resumable: err.is_resumable(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
