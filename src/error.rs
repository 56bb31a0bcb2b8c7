// src/error.rs
//! Error taxonomy for the video pipeline.
//!
//! Stage-level failures (`StageError`) are retried by the scene controller and
//! end up in the run summary. Run-level failures (`PipelineError`) abort the run.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::StageKind;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error returned by an external collaborator (model client, renderer, TTS...).
#[derive(Error, Debug, Clone)]
pub enum CollaboratorError {
    /// API or transport failure. Always worth another attempt.
    #[error("model error: {0}")]
    Model(String),

    /// The collaborator answered, but the answer could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// A local tool (manim, ffmpeg) exited unsuccessfully or could not start.
    #[error("process error: {0}")]
    Process(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CollaboratorError {
    fn from(e: std::io::Error) -> Self {
        CollaboratorError::Io(e.to_string())
    }
}

/// Failure of a single stage invocation, as seen by the scene controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("transient failure in {stage}: {message}")]
    TransientFailure { stage: StageKind, message: String },

    #[error("validation failure in {stage}: {message}")]
    ValidationFailure { stage: StageKind, message: String },

    #[error("{stage} cancelled")]
    Cancelled { stage: StageKind },
}

impl StageError {
    pub fn from_collaborator(stage: StageKind, err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Malformed(message) => StageError::ValidationFailure { stage, message },
            other => StageError::TransientFailure {
                stage,
                message: other.to_string(),
            },
        }
    }

    pub fn stage(&self) -> StageKind {
        match self {
            StageError::TransientFailure { stage, .. }
            | StageError::ValidationFailure { stage, .. }
            | StageError::Cancelled { stage } => *stage,
        }
    }

    pub fn message(&self) -> String {
        match self {
            StageError::TransientFailure { message, .. }
            | StageError::ValidationFailure { message, .. } => message.clone(),
            StageError::Cancelled { .. } => "cancelled".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled { .. })
    }
}

/// A stored cache artifact could not be read back. Never fatal: the cache
/// reports a miss and the stage regenerates.
#[derive(Error, Debug)]
#[error("cache entry {fingerprint} is corrupt: {reason}")]
pub struct CacheCorruption {
    pub fingerprint: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid problem statement: {0}")]
    InvalidProblem(String),

    #[error("scene plan is unusable: {0}")]
    MalformedPlan(String),

    #[error("{stage} stage failed: {reason}")]
    StageFailed { stage: StageKind, reason: String },

    #[error("pipeline incomplete: scene {scene_index} is {status}")]
    IncompletePipeline { scene_index: u32, status: String },

    #[error("no scene reached the synced state")]
    NoScenesSynced,

    #[error("run cancelled")]
    Cancelled,

    #[error("artifact not found at `{0}`")]
    NotFound(PathBuf),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Lift a run-level stage failure (solve, split, stitch) into a run error.
    pub fn from_stage(err: StageError) -> Self {
        match err {
            StageError::Cancelled { .. } => PipelineError::Cancelled,
            StageError::ValidationFailure {
                stage: StageKind::Split,
                message,
            } => PipelineError::MalformedPlan(message),
            other => PipelineError::StageFailed {
                stage: other.stage(),
                reason: other.message(),
            },
        }
    }

    /// Exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Cancelled => 130,
            PipelineError::Config(_) | PipelineError::InvalidProblem(_) => 2,
            _ => 1,
        }
    }
}
