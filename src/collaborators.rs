// collaborators.rs - Seams to the external generation and media tools
//
// Every collaborator reports an `identity()` (model id, voice engine,
// renderer settings). It is part of each stage fingerprint, so switching a
// model or renderer never serves artifacts produced by the previous one.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::config::VoiceConfig;
use crate::error::CollaboratorError;
use crate::types::{AnimationPlan, MediaArtifact, RawScriptPlan, ScenePlanEntry};

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

#[async_trait]
pub trait ProblemSolver: Send + Sync {
    fn identity(&self) -> String;

    async fn solve(&self, problem: &str) -> CollaboratorResult<String>;
}

#[async_trait]
pub trait SceneSplitter: Send + Sync {
    fn identity(&self) -> String;

    /// Ordered scene plan as loosely-typed JSON; the executor types and validates it.
    async fn split(&self, solution: &str) -> CollaboratorResult<Value>;
}

#[async_trait]
pub trait ScriptPlanner: Send + Sync {
    fn identity(&self) -> String;

    async fn generate_script_and_plan(&self, entry: &ScenePlanEntry, solution: &str) -> CollaboratorResult<RawScriptPlan>;
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    fn identity(&self) -> String;

    /// `prior_error` carries the validation failure of the previous attempt, if any.
    async fn generate_code(
        &self,
        plan: &AnimationPlan,
        script: &str,
        prior_error: Option<&str>,
    ) -> CollaboratorResult<String>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn identity(&self) -> String;

    async fn synthesize(&self, script: &str, voice: &VoiceConfig, output: &Path) -> CollaboratorResult<MediaArtifact>;
}

#[async_trait]
pub trait SceneRenderer: Send + Sync {
    fn identity(&self) -> String;

    async fn render(&self, code: &str, output: &Path) -> CollaboratorResult<MediaArtifact>;

    /// Aligns the animation to the narration length and muxes the audio in.
    async fn sync(&self, video: &MediaArtifact, audio: &MediaArtifact, output: &Path) -> CollaboratorResult<MediaArtifact>;
}

#[async_trait]
pub trait VideoStitcher: Send + Sync {
    fn identity(&self) -> String;

    async fn stitch(&self, videos: &[MediaArtifact], output: &Path) -> CollaboratorResult<MediaArtifact>;
}

/// The full set of collaborators one run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub solver: Arc<dyn ProblemSolver>,
    pub splitter: Arc<dyn SceneSplitter>,
    pub script_planner: Arc<dyn ScriptPlanner>,
    pub code_generator: Arc<dyn CodeGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub renderer: Arc<dyn SceneRenderer>,
    pub stitcher: Arc<dyn VideoStitcher>,
}
