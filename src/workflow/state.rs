// SceneState - Per-scene state machine and the record it mutates
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::cache::Fingerprint;
use crate::types::{AnimationPlan, GeneratedCode, MediaArtifact, ScenePlanEntry, ScriptAndPlan, StageKind};

/// Scene status. Transitions are strictly forward, one step at a time;
/// `Synced` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SceneStatus {
    Planned,
    ScriptReady,
    CodeReady,
    AudioReady,
    Rendered,
    Synced,
    Failed { stage: StageKind, reason: String },
}

impl SceneStatus {
    /// Position on the success path; `None` for `Failed`.
    fn rank(&self) -> Option<u8> {
        match self {
            SceneStatus::Planned => Some(0),
            SceneStatus::ScriptReady => Some(1),
            SceneStatus::CodeReady => Some(2),
            SceneStatus::AudioReady => Some(3),
            SceneStatus::Rendered => Some(4),
            SceneStatus::Synced => Some(5),
            SceneStatus::Failed { .. } => None,
        }
    }

    /// The stage that moves a scene out of this status.
    pub fn next_stage(&self) -> Option<StageKind> {
        match self {
            SceneStatus::Planned => Some(StageKind::ScriptPlan),
            SceneStatus::ScriptReady => Some(StageKind::CodeGen),
            SceneStatus::CodeReady => Some(StageKind::Audio),
            SceneStatus::AudioReady => Some(StageKind::Render),
            SceneStatus::Rendered => Some(StageKind::Sync),
            SceneStatus::Synced | SceneStatus::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SceneStatus::Synced | SceneStatus::Failed { .. })
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, SceneStatus::Synced)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SceneStatus::Planned => "planned",
            SceneStatus::ScriptReady => "script_ready",
            SceneStatus::CodeReady => "code_ready",
            SceneStatus::AudioReady => "audio_ready",
            SceneStatus::Rendered => "rendered",
            SceneStatus::Synced => "synced",
            SceneStatus::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for SceneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneStatus::Failed { stage, reason } => write!(f, "failed at {}: {}", stage, reason),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("scene {scene}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub scene: u32,
    pub from: String,
    pub to: String,
}

/// Mutable per-scene record. Artifacts are filled in as the scene advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub index: u32,
    pub plan: ScenePlanEntry,
    pub status: SceneStatus,
    pub script: Option<String>,
    pub animation_plan: Option<AnimationPlan>,
    pub code: Option<GeneratedCode>,
    pub audio: Option<MediaArtifact>,
    pub rendered: Option<MediaArtifact>,
    pub synced: Option<MediaArtifact>,
    pub last_error: Option<String>,
    /// Fingerprint of each completed stage; downstream stages key on them.
    #[serde(default)]
    pub fingerprints: BTreeMap<StageKind, Fingerprint>,
}

impl Scene {
    pub fn new(plan: ScenePlanEntry) -> Self {
        Self {
            index: plan.index,
            plan,
            status: SceneStatus::Planned,
            script: None,
            animation_plan: None,
            code: None,
            audio: None,
            rendered: None,
            synced: None,
            last_error: None,
            fingerprints: BTreeMap::new(),
        }
    }

    fn advance(&mut self, to: SceneStatus) -> Result<(), TransitionError> {
        let allowed = match (self.status.rank(), to.rank()) {
            (Some(from), Some(next)) => next == from + 1,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError {
                scene: self.index,
                from: self.status.label().to_string(),
                to: to.label().to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn record_script(&mut self, output: ScriptAndPlan, fingerprint: Fingerprint) -> Result<(), TransitionError> {
        self.advance(SceneStatus::ScriptReady)?;
        self.script = Some(output.script);
        self.animation_plan = Some(output.animation_plan);
        self.fingerprints.insert(StageKind::ScriptPlan, fingerprint);
        Ok(())
    }

    pub fn record_code(&mut self, code: GeneratedCode, fingerprint: Fingerprint) -> Result<(), TransitionError> {
        self.advance(SceneStatus::CodeReady)?;
        self.code = Some(code);
        self.fingerprints.insert(StageKind::CodeGen, fingerprint);
        Ok(())
    }

    pub fn record_audio(&mut self, audio: MediaArtifact, fingerprint: Fingerprint) -> Result<(), TransitionError> {
        self.advance(SceneStatus::AudioReady)?;
        self.audio = Some(audio);
        self.fingerprints.insert(StageKind::Audio, fingerprint);
        Ok(())
    }

    pub fn record_render(&mut self, video: MediaArtifact, fingerprint: Fingerprint) -> Result<(), TransitionError> {
        self.advance(SceneStatus::Rendered)?;
        self.rendered = Some(video);
        self.fingerprints.insert(StageKind::Render, fingerprint);
        Ok(())
    }

    pub fn record_sync(&mut self, video: MediaArtifact, fingerprint: Fingerprint) -> Result<(), TransitionError> {
        self.advance(SceneStatus::Synced)?;
        self.synced = Some(video);
        self.fingerprints.insert(StageKind::Sync, fingerprint);
        Ok(())
    }

    /// Moves a non-terminal scene to `Failed`. Terminal scenes are left untouched.
    pub fn fail(&mut self, stage: StageKind, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let reason = reason.into();
        self.last_error = Some(reason.clone());
        self.status = SceneStatus::Failed { stage, reason };
    }

    pub fn summary(&self) -> SceneSummary {
        let (failed_stage, reason) = match &self.status {
            SceneStatus::Failed { stage, reason } => (Some(*stage), Some(reason.clone())),
            _ => (None, None),
        };
        SceneSummary {
            index: self.index,
            description: self.plan.description.clone(),
            status: self.status.label().to_string(),
            failed_stage,
            reason,
            synced_video: self.synced.as_ref().map(|v| v.path.clone()),
        }
    }
}

/// What the run reports for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSummary {
    pub index: u32,
    pub description: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_video: Option<PathBuf>,
}
