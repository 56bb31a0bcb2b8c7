// types.rs - Data records exchanged between pipeline stages
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("static regex");
    static ref SCENE_CLASS: Regex =
        Regex::new(r"(?m)^\s*class\s+(\w+)\s*\(\s*(?:\w+\.)?(\w*Scene)\s*\)\s*:").expect("static regex");
    static ref CONSTRUCT_FN: Regex = Regex::new(r"(?m)^\s+def\s+construct\s*\(\s*self").expect("static regex");
}

pub const MIN_PROBLEM_CHARS: usize = 5;
pub const MAX_PROBLEM_CHARS: usize = 300;

/// Largest allowed gap between a plan's estimate and the sum of its elements.
const DURATION_TOLERANCE_SECS: f64 = 1.0;

/// One discrete transformation in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Solve,
    Split,
    ScriptPlan,
    CodeGen,
    Audio,
    Render,
    Sync,
    Stitch,
}

impl StageKind {
    pub const ALL: [StageKind; 8] = [
        StageKind::Solve,
        StageKind::Split,
        StageKind::ScriptPlan,
        StageKind::CodeGen,
        StageKind::Audio,
        StageKind::Render,
        StageKind::Sync,
        StageKind::Stitch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Solve => "solve",
            StageKind::Split => "split",
            StageKind::ScriptPlan => "script_plan",
            StageKind::CodeGen => "code_gen",
            StageKind::Audio => "audio",
            StageKind::Render => "render",
            StageKind::Sync => "sync",
            StageKind::Stitch => "stitch",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every artifact a stage can produce.
///
/// `validate` runs on a cache miss before the artifact is stored; an artifact
/// that fails it is never cached. `referenced_files` lists the files the
/// artifact points at: the cache keeps its own copy of each and restores
/// them on a hit.
pub trait StageOutput: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    fn referenced_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Immutable input of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemRequest {
    pub problem: String,
    pub output_root: PathBuf,
    pub cache_enabled: bool,
}

impl ProblemRequest {
    /// Collapses whitespace and enforces length bounds on the problem text.
    pub fn new(problem: &str, output_root: impl Into<PathBuf>, cache_enabled: bool) -> PipelineResult<Self> {
        let problem = collapse_whitespace(problem);
        let chars = problem.chars().count();
        if chars < MIN_PROBLEM_CHARS {
            return Err(PipelineError::InvalidProblem(format!(
                "problem must be at least {} characters",
                MIN_PROBLEM_CHARS
            )));
        }
        if chars > MAX_PROBLEM_CHARS {
            return Err(PipelineError::InvalidProblem(format!(
                "problem is too long ({} > {} characters), please simplify it",
                chars, MAX_PROBLEM_CHARS
            )));
        }

        Ok(Self {
            problem,
            output_root: output_root.into(),
            cache_enabled,
        })
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub text: String,
}

impl StageOutput for Solution {
    fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("solution text is empty".to_string());
        }
        Ok(())
    }
}

/// One entry of the ordered scene plan produced by the split stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenePlanEntry {
    pub index: u32,
    #[serde(alias = "goal", alias = "title")]
    pub description: String,
    #[serde(alias = "estimated_duration", alias = "duration_secs")]
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenePlan {
    pub scenes: Vec<ScenePlanEntry>,
}

impl ScenePlan {
    /// Accepts either a bare array of entries or an object with a `scenes` array.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let value = match value {
            Value::Array(_) => serde_json::json!({ "scenes": value }),
            other => other,
        };
        serde_json::from_value(value).map_err(|e| format!("scene plan does not match the expected shape: {}", e))
    }
}

impl StageOutput for ScenePlan {
    fn validate(&self) -> Result<(), String> {
        if self.scenes.is_empty() {
            return Err("scene plan has no scenes".to_string());
        }
        for (position, entry) in self.scenes.iter().enumerate() {
            let expected = position as u32 + 1;
            if entry.index != expected {
                return Err(format!(
                    "scene indices must be contiguous from 1: expected {} at position {}, found {}",
                    expected, position, entry.index
                ));
            }
            if entry.description.trim().is_empty() {
                return Err(format!("scene {} has an empty description", entry.index));
            }
            if !entry.duration.is_finite() || entry.duration <= 0.0 {
                return Err(format!("scene {} has invalid duration {}", entry.index, entry.duration));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualElement {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub animation: String,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_with_narration: Option<String>,
}

/// Typed animation plan for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationPlan {
    pub title: String,
    pub elements: Vec<VisualElement>,
    pub estimated_duration: f64,
}

impl AnimationPlan {
    pub fn elements_duration(&self) -> f64 {
        self.elements.iter().map(|e| e.duration).sum()
    }

    /// Replaces the estimate with the sum of element durations when the two disagree.
    pub fn reconcile_duration(&mut self) {
        let total = self.elements_duration();
        if (self.estimated_duration - total).abs() > DURATION_TOLERANCE_SECS {
            tracing::warn!(
                "Animation plan '{}' estimates {:.1}s but its elements sum to {:.1}s, using the sum",
                self.title,
                self.estimated_duration,
                total
            );
            self.estimated_duration = total;
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.elements.is_empty() {
            return Err("animation plan has no visual elements".to_string());
        }
        if let Some(bad) = self.elements.iter().find(|e| !e.duration.is_finite() || e.duration <= 0.0) {
            return Err(format!("visual element '{}' has invalid duration {}", bad.content, bad.duration));
        }
        Ok(())
    }
}

/// Raw output of the script+plan collaborator, before the typed boundary.
#[derive(Debug, Clone)]
pub struct RawScriptPlan {
    pub script: String,
    pub animation_plan: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptAndPlan {
    pub script: String,
    pub animation_plan: AnimationPlan,
}

impl ScriptAndPlan {
    pub fn from_raw(raw: RawScriptPlan) -> Result<Self, String> {
        let mut animation_plan: AnimationPlan = serde_json::from_value(raw.animation_plan)
            .map_err(|e| format!("animation plan does not match the expected shape: {}", e))?;
        animation_plan.reconcile_duration();
        Ok(Self {
            script: raw.script.trim().to_string(),
            animation_plan,
        })
    }
}

impl StageOutput for ScriptAndPlan {
    fn validate(&self) -> Result<(), String> {
        if self.script.is_empty() {
            return Err("narration script is empty".to_string());
        }
        self.animation_plan.validate()
    }
}

/// Generated Manim source for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub code: String,
}

impl GeneratedCode {
    /// Strips a surrounding markdown fence if the model added one.
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        let code = match trimmed.strip_prefix("```") {
            Some(rest) => {
                let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
                body.trim_end().trim_end_matches("```").trim_end().to_string()
            }
            None => trimmed.to_string(),
        };
        Self { code }
    }

    /// Name of the first Manim scene class in the code.
    pub fn scene_class(&self) -> Option<&str> {
        SCENE_CLASS
            .captures(&self.code)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }
}

impl StageOutput for GeneratedCode {
    fn validate(&self) -> Result<(), String> {
        if self.code.trim().is_empty() {
            return Err("generated code is empty".to_string());
        }
        if self.scene_class().is_none() {
            return Err("generated code does not define a Manim Scene subclass (expected `class Name(Scene):`)".to_string());
        }
        if !CONSTRUCT_FN.is_match(&self.code) {
            return Err("generated scene class has no `def construct(self)` method".to_string());
        }
        Ok(())
    }
}

/// Audio or video file produced by a media stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaArtifact {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl MediaArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            duration_secs: None,
        }
    }

    pub fn with_duration(mut self, duration_secs: f64) -> Self {
        self.duration_secs = Some(duration_secs);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StageOutput for MediaArtifact {
    fn validate(&self) -> Result<(), String> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            Ok(_) => Err(format!("media file `{}` is empty", self.path.display())),
            Err(e) => Err(format!("media file `{}` is missing: {}", self.path.display(), e)),
        }
    }

    fn referenced_files(&self) -> Vec<PathBuf> {
        vec![self.path.clone()]
    }
}

/// The stitched result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalVideo {
    pub path: PathBuf,
    /// Scene indices in stitch order.
    pub scenes: Vec<u32>,
    /// Synced scene videos in stitch order.
    pub sources: Vec<PathBuf>,
    /// Scenes left out under the partial assembly policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn problem_text_is_normalized_and_bounded() {
        let req = ProblemRequest::new("  Solve   x^2 - 5x + 6 = 0\n", "out", true).unwrap();
        assert_eq!(req.problem, "Solve x^2 - 5x + 6 = 0");

        assert!(matches!(ProblemRequest::new("x=1", "out", true), Err(PipelineError::InvalidProblem(_))));
        let long = "a".repeat(MAX_PROBLEM_CHARS + 1);
        assert!(matches!(ProblemRequest::new(&long, "out", true), Err(PipelineError::InvalidProblem(_))));
    }

    #[test]
    fn scene_plan_requires_contiguous_indices() {
        let plan = ScenePlan::from_value(json!([
            { "index": 1, "description": "Introduce the equation", "duration": 10.0 },
            { "index": 3, "description": "Factor", "duration": 12.0 }
        ]))
        .unwrap();
        let err = plan.validate().unwrap_err();
        assert!(err.contains("contiguous"), "{}", err);

        let plan = ScenePlan::from_value(json!({ "scenes": [
            { "index": 1, "goal": "Introduce the equation", "estimated_duration": 10.0 }
        ]}))
        .unwrap();
        assert!(plan.validate().is_ok());
        assert_eq!(plan.scenes[0].description, "Introduce the equation");
    }

    #[test]
    fn scene_plan_rejects_wrong_shape() {
        assert!(ScenePlan::from_value(json!({ "steps": "none" })).is_err());
        let empty = ScenePlan::from_value(json!([])).unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn animation_plan_duration_is_reconciled() {
        let raw = RawScriptPlan {
            script: " Factor the quadratic. ".into(),
            animation_plan: json!({
                "title": "Factoring",
                "estimated_duration": 30.0,
                "elements": [
                    { "type": "equation", "content": "x^2-5x+6", "animation": "Write", "duration": 4.0 },
                    { "type": "equation", "content": "(x-2)(x-3)", "animation": "Transform", "duration": 6.0 }
                ]
            }),
        };
        let parsed = ScriptAndPlan::from_raw(raw).unwrap();
        assert_eq!(parsed.script, "Factor the quadratic.");
        assert_eq!(parsed.animation_plan.estimated_duration, 10.0);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn animation_plan_missing_fields_fails_at_boundary() {
        let raw = RawScriptPlan {
            script: "text".into(),
            animation_plan: json!({ "title": "No elements" }),
        };
        assert!(ScriptAndPlan::from_raw(raw).is_err());
    }

    #[test]
    fn generated_code_validation() {
        let good = GeneratedCode::new(
            "```python\nfrom manim import *\n\nclass QuadraticScene(Scene):\n    def construct(self):\n        self.play(Write(MathTex(\"x^2\")))\n```",
        );
        assert!(good.validate().is_ok());
        assert_eq!(good.scene_class(), Some("QuadraticScene"));
        assert!(good.code.starts_with("from manim import"));

        let no_class = GeneratedCode::new("print('hello')");
        assert!(no_class.validate().unwrap_err().contains("Scene subclass"));

        let no_construct = GeneratedCode::new("class A(Scene):\n    pass\n");
        assert!(no_construct.validate().unwrap_err().contains("construct"));

        assert!(GeneratedCode::new("   ").validate().is_err());
    }

    #[test]
    fn media_artifact_requires_non_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.mp3");
        let artifact = MediaArtifact::new(&path);
        assert!(artifact.validate().is_err());

        std::fs::write(&path, b"ID3").unwrap();
        assert!(artifact.validate().is_ok());
        assert_eq!(artifact.referenced_files(), vec![path]);
    }
}
