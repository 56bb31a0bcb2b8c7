// Shared in-memory collaborators for the pipeline integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use manim_video_agent::collaborators::{
    CodeGenerator, CollaboratorResult, ProblemSolver, SceneRenderer, SceneSplitter, ScriptPlanner, SpeechSynthesizer,
    VideoStitcher,
};
use manim_video_agent::{
    AnimationPlan, CollaboratorError, Collaborators, MediaArtifact, PipelineConfig, RawScriptPlan, RetryPolicy,
    ScenePlanEntry, VoiceConfig,
};

pub const PROBLEM: &str = "Solve x^2 - 5x + 6 = 0";

pub fn test_config(output_root: &Path) -> PipelineConfig {
    PipelineConfig {
        output_root: output_root.to_path_buf(),
        retry: RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..RetryPolicy::default()
        },
        ..PipelineConfig::default()
    }
}

pub fn three_scene_plan() -> Value {
    json!([
        { "index": 1, "description": "State the quadratic", "duration": 8 },
        { "index": 2, "description": "Factor into (x - 2)(x - 3)", "duration": 12 },
        { "index": 3, "description": "Read off the roots", "duration": 10 }
    ])
}

#[derive(Default)]
pub struct MockSolver {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ProblemSolver for MockSolver {
    fn identity(&self) -> String {
        "mock-solver".into()
    }

    async fn solve(&self, problem: &str) -> CollaboratorResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}\nFactor: (x - 2)(x - 3) = 0\nSo x = 2 or x = 3.", problem))
    }
}

pub struct MockSplitter {
    pub calls: AtomicUsize,
    pub plan: Value,
}

impl Default for MockSplitter {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            plan: three_scene_plan(),
        }
    }
}

#[async_trait]
impl SceneSplitter for MockSplitter {
    fn identity(&self) -> String {
        "mock-splitter".into()
    }

    async fn split(&self, _solution: &str) -> CollaboratorResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.plan.clone())
    }
}

#[derive(Default)]
pub struct MockScriptPlanner {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ScriptPlanner for MockScriptPlanner {
    fn identity(&self) -> String {
        "mock-script-planner".into()
    }

    async fn generate_script_and_plan(&self, entry: &ScenePlanEntry, _solution: &str) -> CollaboratorResult<RawScriptPlan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RawScriptPlan {
            script: format!("Narration for scene {}: {}", entry.index, entry.description),
            animation_plan: json!({
                "title": entry.description,
                "estimated_duration": entry.duration,
                "elements": [
                    { "type": "equation", "content": "x^2 - 5x + 6 = 0", "animation": "Write", "duration": entry.duration }
                ]
            }),
        })
    }
}

/// Emits `class Scene{n}Animation(Scene)` where `n` comes from the plan title order.
#[derive(Default)]
pub struct MockCodeGenerator {
    pub calls: AtomicUsize,
    /// Return code without a Scene class unless the previous attempt's error is supplied.
    pub invalid_until_corrected: bool,
    pub prior_errors: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl CodeGenerator for MockCodeGenerator {
    fn identity(&self) -> String {
        "mock-codegen".into()
    }

    async fn generate_code(&self, plan: &AnimationPlan, script: &str, prior_error: Option<&str>) -> CollaboratorResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prior_errors.lock().unwrap().push(prior_error.map(str::to_string));

        if self.invalid_until_corrected && prior_error.is_none() {
            return Ok("print('forgot the scene class')".into());
        }

        let scene = scene_number(script);
        Ok(format!(
            "```python\nfrom manim import *\n\nclass Scene{}Animation(Scene):\n    def construct(self):\n        self.play(Write(Text(\"{}\")))\n```",
            scene, plan.title
        ))
    }
}

#[derive(Default)]
pub struct MockSynthesizer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    fn identity(&self) -> String {
        "mock-tts".into()
    }

    async fn synthesize(&self, script: &str, voice: &VoiceConfig, output: &Path) -> CollaboratorResult<MediaArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(output, format!("audio[{}|{}]", voice.voice, script)).await?;
        Ok(MediaArtifact::new(output).with_duration(5.0))
    }
}

#[derive(Default)]
pub struct MockRenderer {
    pub render_calls: AtomicUsize,
    pub sync_calls: AtomicUsize,
    /// Renders of code containing this marker always fail.
    pub fail_marker: Option<String>,
    /// Each render waits this long first.
    pub delay: Option<Duration>,
}

#[async_trait]
impl SceneRenderer for MockRenderer {
    fn identity(&self) -> String {
        "mock-renderer".into()
    }

    async fn render(&self, code: &str, output: &Path) -> CollaboratorResult<MediaArtifact> {
        self.render_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(marker) = &self.fail_marker {
            if code.contains(marker.as_str()) {
                return Err(CollaboratorError::Process("manim exited with status 1".into()));
            }
        }
        tokio::fs::write(output, format!("video[{}]", code.len())).await?;
        Ok(MediaArtifact::new(output))
    }

    async fn sync(&self, video: &MediaArtifact, audio: &MediaArtifact, output: &Path) -> CollaboratorResult<MediaArtifact> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        let mut body = tokio::fs::read(&video.path).await?;
        body.extend(tokio::fs::read(&audio.path).await?);
        tokio::fs::write(output, body).await?;
        Ok(MediaArtifact::new(output))
    }
}

#[derive(Default)]
pub struct MockStitcher {
    pub calls: AtomicUsize,
    pub received: Mutex<Vec<Vec<std::path::PathBuf>>>,
}

#[async_trait]
impl VideoStitcher for MockStitcher {
    fn identity(&self) -> String {
        "mock-stitcher".into()
    }

    async fn stitch(&self, videos: &[MediaArtifact], output: &Path) -> CollaboratorResult<MediaArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received
            .lock()
            .unwrap()
            .push(videos.iter().map(|v| v.path.clone()).collect());
        let mut body = Vec::new();
        for video in videos {
            body.extend(tokio::fs::read(&video.path).await?);
            body.push(b'\n');
        }
        tokio::fs::write(output, body).await?;
        Ok(MediaArtifact::new(output))
    }
}

/// One of each mock, shared with the pipeline through `collaborators()`.
#[derive(Default, Clone)]
pub struct Mocks {
    pub solver: Arc<MockSolver>,
    pub splitter: Arc<MockSplitter>,
    pub script_planner: Arc<MockScriptPlanner>,
    pub code_generator: Arc<MockCodeGenerator>,
    pub synthesizer: Arc<MockSynthesizer>,
    pub renderer: Arc<MockRenderer>,
    pub stitcher: Arc<MockStitcher>,
}

impl Mocks {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            solver: self.solver.clone(),
            splitter: self.splitter.clone(),
            script_planner: self.script_planner.clone(),
            code_generator: self.code_generator.clone(),
            synthesizer: self.synthesizer.clone(),
            renderer: self.renderer.clone(),
            stitcher: self.stitcher.clone(),
        }
    }

    pub fn total_calls(&self) -> usize {
        [
            self.solver.calls.load(Ordering::SeqCst),
            self.splitter.calls.load(Ordering::SeqCst),
            self.script_planner.calls.load(Ordering::SeqCst),
            self.code_generator.calls.load(Ordering::SeqCst),
            self.synthesizer.calls.load(Ordering::SeqCst),
            self.renderer.render_calls.load(Ordering::SeqCst),
            self.renderer.sync_calls.load(Ordering::SeqCst),
            self.stitcher.calls.load(Ordering::SeqCst),
        ]
        .iter()
        .sum()
    }
}

fn scene_number(script: &str) -> u32 {
    script
        .strip_prefix("Narration for scene ")
        .and_then(|rest| rest.split(':').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
