// ScenePipeline - Drives every scene from Planned to a terminal state
use futures::stream::{self, StreamExt};
use tracing::{error, info, info_span, Instrument};

use super::executor::StageExecutor;
use super::retry::run_with_retry;
use super::state::{Scene, SceneStatus, TransitionError};
use crate::artifacts::{ArtifactLocation, ArtifactStore};
use crate::cache::{Fingerprint, FingerprintInput};
use crate::collaborators::Collaborators;
use crate::config::{PipelineConfig, RetryPolicy, VoiceConfig};
use crate::error::{CollaboratorError, PipelineError, StageError};
use crate::types::{
    AnimationPlan, GeneratedCode, MediaArtifact, ScenePlan, ScenePlanEntry, ScriptAndPlan, Solution, StageKind,
};

/// Runs scene pipelines with bounded parallelism. Stages within one scene
/// run strictly in order; a scene that exhausts its retries ends `Failed`
/// without affecting its siblings.
pub struct ScenePipelineController {
    executor: StageExecutor,
    store: ArtifactStore,
    collaborators: Collaborators,
    retry: RetryPolicy,
    voice: VoiceConfig,
    max_parallel: usize,
}

impl ScenePipelineController {
    pub fn new(executor: StageExecutor, store: ArtifactStore, collaborators: Collaborators, config: &PipelineConfig) -> Self {
        Self {
            executor,
            store,
            collaborators,
            retry: config.retry.clone(),
            voice: config.voice.clone(),
            max_parallel: config.max_parallel_scenes.max(1),
        }
    }

    /// Runs every scene of the plan. The result is in scene index order
    /// regardless of completion order, and every scene is terminal.
    pub async fn run_all(&self, plan: &ScenePlan, solution: &Solution) -> Vec<Scene> {
        info!("🎬 Processing {} scenes ({} in parallel)", plan.scenes.len(), self.max_parallel);

        let scenes: Vec<Scene> = stream::iter(plan.scenes.iter().cloned())
            .map(|entry| self.run_scene(entry, solution))
            .buffered(self.max_parallel)
            .collect()
            .await;

        let cancelled = self.executor.cancel_token().is_cancelled();
        for scene in &scenes {
            if let SceneStatus::Failed { stage, reason } = &scene.status {
                if cancelled {
                    info!("🛑 Scene {} cancelled during {}", scene.index, stage);
                } else {
                    error!("❌ Scene {} failed at {}: {}", scene.index, stage, reason);
                }
            }
        }
        scenes
    }

    pub async fn run_scene(&self, entry: ScenePlanEntry, solution: &Solution) -> Scene {
        let span = info_span!("scene", scene = entry.index);
        async move {
            let mut scene = Scene::new(entry);
            info!("▶️ Scene {}: {}", scene.index, scene.plan.description);

            match self.drive(&mut scene, solution).await {
                Ok(()) => info!("✅ Scene {} synced", scene.index),
                Err(e) => scene.fail(e.stage(), e.message()),
            }
            scene
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, scene: &mut Scene, solution: &Solution) -> Result<(), StageError> {
        let index = scene.index;
        let label = format!("scene {}", index);
        let cancel = self.executor.cancel_token();

        // Script + animation plan
        expect_next(scene, StageKind::ScriptPlan)?;
        let planner = self.collaborators.script_planner.as_ref();
        let fp = FingerprintInput::new(StageKind::ScriptPlan)
            .number("scene_index", index as u64)
            .value("scene", &scene.plan)
            .prose("solution", &solution.text)
            .collaborator(&planner.identity())
            .finish();
        let entry = &scene.plan;
        let script_and_plan: ScriptAndPlan = run_with_retry(&self.retry, cancel, StageKind::ScriptPlan, &label, |_| {
            let fp = &fp;
            async move {
                self.executor
                    .execute(StageKind::ScriptPlan, fp, || async move {
                        planner
                            .generate_script_and_plan(entry, &solution.text)
                            .await
                            .and_then(|raw| ScriptAndPlan::from_raw(raw).map_err(CollaboratorError::Malformed))
                    })
                    .await
            }
        })
        .await?;
        self.write_text(StageKind::ScriptPlan, ArtifactLocation::SceneScript(index), &script_and_plan.script)
            .await?;
        self.write_json(
            StageKind::ScriptPlan,
            ArtifactLocation::SceneAnimationPlan(index),
            &script_and_plan.animation_plan,
        )
        .await?;
        scene
            .record_script(script_and_plan, fp)
            .map_err(|e| transition_failure(StageKind::ScriptPlan, e))?;

        // Code generation, with corrective feedback on invalid output
        expect_next(scene, StageKind::CodeGen)?;
        let (script, plan) = scene_script(scene)?;
        let generator = self.collaborators.code_generator.as_ref();
        let fp = FingerprintInput::new(StageKind::CodeGen)
            .number("scene_index", index as u64)
            .text("script", script)
            .value("animation_plan", plan)
            .collaborator(&generator.identity())
            .finish();
        let code: GeneratedCode = run_with_retry(&self.retry, cancel, StageKind::CodeGen, &label, |attempt| {
            let fp = &fp;
            async move {
                self.executor
                    .execute(StageKind::CodeGen, fp, || async move {
                        generator
                            .generate_code(plan, script, attempt.prior_error.as_deref())
                            .await
                            .map(|raw| GeneratedCode::new(&raw))
                    })
                    .await
            }
        })
        .await?;
        self.write_text(StageKind::CodeGen, ArtifactLocation::SceneCode(index), &code.code)
            .await?;
        scene
            .record_code(code, fp)
            .map_err(|e| transition_failure(StageKind::CodeGen, e))?;

        // Narration audio
        expect_next(scene, StageKind::Audio)?;
        let (script, _) = scene_script(scene)?;
        let synthesizer = self.collaborators.synthesizer.as_ref();
        let voice = &self.voice;
        let output = self.prepare(StageKind::Audio, ArtifactLocation::SceneAudio(index)).await?;
        let fp = FingerprintInput::new(StageKind::Audio)
            .number("scene_index", index as u64)
            .prose("script", script)
            .value("voice", voice)
            .collaborator(&synthesizer.identity())
            .finish();
        let audio: MediaArtifact = run_with_retry(&self.retry, cancel, StageKind::Audio, &label, |_| {
            let (fp, output) = (&fp, &output);
            async move {
                self.executor
                    .execute(StageKind::Audio, fp, || synthesizer.synthesize(script, voice, output))
                    .await
            }
        })
        .await?;
        scene
            .record_audio(audio, fp)
            .map_err(|e| transition_failure(StageKind::Audio, e))?;

        // Render
        expect_next(scene, StageKind::Render)?;
        let code = scene
            .code
            .as_ref()
            .map(|c| c.code.as_str())
            .ok_or_else(|| missing_input(StageKind::Render, "generated code"))?;
        let renderer = self.collaborators.renderer.as_ref();
        let output = self.prepare(StageKind::Render, ArtifactLocation::SceneRender(index)).await?;
        let fp = FingerprintInput::new(StageKind::Render)
            .number("scene_index", index as u64)
            .text("code", code)
            .collaborator(&renderer.identity())
            .finish();
        let rendered: MediaArtifact = run_with_retry(&self.retry, cancel, StageKind::Render, &label, |_| {
            let (fp, output) = (&fp, &output);
            async move {
                self.executor
                    .execute(StageKind::Render, fp, || renderer.render(code, output))
                    .await
            }
        })
        .await?;
        scene
            .record_render(rendered, fp)
            .map_err(|e| transition_failure(StageKind::Render, e))?;

        // Sync narration onto the rendered video
        expect_next(scene, StageKind::Sync)?;
        let (video, audio) = match (&scene.rendered, &scene.audio) {
            (Some(video), Some(audio)) => (video, audio),
            _ => return Err(missing_input(StageKind::Sync, "rendered video and audio")),
        };
        let output = self.prepare(StageKind::Sync, ArtifactLocation::SceneSynced(index)).await?;
        let fp = FingerprintInput::new(StageKind::Sync)
            .upstream("render", upstream(scene, StageKind::Render)?)
            .upstream("audio", upstream(scene, StageKind::Audio)?)
            .collaborator(&renderer.identity())
            .finish();
        let synced: MediaArtifact = run_with_retry(&self.retry, cancel, StageKind::Sync, &label, |_| {
            let (fp, output) = (&fp, &output);
            async move {
                self.executor
                    .execute(StageKind::Sync, fp, || renderer.sync(video, audio, output))
                    .await
            }
        })
        .await?;
        scene
            .record_sync(synced, fp)
            .map_err(|e| transition_failure(StageKind::Sync, e))?;

        Ok(())
    }

    async fn prepare(&self, stage: StageKind, location: ArtifactLocation) -> Result<std::path::PathBuf, StageError> {
        self.store.prepare(&location).await.map_err(|e| io_failure(stage, e))
    }

    async fn write_text(&self, stage: StageKind, location: ArtifactLocation, text: &str) -> Result<(), StageError> {
        self.store
            .write(&location, text)
            .await
            .map(|_| ())
            .map_err(|e| io_failure(stage, e))
    }

    async fn write_json<T: serde::Serialize>(
        &self,
        stage: StageKind,
        location: ArtifactLocation,
        value: &T,
    ) -> Result<(), StageError> {
        self.store
            .write_json(&location, value)
            .await
            .map(|_| ())
            .map_err(|e| io_failure(stage, e))
    }
}

/// Stages run only in state-machine order.
fn expect_next(scene: &Scene, stage: StageKind) -> Result<(), StageError> {
    match scene.status.next_stage() {
        Some(next) if next == stage => Ok(()),
        _ => Err(StageError::ValidationFailure {
            stage,
            message: format!("scene {} is {}, not ready for {}", scene.index, scene.status, stage),
        }),
    }
}

fn scene_script(scene: &Scene) -> Result<(&str, &AnimationPlan), StageError> {
    match (&scene.script, &scene.animation_plan) {
        (Some(script), Some(plan)) => Ok((script.as_str(), plan)),
        _ => Err(missing_input(StageKind::CodeGen, "script and animation plan")),
    }
}

fn upstream(scene: &Scene, stage: StageKind) -> Result<&Fingerprint, StageError> {
    scene
        .fingerprints
        .get(&stage)
        .ok_or_else(|| missing_input(StageKind::Sync, stage.as_str()))
}

fn missing_input(stage: StageKind, what: &str) -> StageError {
    StageError::ValidationFailure {
        stage,
        message: format!("{} missing from scene record", what),
    }
}

fn transition_failure(stage: StageKind, e: TransitionError) -> StageError {
    StageError::ValidationFailure {
        stage,
        message: e.to_string(),
    }
}

fn io_failure(stage: StageKind, e: PipelineError) -> StageError {
    StageError::TransientFailure {
        stage,
        message: format!("artifact store: {}", e),
    }
}
