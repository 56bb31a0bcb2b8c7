// pipeline.rs - One run: solve, split, scenes, assembly
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactLocation, ArtifactStore};
use crate::cache::{CacheStore, FingerprintInput};
use crate::collaborators::Collaborators;
use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, PipelineError, PipelineResult};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::types::{FinalVideo, ProblemRequest, ScenePlan, Solution, StageKind};
use crate::workflow::{
    run_with_retry, AssemblyCoordinator, RunCheckpointer, RunPhase, RunSnapshot, Scene, ScenePipelineController,
    SceneSummary, StageExecutor,
};

/// Outcome of a run that got as far as assembly.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub final_video: FinalVideo,
    pub scenes: Vec<SceneSummary>,
    pub metrics: MetricsSnapshot,
}

pub struct VideoGenerationPipeline {
    config: PipelineConfig,
    collaborators: Collaborators,
}

impl VideoGenerationPipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        Self { config, collaborators }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, request: &ProblemRequest, cancel: CancellationToken) -> PipelineResult<RunReport> {
        let run_id = Uuid::new_v4();
        let store = ArtifactStore::new(&request.output_root);
        let metrics = Arc::new(StageMetrics::new());
        let cache = Arc::new(CacheStore::new(store.clone(), request.cache_enabled));
        let executor = StageExecutor::new(cache, metrics.clone(), cancel.clone());
        let checkpointer = RunCheckpointer::new(store.clone());

        info!("🚀 Starting run {} for: {}", run_id, request.problem);
        if !request.cache_enabled {
            info!("🧊 Cache disabled for this run");
        }

        let mut scenes: Vec<Scene> = Vec::new();
        let result = self
            .run_stages(request, &store, &executor, &checkpointer, run_id, &metrics, &mut scenes)
            .await;

        let summaries: Vec<SceneSummary> = scenes.iter().map(Scene::summary).collect();
        let phase = match &result {
            Ok(_) => RunPhase::Finished,
            Err(PipelineError::Cancelled) => RunPhase::Cancelled,
            Err(_) => RunPhase::Failed,
        };
        let mut snapshot = RunSnapshot::new(run_id, &request.problem, phase, summaries.clone(), metrics.snapshot());
        match &result {
            Ok(video) => snapshot.final_video = Some(video.clone()),
            Err(e) => snapshot.error = Some(e.to_string()),
        }
        if let Err(e) = checkpointer.save(&mut snapshot).await {
            warn!("⚠️ Failed to write run summary: {}", e);
        }

        let final_video = result.map_err(|e| {
            error!("❌ Run {} failed: {}", run_id, e);
            e
        })?;
        info!(
            "🎉 Run {} complete: {} ({} external calls, {} cache hits)",
            run_id,
            final_video.path.display(),
            snapshot.metrics.total_external_calls(),
            snapshot.metrics.total_cache_hits()
        );

        Ok(RunReport {
            run_id,
            final_video,
            scenes: summaries,
            metrics: snapshot.metrics,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        request: &ProblemRequest,
        store: &ArtifactStore,
        executor: &StageExecutor,
        checkpointer: &RunCheckpointer,
        run_id: Uuid,
        metrics: &StageMetrics,
        scenes: &mut Vec<Scene>,
    ) -> PipelineResult<FinalVideo> {
        let retry = &self.config.retry;
        let cancel = executor.cancel_token();

        // Solve
        let solver = self.collaborators.solver.as_ref();
        let fp = FingerprintInput::new(StageKind::Solve)
            .prose("problem", &request.problem)
            .collaborator(&solver.identity())
            .finish();
        let solution: Solution = run_with_retry(retry, cancel, StageKind::Solve, "run", |_| {
            let fp = &fp;
            async move {
                executor
                    .execute(StageKind::Solve, fp, || async move {
                        solver.solve(&request.problem).await.map(|text| Solution { text })
                    })
                    .await
            }
        })
        .await
        .map_err(PipelineError::from_stage)?;
        store.write(&ArtifactLocation::Solution, &solution.text).await?;
        info!("📝 Solution ready ({} chars)", solution.text.len());

        // Split into scenes
        let splitter = self.collaborators.splitter.as_ref();
        let fp = FingerprintInput::new(StageKind::Split)
            .prose("solution", &solution.text)
            .collaborator(&splitter.identity())
            .finish();
        let plan: ScenePlan = run_with_retry(retry, cancel, StageKind::Split, "run", |_| {
            let (fp, text) = (&fp, solution.text.as_str());
            async move {
                executor
                    .execute(StageKind::Split, fp, || async move {
                        splitter
                            .split(text)
                            .await
                            .and_then(|value| ScenePlan::from_value(value).map_err(CollaboratorError::Malformed))
                    })
                    .await
            }
        })
        .await
        .map_err(PipelineError::from_stage)?;
        store.write_json(&ArtifactLocation::ScenePlan, &plan).await?;
        info!("🗂️ Scene plan ready: {} scenes", plan.scenes.len());

        // Scenes
        let controller = ScenePipelineController::new(
            executor.clone(),
            store.clone(),
            self.collaborators.clone(),
            &self.config,
        );
        *scenes = controller.run_all(&plan, &solution).await;

        let mut snapshot = RunSnapshot::new(
            run_id,
            &request.problem,
            RunPhase::ScenesComplete,
            scenes.iter().map(Scene::summary).collect(),
            metrics.snapshot(),
        );
        if let Err(e) = checkpointer.save(&mut snapshot).await {
            warn!("⚠️ Failed to checkpoint scene results: {}", e);
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if !scenes.iter().any(|s| s.status.is_synced()) {
            return Err(PipelineError::NoScenesSynced);
        }

        // Assembly
        let coordinator = AssemblyCoordinator::new(
            executor.clone(),
            store.clone(),
            self.collaborators.stitcher.clone(),
            self.config.retry.clone(),
            self.config.assembly,
        );
        coordinator.assemble(scenes).await
    }
}
