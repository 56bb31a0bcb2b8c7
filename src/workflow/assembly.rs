// Assembly - Stitches synced scenes into the final video
use std::sync::Arc;
use tracing::{info, warn};

use super::executor::StageExecutor;
use super::retry::run_with_retry;
use super::state::Scene;
use crate::artifacts::{ArtifactLocation, ArtifactStore};
use crate::cache::{Fingerprint, FingerprintInput};
use crate::collaborators::VideoStitcher;
use crate::config::{AssemblyPolicy, RetryPolicy};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{FinalVideo, MediaArtifact, StageKind};

pub struct AssemblyCoordinator {
    executor: StageExecutor,
    store: ArtifactStore,
    stitcher: Arc<dyn VideoStitcher>,
    retry: RetryPolicy,
    policy: AssemblyPolicy,
}

impl AssemblyCoordinator {
    pub fn new(
        executor: StageExecutor,
        store: ArtifactStore,
        stitcher: Arc<dyn VideoStitcher>,
        retry: RetryPolicy,
        policy: AssemblyPolicy,
    ) -> Self {
        Self {
            executor,
            store,
            stitcher,
            retry,
            policy,
        }
    }

    /// Stitches the scenes' synced videos in index order.
    ///
    /// `scenes` must be the complete ordered sequence (indices 1..=N). Under
    /// `Strict`, any scene that is not `Synced` fails assembly with
    /// `IncompletePipeline` naming the first such scene. Under `AllowPartial`,
    /// those scenes are skipped and listed on the result.
    pub async fn assemble(&self, scenes: &[Scene]) -> PipelineResult<FinalVideo> {
        for (position, scene) in scenes.iter().enumerate() {
            let expected = position as u32 + 1;
            if scene.index != expected {
                return Err(PipelineError::IncompletePipeline {
                    scene_index: expected,
                    status: "missing".to_string(),
                });
            }
        }

        let mut included: Vec<(&Scene, &MediaArtifact, &Fingerprint)> = Vec::new();
        let mut skipped = Vec::new();
        for scene in scenes {
            match synced_output(scene) {
                Some((video, fingerprint)) => included.push((scene, video, fingerprint)),
                None if self.policy == AssemblyPolicy::Strict => {
                    return Err(PipelineError::IncompletePipeline {
                        scene_index: scene.index,
                        status: scene.status.to_string(),
                    });
                }
                None => {
                    warn!("⚠️ Skipping scene {} ({}) in partial assembly", scene.index, scene.status);
                    skipped.push(scene.index);
                }
            }
        }

        if included.is_empty() {
            return Err(match scenes.first() {
                Some(first) => PipelineError::IncompletePipeline {
                    scene_index: first.index,
                    status: first.status.to_string(),
                },
                None => PipelineError::NoScenesSynced,
            });
        }

        let videos: Vec<MediaArtifact> = included.iter().map(|(_, video, _)| (*video).clone()).collect();
        let upstream: Vec<(u32, &Fingerprint)> = included.iter().map(|(scene, _, fp)| (scene.index, *fp)).collect();
        let fingerprint = FingerprintInput::new(StageKind::Stitch)
            .value("scenes", &upstream)
            .collaborator(&self.stitcher.identity())
            .finish();

        let output = self.store.prepare(&ArtifactLocation::FinalVideo).await?;
        info!("🎞️ Stitching {} scene videos into {}", videos.len(), output.display());

        let stitcher = self.stitcher.as_ref();
        let (videos, output_ref) = (&videos, &output);
        let stitched: MediaArtifact = run_with_retry(
            &self.retry,
            self.executor.cancel_token(),
            StageKind::Stitch,
            "assembly",
            |_| {
                let fingerprint = &fingerprint;
                async move {
                    self.executor
                        .execute(StageKind::Stitch, fingerprint, || stitcher.stitch(videos, output_ref))
                        .await
                }
            },
        )
        .await
        .map_err(PipelineError::from_stage)?;

        Ok(FinalVideo {
            path: stitched.path,
            scenes: included.iter().map(|(scene, _, _)| scene.index).collect(),
            sources: videos.iter().map(|v| v.path.clone()).collect(),
            skipped,
        })
    }
}

fn synced_output(scene: &Scene) -> Option<(&MediaArtifact, &Fingerprint)> {
    if !scene.status.is_synced() {
        return None;
    }
    Some((scene.synced.as_ref()?, scene.fingerprints.get(&StageKind::Sync)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::collaborators::CollaboratorResult;
    use crate::metrics::StageMetrics;
    use crate::types::ScenePlanEntry;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct ConcatStitcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VideoStitcher for ConcatStitcher {
        fn identity(&self) -> String {
            "concat".to_string()
        }

        async fn stitch(&self, videos: &[MediaArtifact], output: &Path) -> CollaboratorResult<MediaArtifact> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut body = Vec::new();
            for video in videos {
                body.extend(tokio::fs::read(&video.path).await?);
            }
            tokio::fs::write(output, body).await?;
            Ok(MediaArtifact::new(output))
        }
    }

    fn coordinator(dir: &Path, stitcher: Arc<ConcatStitcher>, policy: AssemblyPolicy) -> AssemblyCoordinator {
        let store = ArtifactStore::new(dir);
        let executor = StageExecutor::new(
            Arc::new(CacheStore::new(store.clone(), true)),
            Arc::new(StageMetrics::new()),
            CancellationToken::new(),
        );
        let retry = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        AssemblyCoordinator::new(executor, store, stitcher, retry, policy)
    }

    fn scene(dir: &Path, index: u32, synced: bool) -> Scene {
        let mut scene = Scene::new(ScenePlanEntry {
            index,
            description: format!("step {}", index),
            duration: 5.0,
        });
        if synced {
            let path = dir.join(format!("synced{}.mp4", index));
            std::fs::write(&path, format!("[scene {}]", index)).unwrap();
            scene.status = crate::workflow::state::SceneStatus::Synced;
            scene.synced = Some(MediaArtifact::new(path));
            scene.fingerprints.insert(
                StageKind::Sync,
                FingerprintInput::new(StageKind::Sync).number("scene_index", index as u64).finish(),
            );
        } else {
            scene.fail(StageKind::Render, "manim exited with status 1");
        }
        scene
    }

    #[tokio::test]
    async fn stitches_synced_scenes_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let stitcher = Arc::new(ConcatStitcher::default());
        let coordinator = coordinator(dir.path(), stitcher.clone(), AssemblyPolicy::Strict);
        let scenes: Vec<Scene> = (1..=3).map(|i| scene(dir.path(), i, true)).collect();

        let video = coordinator.assemble(&scenes).await.unwrap();
        assert_eq!(video.scenes, vec![1, 2, 3]);
        assert_eq!(video.sources, scenes.iter().map(|s| s.synced.clone().unwrap().path).collect::<Vec<_>>());
        assert_eq!(std::fs::read_to_string(&video.path).unwrap(), "[scene 1][scene 2][scene 3]");

        let again = coordinator.assemble(&scenes).await.unwrap();
        assert_eq!(again, video);
        assert_eq!(stitcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn strict_policy_names_first_unsynced_scene() {
        let dir = tempfile::tempdir().unwrap();
        let stitcher = Arc::new(ConcatStitcher::default());
        let coordinator = coordinator(dir.path(), stitcher.clone(), AssemblyPolicy::Strict);
        let scenes = vec![scene(dir.path(), 1, true), scene(dir.path(), 2, false), scene(dir.path(), 3, false)];

        match coordinator.assemble(&scenes).await {
            Err(PipelineError::IncompletePipeline { scene_index, status }) => {
                assert_eq!(scene_index, 2);
                assert!(status.contains("render"), "{}", status);
            }
            other => panic!("expected IncompletePipeline, got {:?}", other),
        }
        assert_eq!(stitcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gaps_in_the_sequence_are_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), Arc::new(ConcatStitcher::default()), AssemblyPolicy::AllowPartial);
        let scenes = vec![scene(dir.path(), 1, true), scene(dir.path(), 3, true)];

        assert!(matches!(
            coordinator.assemble(&scenes).await,
            Err(PipelineError::IncompletePipeline { scene_index: 2, .. })
        ));
    }

    #[tokio::test]
    async fn partial_policy_skips_failed_scenes() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), Arc::new(ConcatStitcher::default()), AssemblyPolicy::AllowPartial);
        let scenes = vec![scene(dir.path(), 1, true), scene(dir.path(), 2, false), scene(dir.path(), 3, true)];

        let video = coordinator.assemble(&scenes).await.unwrap();
        assert_eq!(video.scenes, vec![1, 3]);
        assert_eq!(video.skipped, vec![2]);
        assert_eq!(std::fs::read_to_string(&video.path).unwrap(), "[scene 1][scene 3]");

        let none_synced = vec![scene(dir.path(), 1, false)];
        assert!(matches!(
            coordinator.assemble(&none_synced).await,
            Err(PipelineError::IncompletePipeline { scene_index: 1, .. })
        ));
    }
}
