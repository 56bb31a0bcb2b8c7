// artifacts.rs - Deterministic on-disk layout for run outputs and cache bodies
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{PipelineError, PipelineResult};

pub const CACHE_DIR: &str = ".cache";

/// A named slot in the output layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactLocation {
    Solution,
    ScenePlan,
    SceneDir(u32),
    SceneScript(u32),
    SceneAnimationPlan(u32),
    SceneCode(u32),
    SceneAudio(u32),
    SceneRender(u32),
    SceneSynced(u32),
    FinalVideo,
    RunSummary,
    CacheEntry(String),
    CacheObject(String),
    /// Media body held by the cache, by file name.
    CacheMedia(String),
}

impl ArtifactLocation {
    pub fn relative_path(&self) -> PathBuf {
        match self {
            ArtifactLocation::Solution => PathBuf::from("solution.txt"),
            ArtifactLocation::ScenePlan => PathBuf::from("scene_plan.json"),
            ArtifactLocation::SceneDir(n) => PathBuf::from(format!("scene{}", n)),
            ArtifactLocation::SceneScript(n) => scene_file(*n, "script.txt"),
            ArtifactLocation::SceneAnimationPlan(n) => scene_file(*n, "animation_plan.json"),
            ArtifactLocation::SceneCode(n) => scene_file(*n, "scene.py"),
            ArtifactLocation::SceneAudio(n) => scene_file(*n, "audio.mp3"),
            ArtifactLocation::SceneRender(n) => scene_file(*n, "render.mp4"),
            ArtifactLocation::SceneSynced(n) => scene_file(*n, "synced.mp4"),
            ArtifactLocation::FinalVideo => PathBuf::from("final_video.mp4"),
            ArtifactLocation::RunSummary => PathBuf::from("run_summary.json"),
            ArtifactLocation::CacheEntry(fp) => Path::new(CACHE_DIR).join("entries").join(format!("{}.json", fp)),
            ArtifactLocation::CacheObject(fp) => Path::new(CACHE_DIR).join("objects").join(format!("{}.json", fp)),
            ArtifactLocation::CacheMedia(name) => Path::new(CACHE_DIR).join("objects").join(name),
        }
    }
}

fn scene_file(index: u32, name: &str) -> PathBuf {
    PathBuf::from(format!("scene{}", index)).join(name)
}

/// Filesystem-backed artifact store rooted at the run's output directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, location: &ArtifactLocation) -> PathBuf {
        self.root.join(location.relative_path())
    }

    /// Creates the directory for `location` (or its parent for files).
    pub async fn prepare(&self, location: &ArtifactLocation) -> PipelineResult<PathBuf> {
        let path = self.path_of(location);
        let dir = match location {
            ArtifactLocation::SceneDir(_) => path.clone(),
            _ => path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone()),
        };
        fs::create_dir_all(&dir).await?;
        Ok(path)
    }

    /// Writes atomically: the body goes to a temp sibling first, then is renamed.
    pub async fn write(&self, location: &ArtifactLocation, bytes: impl AsRef<[u8]>) -> PipelineResult<PathBuf> {
        let path = self.prepare(location).await?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, bytes.as_ref()).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(path)
    }

    /// Copies `from` into `location`, atomically like [`Self::write`].
    pub async fn copy_in(&self, location: &ArtifactLocation, from: &Path) -> PipelineResult<PathBuf> {
        let path = self.prepare(location).await?;
        copy_atomic(from, &path).await?;
        Ok(path)
    }

    pub async fn write_json<T: serde::Serialize>(&self, location: &ArtifactLocation, value: &T) -> PipelineResult<PathBuf> {
        let body = serde_json::to_vec_pretty(value)?;
        self.write(location, body).await
    }

    pub async fn read(&self, location: &ArtifactLocation) -> PipelineResult<Vec<u8>> {
        let path = self.path_of(location);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::NotFound(path)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_text(&self, location: &ArtifactLocation) -> PipelineResult<String> {
        let bytes = self.read(location).await?;
        String::from_utf8(bytes).map_err(|e| {
            PipelineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    pub async fn exists(&self, location: &ArtifactLocation) -> bool {
        fs::try_exists(self.path_of(location)).await.unwrap_or(false)
    }
}

/// Copies through a temp sibling so readers never see a half-written file.
pub async fn copy_atomic(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(dir) = to.parent() {
        fs::create_dir_all(dir).await?;
    }
    let tmp = to.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::copy(from, &tmp).await?;
    if let Err(e) = fs::rename(&tmp, to).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
