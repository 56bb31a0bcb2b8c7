// media.rs - Manim rendering plus FFmpeg sync and stitching
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::collaborators::{CollaboratorResult, SceneRenderer, VideoStitcher};
use crate::error::CollaboratorError;
use crate::types::{GeneratedCode, MediaArtifact};
use crate::utils::{concat_list, find_mp4_files, probe_duration, run_tool, seconds_to_ffmpeg_time};

/// Audio longer than the video by less than this is not padded.
const PAD_THRESHOLD_SECS: f64 = 0.05;

/// FFmpeg-backed muxing and concatenation.
#[derive(Debug, Clone, Default)]
pub struct FfmpegMedia;

impl FfmpegMedia {
    pub fn new() -> Self {
        Self
    }

    /// Holds the last frame when the narration outlasts the animation and
    /// trims the animation when it runs longer.
    pub async fn sync(&self, video: &MediaArtifact, audio: &MediaArtifact, output: &Path) -> CollaboratorResult<MediaArtifact> {
        let video_secs = probe_duration(video.path()).await?;
        let audio_secs = probe_duration(audio.path()).await?;
        info!("🔊 Syncing {} ({:.2}s) with narration ({:.2}s)", video.path.display(), video_secs, audio_secs);

        let args = sync_args(video.path(), audio.path(), video_secs, audio_secs, output);
        run_tool("ffmpeg", args).await?;
        Ok(MediaArtifact::new(output).with_duration(audio_secs))
    }

    pub async fn concat(&self, videos: &[MediaArtifact], output: &Path) -> CollaboratorResult<MediaArtifact> {
        if videos.is_empty() {
            return Err(CollaboratorError::Process("nothing to stitch".to_string()));
        }

        let list_path = output.with_extension("txt");
        let sources: Vec<PathBuf> = videos.iter().map(|v| absolute(v.path())).collect();
        tokio::fs::write(&list_path, concat_list(&sources)).await?;

        let result = run_tool(
            "ffmpeg",
            [
                OsString::from("-y"),
                "-f".into(),
                "concat".into(),
                "-safe".into(),
                "0".into(),
                "-i".into(),
                list_path.clone().into(),
                "-c".into(),
                "copy".into(),
                output.as_os_str().to_os_string(),
            ],
        )
        .await;
        if let Err(e) = tokio::fs::remove_file(&list_path).await {
            warn!("⚠️ Could not remove concat list {}: {}", list_path.display(), e);
        }
        result?;

        let artifact = MediaArtifact::new(output);
        Ok(match probe_duration(output).await {
            Ok(secs) => artifact.with_duration(secs),
            Err(_) => artifact,
        })
    }
}

#[async_trait]
impl VideoStitcher for FfmpegMedia {
    fn identity(&self) -> String {
        "ffmpeg-concat:v1".to_string()
    }

    async fn stitch(&self, videos: &[MediaArtifact], output: &Path) -> CollaboratorResult<MediaArtifact> {
        self.concat(videos, output).await
    }
}

/// Renders generated Manim code with the `manim` CLI.
#[derive(Debug, Clone)]
pub struct ManimRenderer {
    quality: String,
    ffmpeg: FfmpegMedia,
}

impl ManimRenderer {
    pub fn new(quality: impl Into<String>) -> Self {
        Self {
            quality: quality.into(),
            ffmpeg: FfmpegMedia::new(),
        }
    }
}

#[async_trait]
impl SceneRenderer for ManimRenderer {
    fn identity(&self) -> String {
        format!("manim:q{}+ffmpeg-sync:v1", self.quality)
    }

    async fn render(&self, code: &str, output: &Path) -> CollaboratorResult<MediaArtifact> {
        let generated = GeneratedCode::new(code);
        let class_name = generated
            .scene_class()
            .ok_or_else(|| CollaboratorError::Malformed("no Manim Scene subclass to render".to_string()))?;

        let work_dir = output.with_extension("manim");
        if tokio::fs::try_exists(&work_dir).await? {
            tokio::fs::remove_dir_all(&work_dir).await?;
        }
        tokio::fs::create_dir_all(&work_dir).await?;
        let source = work_dir.join("scene.py");
        tokio::fs::write(&source, &generated.code).await?;

        info!("🎨 Rendering {} with manim -q{}", class_name, self.quality);
        run_tool(
            "manim",
            [
                OsString::from(format!("-q{}", self.quality)),
                "--disable_caching".into(),
                "--media_dir".into(),
                work_dir.join("media").into(),
                source.into(),
                class_name.into(),
            ],
        )
        .await?;

        let rendered = find_mp4_files(&work_dir.join("media"))
            .await?
            .into_iter()
            .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(class_name))
            .ok_or_else(|| CollaboratorError::Process(format!("manim finished but produced no video for {}", class_name)))?;

        tokio::fs::copy(&rendered, output).await?;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!("⚠️ Could not clean up {}: {}", work_dir.display(), e);
        }

        let artifact = MediaArtifact::new(output);
        Ok(match probe_duration(output).await {
            Ok(secs) => artifact.with_duration(secs),
            Err(_) => artifact,
        })
    }

    async fn sync(&self, video: &MediaArtifact, audio: &MediaArtifact, output: &Path) -> CollaboratorResult<MediaArtifact> {
        self.ffmpeg.sync(video, audio, output).await
    }
}

/// Muxes `audio` onto `video`, padding the last frame when the narration is
/// longer and cutting the result at the narration's end.
fn sync_args(video: &Path, audio: &Path, video_secs: f64, audio_secs: f64, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video.as_os_str().to_os_string(),
        "-i".into(),
        audio.as_os_str().to_os_string(),
    ];
    let pad = audio_secs - video_secs;
    if pad > PAD_THRESHOLD_SECS {
        // Filter options are colon-separated, so the pad stays in plain seconds.
        args.push("-vf".into());
        args.push(format!("tpad=stop_mode=clone:stop_duration={:.3}", pad).into());
    }
    for arg in [
        "-map", "0:v:0", "-map", "1:a:0", "-c:v", "libx264", "-pix_fmt", "yuv420p", "-c:a", "aac", "-t",
    ] {
        args.push(arg.into());
    }
    args.push(seconds_to_ffmpeg_time(audio_secs).into());
    args.push(output.as_os_str().to_os_string());
    args
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
}
