// utils.rs - Async FFmpeg/FFprobe helpers
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::CollaboratorError;

/// Runs an external tool to completion and returns its stdout.
/// The child is killed if the returned future is dropped.
pub async fn run_tool<I, S>(program: &str, args: I) -> Result<String, CollaboratorError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!("Executing {:?}", command);

    let output = command
        .output()
        .await
        .map_err(|e| CollaboratorError::Process(format!("failed to start {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CollaboratorError::Process(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            tail(&stderr, 20)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Check if FFmpeg and FFprobe are available
pub async fn check_ffmpeg_available() -> Result<(), CollaboratorError> {
    run_tool("ffmpeg", ["-version"]).await?;
    run_tool("ffprobe", ["-version"]).await?;
    Ok(())
}

/// Container duration in seconds.
pub async fn probe_duration(path: &Path) -> Result<f64, CollaboratorError> {
    let stdout = run_tool(
        "ffprobe",
        [
            OsStr::new("-v"),
            OsStr::new("quiet"),
            OsStr::new("-show_entries"),
            OsStr::new("format=duration"),
            OsStr::new("-of"),
            OsStr::new("csv=p=0"),
            path.as_os_str(),
        ],
    )
    .await?;

    stdout
        .trim()
        .parse::<f64>()
        .map_err(|e| CollaboratorError::Process(format!("ffprobe duration `{}` for {}: {}", stdout.trim(), path.display(), e)))
}

pub fn seconds_to_ffmpeg_time(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let hours = (seconds / 3600.0) as u32;
    let minutes = ((seconds % 3600.0) / 60.0) as u32;
    let secs = (seconds % 60.0) as u32;
    let millis = ((seconds % 1.0) * 1000.0).round().min(999.0) as u32;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}

/// Body of an ffmpeg concat-demuxer list for `videos`.
pub fn concat_list(videos: &[PathBuf]) -> String {
    videos
        .iter()
        .map(|v| format!("file '{}'\n", v.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

/// Every `.mp4` under `dir`, skipping Manim's partial movie fragments.
pub async fn find_mp4_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut reader = match tokio::fs::read_dir(&current).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                if path.file_name() != Some(OsStr::new("partial_movie_files")) {
                    pending.push(path);
                }
            } else if path.extension() == Some(OsStr::new("mp4")) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
