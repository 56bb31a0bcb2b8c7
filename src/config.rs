// config.rs - Immutable run configuration, built once at startup
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_MODEL_ID: &str = "claude-sonnet-4-5";

/// Narration voice options recognized by the audio stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub voice: String,
    /// Playback multiplier, 1.0 is normal speed.
    pub speed: f64,
    /// Locale code, e.g. `en-us`.
    pub language: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice: "af_sarah".to_string(),
            speed: 1.0,
            language: "en-us".to_string(),
        }
    }
}

/// Bounded retry budget shared by every stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per stage for transient and plain validation failures.
    pub max_attempts: u32,
    /// Attempts for code generation when the output fails validation.
    pub max_codegen_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_codegen_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay schedule between attempts. Elapsed-time cutoff is disabled: the
    /// attempt counts above are the only bound.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            current_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: self.multiplier,
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// What assembly does when some scenes did not reach `Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyPolicy {
    /// Every scene must be synced; otherwise no video is produced.
    #[default]
    Strict,
    /// Stitch the synced scenes in order and report the skipped ones.
    AllowPartial,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_root: PathBuf,
    pub cache_enabled: bool,
    pub max_parallel_scenes: usize,
    pub retry: RetryPolicy,
    pub assembly: AssemblyPolicy,
    pub voice: VoiceConfig,
    pub anthropic_api_key: Option<String>,
    pub model_id: String,
    pub elevenlabs_api_key: Option<String>,
    pub manim_quality: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from(DEFAULT_OUTPUT_DIR),
            cache_enabled: true,
            max_parallel_scenes: 3,
            retry: RetryPolicy::default(),
            assembly: AssemblyPolicy::Strict,
            voice: VoiceConfig::default(),
            anthropic_api_key: None,
            model_id: DEFAULT_MODEL_ID.to_string(),
            elevenlabs_api_key: None,
            manim_quality: "h".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reads the process environment (after `.env` has been loaded).
    pub fn from_env() -> PipelineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> PipelineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut retry = RetryPolicy::default();
        retry.max_attempts = parse_or(&non_empty, "MAX_STAGE_ATTEMPTS", retry.max_attempts)?;
        retry.max_codegen_attempts = parse_or(&non_empty, "MAX_CODEGEN_ATTEMPTS", retry.max_codegen_attempts)?;

        let voice = VoiceConfig {
            voice: non_empty("VOICE_ID").unwrap_or(defaults.voice.voice),
            speed: parse_or(&non_empty, "VOICE_SPEED", defaults.voice.speed)?,
            language: non_empty("VOICE_LANG").unwrap_or(defaults.voice.language),
        };

        let config = Self {
            output_root: non_empty("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_root),
            cache_enabled: defaults.cache_enabled,
            max_parallel_scenes: parse_or(&non_empty, "MAX_PARALLEL_SCENES", defaults.max_parallel_scenes)?,
            retry,
            assembly: defaults.assembly,
            voice,
            anthropic_api_key: non_empty("ANTHROPIC_API_KEY"),
            model_id: non_empty("MODEL_ID").unwrap_or(defaults.model_id),
            elevenlabs_api_key: non_empty("ELEVEN_LABS_API_KEY"),
            manim_quality: non_empty("MANIM_QUALITY").unwrap_or(defaults.manim_quality),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.max_parallel_scenes == 0 {
            return Err(PipelineError::Config("MAX_PARALLEL_SCENES must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 || self.retry.max_codegen_attempts == 0 {
            return Err(PipelineError::Config("retry attempt counts must be at least 1".into()));
        }
        if !self.voice.speed.is_finite() || self.voice.speed <= 0.0 {
            return Err(PipelineError::Config(format!("VOICE_SPEED must be positive, got {}", self.voice.speed)));
        }
        if !matches!(self.manim_quality.as_str(), "l" | "m" | "h" | "p" | "k") {
            return Err(PipelineError::Config(format!(
                "MANIM_QUALITY must be one of l, m, h, p, k (got `{}`)",
                self.manim_quality
            )));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> PipelineResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PipelineError::Config(format!("{} = `{}`: {}", key, raw, e))),
        None => Ok(default),
    }
}
