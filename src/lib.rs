// lib.rs - Main library file that exports all modules
pub mod artifacts;
pub mod cache;
pub mod claude_client;
pub mod collaborators;
pub mod config;
pub mod elevenlabs_client;
pub mod error;
pub mod media;
pub mod metrics;
pub mod pipeline;
pub mod types;
pub mod utils;
pub mod workflow;

// Re-export commonly used types for convenience
pub use artifacts::{ArtifactLocation, ArtifactStore};
pub use cache::{CacheStore, Fingerprint, FingerprintInput};
pub use collaborators::Collaborators;
pub use config::{AssemblyPolicy, PipelineConfig, RetryPolicy, VoiceConfig};
pub use error::{CollaboratorError, PipelineError, PipelineResult, StageError};
pub use pipeline::{RunReport, VideoGenerationPipeline};
pub use types::*;
