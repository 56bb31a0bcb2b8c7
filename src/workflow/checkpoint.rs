// Checkpointing - Persist the run summary after each phase
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::state::SceneSummary;
use crate::artifacts::{ArtifactLocation, ArtifactStore};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::MetricsSnapshot;
use crate::types::FinalVideo;

/// Bump when the snapshot layout changes; older files are ignored on load.
pub const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    ScenesComplete,
    Finished,
    Failed,
    Cancelled,
}

/// Snapshot of one run, as written to `run_summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub format: u32,
    pub checkpoint_id: String,
    pub run_id: Uuid,
    /// Increments with every save within the same run.
    pub version: u32,
    pub problem: String,
    pub phase: RunPhase,
    pub scenes: Vec<SceneSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_video: Option<FinalVideo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: MetricsSnapshot,
    pub created_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn new(run_id: Uuid, problem: &str, phase: RunPhase, scenes: Vec<SceneSummary>, metrics: MetricsSnapshot) -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            checkpoint_id: String::new(),
            run_id,
            version: 0,
            problem: problem.to_string(),
            phase,
            scenes,
            final_video: None,
            error: None,
            metrics,
            created_at: Utc::now(),
        }
    }
}

/// Saves and loads run snapshots in the output directory.
#[derive(Debug, Clone)]
pub struct RunCheckpointer {
    store: ArtifactStore,
}

impl RunCheckpointer {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Writes `snapshot`, assigning its checkpoint id and version. Returns the id.
    pub async fn save(&self, snapshot: &mut RunSnapshot) -> PipelineResult<String> {
        let previous = self.load_latest().await?;
        snapshot.version = match previous {
            Some(prev) if prev.run_id == snapshot.run_id => prev.version + 1,
            _ => 1,
        };
        snapshot.created_at = Utc::now();
        snapshot.checkpoint_id = format!("{}::{}", snapshot.run_id, snapshot.created_at.timestamp_millis());

        self.store.write_json(&ArtifactLocation::RunSummary, snapshot).await?;
        info!(
            "💾 Checkpoint saved: {} (version: {}, phase: {:?})",
            snapshot.checkpoint_id, snapshot.version, snapshot.phase
        );
        Ok(snapshot.checkpoint_id.clone())
    }

    /// Latest snapshot in the output directory, if any readable one exists.
    pub async fn load_latest(&self) -> PipelineResult<Option<RunSnapshot>> {
        if !self.store.exists(&ArtifactLocation::RunSummary).await {
            return Ok(None);
        }
        let text = match self.store.read_text(&ArtifactLocation::RunSummary).await {
            Ok(text) => text,
            Err(PipelineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        match serde_json::from_str::<RunSnapshot>(&text) {
            Ok(snapshot) if snapshot.format == SNAPSHOT_FORMAT => Ok(Some(snapshot)),
            Ok(snapshot) => {
                warn!("⚠️ Ignoring run summary in format {} (expected {})", snapshot.format, SNAPSHOT_FORMAT);
                Ok(None)
            }
            Err(e) => {
                warn!("⚠️ Ignoring unreadable run summary: {}", e);
                Ok(None)
            }
        }
    }
}
