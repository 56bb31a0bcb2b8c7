// metrics.rs - Per-stage counters for one run
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::StageKind;

const STAGES: usize = StageKind::ALL.len();

/// Lock-free counters shared by every stage execution of a run.
#[derive(Debug, Default)]
pub struct StageMetrics {
    external_calls: [AtomicU64; STAGES],
    cache_hits: [AtomicU64; STAGES],
    failures: [AtomicU64; STAGES],
    busy_micros: [AtomicU64; STAGES],
}

impl StageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, stage: StageKind, elapsed: Duration) {
        self.external_calls[stage.index()].fetch_add(1, Ordering::Relaxed);
        self.busy_micros[stage.index()].fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_hit(&self, stage: StageKind) {
        self.cache_hits[stage.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, stage: StageKind) {
        self.failures[stage.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn external_calls(&self, stage: StageKind) -> u64 {
        self.external_calls[stage.index()].load(Ordering::Relaxed)
    }

    pub fn total_external_calls(&self) -> u64 {
        StageKind::ALL.iter().map(|s| self.external_calls(*s)).sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = StageKind::ALL
            .iter()
            .map(|stage| {
                let i = stage.index();
                (
                    *stage,
                    StageCounts {
                        external_calls: self.external_calls[i].load(Ordering::Relaxed),
                        cache_hits: self.cache_hits[i].load(Ordering::Relaxed),
                        failures: self.failures[i].load(Ordering::Relaxed),
                        busy_seconds: self.busy_micros[i].load(Ordering::Relaxed) as f64 / 1_000_000.0,
                    },
                )
            })
            .filter(|(_, counts)| counts.external_calls + counts.cache_hits + counts.failures > 0)
            .collect();
        MetricsSnapshot { stages }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCounts {
    pub external_calls: u64,
    pub cache_hits: u64,
    pub failures: u64,
    /// Wall time spent inside the collaborator, summed across scenes.
    pub busy_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<StageKind, StageCounts>,
}

impl MetricsSnapshot {
    pub fn total_external_calls(&self) -> u64 {
        self.stages.values().map(|c| c.external_calls).sum()
    }

    pub fn total_cache_hits(&self) -> u64 {
        self.stages.values().map(|c| c.cache_hits).sum()
    }
}
