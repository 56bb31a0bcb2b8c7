// Executor - Runs one stage against the cache: hit, or invoke + validate + store
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheOutcome, CacheStore, Fingerprint};
use crate::error::{CollaboratorError, StageError};
use crate::metrics::StageMetrics;
use crate::types::{StageKind, StageOutput};

/// Stage executor shared by every scene of a run.
///
/// Failures are returned to the caller as-is; retry policy lives in
/// [`super::retry`], not here.
#[derive(Clone)]
pub struct StageExecutor {
    cache: Arc<CacheStore>,
    metrics: Arc<StageMetrics>,
    cancel: CancellationToken,
}

impl StageExecutor {
    pub fn new(cache: Arc<CacheStore>, metrics: Arc<StageMetrics>, cancel: CancellationToken) -> Self {
        Self { cache, metrics, cancel }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the artifact for `fingerprint`, invoking the collaborator only
    /// on a cache miss. The returned artifact is validated before it is
    /// cached; an invalid artifact becomes a `ValidationFailure`.
    pub async fn execute<T, F, Fut>(&self, stage: StageKind, fingerprint: &Fingerprint, invoke: F) -> Result<T, StageError>
    where
        T: StageOutput,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StageError::Cancelled { stage });
        }

        let metrics = &self.metrics;
        let compute = move || async move {
            debug!("🔧 {} miss for {}, invoking collaborator", stage, fingerprint.short());
            let started = Instant::now();
            let result = invoke().await;
            metrics.record_call(stage, started.elapsed());

            let value = result.map_err(|e| StageError::from_collaborator(stage, e))?;
            value
                .validate()
                .map_err(|message| StageError::ValidationFailure { stage, message })?;
            Ok::<T, StageError>(value)
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StageError::Cancelled { stage }),
            outcome = self.cache.get_or_compute(stage, fingerprint, compute) => outcome,
        };

        match outcome {
            Ok(CacheOutcome::Hit(value)) => {
                self.metrics.record_hit(stage);
                debug!("♻️ {} served from cache ({})", stage, fingerprint.short());
                Ok(value)
            }
            Ok(CacheOutcome::Computed(value)) => {
                info!("✅ {} complete ({})", stage, fingerprint.short());
                Ok(value)
            }
            Err(e) => {
                if !e.is_cancelled() {
                    self.metrics.record_failure(stage);
                    warn!("❌ {} failed: {}", stage, e.message());
                }
                Err(e)
            }
        }
    }
}
