// src/cache/mod.rs
//! Content-addressed response cache.
//!
//! Entries live under the artifact store's `.cache` namespace: one entry
//! record per fingerprint plus the serialized artifact body. Media files an
//! artifact points at are copied into the namespace too, since the per-scene
//! paths are rewritten by later runs. The store guarantees at most one
//! in-flight computation per fingerprint; concurrent requesters queue on a
//! per-key lock and reuse the first result.

pub mod fingerprint;

pub use fingerprint::{Fingerprint, FingerprintInput};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::artifacts::{copy_atomic, ArtifactLocation, ArtifactStore, CACHE_DIR};
use crate::error::{CacheCorruption, PipelineError, PipelineResult};
use crate::types::{StageKind, StageOutput};

/// Persisted mapping from a fingerprint to its artifact body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub stage: StageKind,
    pub created_at: DateTime<Utc>,
    /// Artifact body, relative to the output root.
    pub object: PathBuf,
    /// Files the artifact points at, each with the cache's own copy.
    #[serde(default)]
    pub referenced_files: Vec<FileDigest>,
}

/// A file referenced by a cached artifact and the copy kept in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDigest {
    /// Where the artifact expects the file.
    pub path: PathBuf,
    pub sha256: String,
    /// Cache copy, relative to the output root.
    pub stored: PathBuf,
}

pub async fn sha256_of(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// `{fp}.{ext}` for the first referenced file, `{fp}-{n}.{ext}` for the rest.
fn media_name(fingerprint: &Fingerprint, position: usize, file: &Path) -> String {
    let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("bin");
    match position {
        0 => format!("{}.{}", fingerprint.as_str(), ext),
        n => format!("{}-{}.{}", fingerprint.as_str(), n, ext),
    }
}

/// How a value was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOutcome<T> {
    Hit(T),
    Computed(T),
}

impl<T> CacheOutcome<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheOutcome::Hit(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            CacheOutcome::Hit(v) | CacheOutcome::Computed(v) => v,
        }
    }
}

pub struct CacheStore {
    store: ArtifactStore,
    enabled: bool,
    in_flight: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(store: ArtifactStore, enabled: bool) -> Self {
        Self {
            store,
            enabled,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the cached artifact, or `None` on a miss. Corrupt entries are
    /// logged and reported as misses.
    pub async fn get<T: StageOutput>(&self, fingerprint: &Fingerprint) -> Option<T> {
        if !self.enabled {
            return None;
        }

        match self.lookup(fingerprint).await {
            Ok(found) => found,
            Err(corruption) => {
                warn!("⚠️ {} - regenerating", corruption);
                None
            }
        }
    }

    /// Persists `value` under `fingerprint`. Bodies and media copies are
    /// written before the entry record, so a crash never leaves an entry
    /// without its body.
    pub async fn put<T: StageOutput>(&self, stage: StageKind, fingerprint: &Fingerprint, value: &T) -> PipelineResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let object = ArtifactLocation::CacheObject(fingerprint.as_str().to_string());
        self.store.write_json(&object, value).await?;

        let mut referenced_files = Vec::new();
        for (position, file) in value.referenced_files().into_iter().enumerate() {
            let copy = ArtifactLocation::CacheMedia(media_name(fingerprint, position, &file));
            self.store.copy_in(&copy, &file).await?;
            referenced_files.push(FileDigest {
                sha256: sha256_of(&file).await?,
                path: file,
                stored: copy.relative_path(),
            });
        }

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            stage,
            created_at: Utc::now(),
            object: object.relative_path(),
            referenced_files,
        };
        self.store
            .write_json(&ArtifactLocation::CacheEntry(fingerprint.as_str().to_string()), &entry)
            .await?;

        debug!("💾 Cached {} artifact {}", stage, fingerprint.short());
        Ok(())
    }

    /// Serves `fingerprint` from the cache, or runs `compute` exactly once
    /// across concurrent callers and caches its successful result. Failed
    /// computations are not cached; the next waiter computes again.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        stage: StageKind,
        fingerprint: &Fingerprint,
        compute: F,
    ) -> Result<CacheOutcome<T>, E>
    where
        T: StageOutput,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.enabled {
            return compute().await.map(CacheOutcome::Computed);
        }

        if let Some(hit) = self.get::<T>(fingerprint).await {
            return Ok(CacheOutcome::Hit(hit));
        }

        let key_lock = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _guard = key_lock.lock().await;

            // Another caller may have finished while we were queued.
            if let Some(hit) = self.get::<T>(fingerprint).await {
                Ok(CacheOutcome::Hit(hit))
            } else {
                match compute().await {
                    Ok(value) => {
                        if let Err(e) = self.put(stage, fingerprint, &value).await {
                            warn!("⚠️ Failed to cache {} artifact {}: {}", stage, fingerprint.short(), e);
                        }
                        Ok(CacheOutcome::Computed(value))
                    }
                    Err(e) => Err(e),
                }
            }
        };

        self.release(fingerprint, &key_lock).await;
        result
    }

    /// Drops the per-key lock once nobody else is queued on it.
    async fn release(&self, fingerprint: &Fingerprint, key_lock: &Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        // One reference is held by the map, one by the caller.
        if Arc::strong_count(key_lock) <= 2 {
            in_flight.remove(fingerprint);
        }
    }

    async fn lookup<T: StageOutput>(&self, fingerprint: &Fingerprint) -> Result<Option<T>, CacheCorruption> {
        let corrupt = |reason: String| CacheCorruption {
            fingerprint: fingerprint.as_str().to_string(),
            reason,
        };

        let entry_location = ArtifactLocation::CacheEntry(fingerprint.as_str().to_string());
        let entry_bytes = match self.store.read(&entry_location).await {
            Ok(bytes) => bytes,
            Err(PipelineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(corrupt(format!("entry unreadable: {}", e))),
        };
        let entry: CacheEntry =
            serde_json::from_slice(&entry_bytes).map_err(|e| corrupt(format!("entry unparseable: {}", e)))?;

        if entry.fingerprint != *fingerprint {
            return Err(corrupt(format!("entry records fingerprint {}", entry.fingerprint)));
        }

        let body = tokio::fs::read(self.store.root().join(&entry.object))
            .await
            .map_err(|e| corrupt(format!("body `{}` unreadable: {}", entry.object.display(), e)))?;
        let value: T = serde_json::from_slice(&body).map_err(|e| corrupt(format!("body unparseable: {}", e)))?;

        for recorded in &entry.referenced_files {
            let stored = self.store.root().join(&recorded.stored);
            match sha256_of(&stored).await {
                Ok(digest) if digest == recorded.sha256 => {}
                Ok(_) => return Err(corrupt(format!("cached copy `{}` was modified", recorded.stored.display()))),
                Err(e) => {
                    return Err(corrupt(format!(
                        "cached copy `{}` is unreadable: {}",
                        recorded.stored.display(),
                        e
                    )))
                }
            }

            // A later run may have rewritten the scene file; put the cached body back.
            let current = sha256_of(&recorded.path).await.ok();
            if current.as_deref() != Some(recorded.sha256.as_str()) {
                copy_atomic(&stored, &recorded.path).await.map_err(|e| {
                    corrupt(format!("restoring `{}` failed: {}", recorded.path.display(), e))
                })?;
                debug!("📦 Restored {} from the cache", recorded.path.display());
            }
        }

        debug!("♻️ Cache hit for {} artifact {}", entry.stage, fingerprint.short());
        Ok(Some(value))
    }

    /// All readable entry records, for inspection.
    pub async fn entries(&self) -> PipelineResult<Vec<CacheEntry>> {
        let dir = self.store.root().join(CACHE_DIR).join("entries");
        let mut entries = Vec::new();
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = reader.next_entry().await? {
            let bytes = tokio::fs::read(item.path()).await?;
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("⚠️ Skipping unreadable cache entry {}: {}", item.path().display(), e),
            }
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MediaArtifact, Solution};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fp(problem: &str) -> Fingerprint {
        FingerprintInput::new(StageKind::Solve).prose("problem", problem).finish()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(ArtifactStore::new(dir.path()), true);
        let key = fp("Solve x^2 - 5x + 6 = 0");

        assert!(cache.get::<Solution>(&key).await.is_none());
        let solution = Solution { text: "x = 2 or x = 3".into() };
        cache.put(StageKind::Solve, &key, &solution).await.unwrap();
        assert_eq!(cache.get::<Solution>(&key).await, Some(solution));

        let entries = cache.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stage, StageKind::Solve);
    }

    #[tokio::test]
    async fn disabled_cache_always_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(ArtifactStore::new(dir.path()), false);
        let key = fp("Solve x^2 - 5x + 6 = 0");

        cache.put(StageKind::Solve, &key, &Solution { text: "x = 2".into() }).await.unwrap();
        assert!(cache.get::<Solution>(&key).await.is_none());
        assert!(cache.entries().await.unwrap().is_empty());

        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let outcome = cache
                .get_or_compute(StageKind::Solve, &key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(Solution { text: "x = 2".into() })
                })
                .await
                .unwrap();
            assert!(!outcome.is_hit());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn corrupt_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let cache = CacheStore::new(store.clone(), true);
        let key = fp("Solve x^2 - 5x + 6 = 0");

        cache.put(StageKind::Solve, &key, &Solution { text: "x = 2".into() }).await.unwrap();
        store
            .write(&ArtifactLocation::CacheObject(key.as_str().to_string()), "{not json")
            .await
            .unwrap();
        assert!(cache.get::<Solution>(&key).await.is_none());

        let outcome = cache
            .get_or_compute(StageKind::Solve, &key, || async {
                Ok::<_, String>(Solution { text: "x = 2 or x = 3".into() })
            })
            .await
            .unwrap();
        assert!(!outcome.is_hit());
        assert_eq!(cache.get::<Solution>(&key).await.unwrap().text, "x = 2 or x = 3");
    }

    #[tokio::test]
    async fn overwritten_media_is_restored_from_the_cache_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(ArtifactStore::new(dir.path()), true);
        let key = FingerprintInput::new(StageKind::Render).text("code", "class A(Scene): pass").finish();

        let video = dir.path().join("scene1").join("render.mp4");
        std::fs::create_dir_all(video.parent().unwrap()).unwrap();
        std::fs::write(&video, b"first render").unwrap();
        cache.put(StageKind::Render, &key, &MediaArtifact::new(&video)).await.unwrap();

        let copy = dir.path().join(".cache/objects").join(format!("{}.mp4", key.as_str()));
        assert_eq!(std::fs::read(&copy).unwrap(), b"first render");

        // Another problem's render lands on the same scene path.
        std::fs::write(&video, b"another problem's render").unwrap();
        assert_eq!(cache.get::<MediaArtifact>(&key).await, Some(MediaArtifact::new(&video)));
        assert_eq!(std::fs::read(&video).unwrap(), b"first render");

        std::fs::remove_file(&video).unwrap();
        assert!(cache.get::<MediaArtifact>(&key).await.is_some());
        assert_eq!(std::fs::read(&video).unwrap(), b"first render");
    }

    #[tokio::test]
    async fn damaged_cache_copy_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(ArtifactStore::new(dir.path()), true);
        let key = FingerprintInput::new(StageKind::Audio).prose("script", "Factor it.").finish();

        let audio = dir.path().join("audio.mp3");
        std::fs::write(&audio, b"narration").unwrap();
        cache.put(StageKind::Audio, &key, &MediaArtifact::new(&audio)).await.unwrap();

        let copy = dir.path().join(".cache/objects").join(format!("{}.mp3", key.as_str()));
        std::fs::write(&copy, b"truncated").unwrap();
        assert!(cache.get::<MediaArtifact>(&key).await.is_none());

        std::fs::remove_file(&copy).unwrap();
        assert!(cache.get::<MediaArtifact>(&key).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_requests_compute_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheStore::new(ArtifactStore::new(dir.path()), true));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = fp("Solve x^2 - 5x + 6 = 0");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute(StageKind::Solve, &key, || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, String>(Solution { text: "x = 2 or x = 3".into() })
                        })
                        .await
                })
            })
            .collect();

        let mut hits = 0;
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            if outcome.is_hit() {
                hits += 1;
            }
            assert_eq!(outcome.into_inner().text, "x = 2 or x = 3");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 7);
        assert!(cache.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_computations_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(ArtifactStore::new(dir.path()), true);
        let key = fp("Solve x^2 - 5x + 6 = 0");

        let failed = cache
            .get_or_compute(StageKind::Solve, &key, || async { Err::<Solution, _>("model offline") })
            .await;
        assert_eq!(failed.unwrap_err(), "model offline");
        assert!(cache.get::<Solution>(&key).await.is_none());
        assert!(cache.entries().await.unwrap().is_empty());
    }
}
