//! Per-backend bookkeeping of compiled versions and in-flight compilations

use crate::utils::lock;
use crate::version::{Artifact, RuntimeState, VersionId};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Condvar, Mutex, PoisonError, Weak};

/// A compiled version as seen by its backend.
#[derive(Debug)]
pub(crate) struct Record {
    pub(crate) artifact: Artifact,
    /// Lets teardown reset versions that are still alive.
    pub(crate) runtime: Weak<Mutex<RuntimeState>>,
}

/// State owned by one backend instance.
///
/// Tracks which versions were compiled (for bulk cleanup) and serializes
/// compilations that target the same fingerprint. Versions with equal
/// fingerprints share one artifact; it stays on disk while any of them is
/// recorded here.
#[derive(Debug, Default)]
pub struct ArtifactRegistry {
    compiled: Mutex<BTreeMap<VersionId, Record>>,
    in_flight: Mutex<HashSet<String>>,
    released: Condvar,
    log_lock: Mutex<()>,
}

/// Held while a fingerprint is being compiled; released on drop.
pub struct FingerprintGuard<'a> {
    registry: &'a ArtifactRegistry,
    fingerprint: String,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(
        &self,
        id: VersionId,
        artifact: &Artifact,
        runtime: Weak<Mutex<RuntimeState>>,
    ) {
        let record = Record {
            artifact: artifact.clone(),
            runtime,
        };
        lock(&self.compiled).insert(id, record);
    }

    pub fn forget(&self, id: VersionId) -> Option<Artifact> {
        lock(&self.compiled).remove(&id).map(|record| record.artifact)
    }

    #[cfg(test)]
    pub(crate) fn artifact_of(&self, id: VersionId) -> Option<Artifact> {
        lock(&self.compiled).get(&id).map(|record| record.artifact.clone())
    }

    /// Whether a recorded version still uses `path` as its artifact, log or manifest.
    pub fn is_referenced(&self, path: &Path) -> bool {
        lock(&self.compiled).values().any(|record| {
            let artifact = &record.artifact;
            artifact.path == path || artifact.log == path || artifact.manifest == path
        })
    }

    pub fn compiled_versions(&self) -> Vec<VersionId> {
        lock(&self.compiled).keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.compiled).is_empty()
    }

    /// Remove and return every record.
    pub(crate) fn drain(&self) -> Vec<Record> {
        std::mem::take(&mut *lock(&self.compiled)).into_values().collect()
    }

    /// Block until no other compilation of `fingerprint` is running, then claim it.
    pub fn lock_fingerprint(&self, fingerprint: &str) -> FingerprintGuard<'_> {
        let mut busy = lock(&self.in_flight);
        while busy.contains(fingerprint) {
            log::debug!("Waiting for in-flight compilation of {}", fingerprint);
            busy = self
                .released
                .wait(busy)
                .unwrap_or_else(PoisonError::into_inner);
        }
        busy.insert(fingerprint.to_string());
        FingerprintGuard {
            registry: self,
            fingerprint: fingerprint.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self, fingerprint: &str) -> bool {
        lock(&self.in_flight).contains(fingerprint)
    }

    pub(crate) fn log_lock(&self) -> &Mutex<()> {
        &self.log_lock
    }
}

impl Drop for FingerprintGuard<'_> {
    fn drop(&mut self) {
        lock(&self.registry.in_flight).remove(&self.fingerprint);
        self.registry.released.notify_all();
    }
}
