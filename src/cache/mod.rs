//! Incremental result cache keyed by path and content fingerprint.
//!
//! A lookup is a hit only when the stored fingerprint equals the file's
//! current fingerprint and the stored entry covers every analysis now
//! required. Anything else is a miss. If the durable store cannot be read the
//! cache starts empty, so the gate degrades to analyzing everything.

/// Durable storage behind the cache.
pub mod backend;

pub use backend::{CacheBackend, CacheSnapshot, JsonFileBackend, MemoryBackend};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::finding::Finding;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    /// Analyses whose results are included in `findings`.
    pub analyses: BTreeSet<String>,
    pub findings: Vec<Finding>,
    /// Unix seconds of the last write.
    pub timestamp: u64,
}

/// In-memory view of the cache for one invocation.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: Mutex<BTreeMap<String, CacheEntry>>,
    dirty: AtomicBool,
    unavailable: Option<String>,
}

impl CacheStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read the durable cache. Read failures leave the store empty and
    /// marked unavailable.
    pub fn open(backend: &dyn CacheBackend) -> Self {
        match backend.load() {
            Ok(snapshot) => {
                let entries = snapshot.map(|s| s.entries).unwrap_or_default();
                log::debug!("loaded {} cache entries from {}", entries.len(), backend.describe());
                Self {
                    entries: Mutex::new(entries),
                    ..Self::default()
                }
            }
            Err(e) => {
                log::warn!("{e} ({}); analyzing every file", backend.describe());
                Self {
                    unavailable: Some(e.to_string()),
                    ..Self::default()
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Why the durable cache could not be read, if it could not.
    pub fn unavailable(&self) -> Option<&str> {
        self.unavailable.as_deref()
    }

    /// The entry for `path` if it is still valid for `fingerprint` and covers
    /// `required`.
    pub fn lookup(
        &self,
        path: &str,
        fingerprint: &str,
        required: &BTreeSet<String>,
    ) -> Option<CacheEntry> {
        let entries = self.lock();
        let entry = entries.get(path)?;
        if entry.fingerprint != fingerprint {
            log::trace!("cache miss (fingerprint changed): {path}");
            return None;
        }
        if !required.is_subset(&entry.analyses) {
            log::trace!("cache miss (new analyses required): {path}");
            return None;
        }
        Some(entry.clone())
    }

    /// Record fresh results. Last writer wins.
    pub fn put(
        &self,
        path: &str,
        fingerprint: &str,
        analyses: BTreeSet<String>,
        findings: Vec<Finding>,
        now: u64,
    ) {
        self.lock().insert(
            path.to_string(),
            CacheEntry {
                fingerprint: fingerprint.to_string(),
                analyses,
                findings,
                timestamp: now,
            },
        );
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.lock();
        if !entries.is_empty() {
            log::info!("invalidating {} cache entries", entries.len());
            entries.clear();
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Drop entries older than `max_age_secs` whose paths are not in `keep`.
    /// Returns the number dropped.
    pub fn evict_stale(&self, keep: &BTreeSet<&str>, now: u64, max_age_secs: u64) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|path, entry| {
            keep.contains(path.as_str()) || now.saturating_sub(entry.timestamp) <= max_age_secs
        });
        let dropped = before - entries.len();
        if dropped > 0 {
            log::debug!("evicted {dropped} stale cache entries");
            self.dirty.store(true, Ordering::SeqCst);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            entries: self.lock().clone(),
            ..CacheSnapshot::default()
        }
    }

    /// Write back through `backend` if anything changed. Returns whether a
    /// write happened.
    pub fn persist(&self, backend: &dyn CacheBackend) -> Result<bool, CacheError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        backend.save(&self.snapshot())?;
        self.dirty.store(false, Ordering::SeqCst);
        log::debug!("saved {} cache entries to {}", self.len(), backend.describe());
        Ok(true)
    }
}
