use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::error::CacheError;

pub const CACHE_VERSION: u32 = 1;
const CACHE_FILE: &str = "cache.json";

/// The durable form of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub version: u32,
    pub entries: BTreeMap<String, CacheEntry>,
}

impl Default for CacheSnapshot {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Durable storage for the cache. Read once at start, written once at end.
pub trait CacheBackend: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<CacheSnapshot>, CacheError>;
    fn save(&self, snapshot: &CacheSnapshot) -> Result<(), CacheError>;
    fn describe(&self) -> String;
}

/// JSON document on disk, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    /// Store `cache.json` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(CACHE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<CacheSnapshot>, CacheError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: CacheSnapshot = serde_json::from_str(&content)?;
        if snapshot.version != CACHE_VERSION {
            return Err(CacheError::Version(snapshot.version));
        }
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &CacheSnapshot) -> Result<(), CacheError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process storage. Clones share the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    stored: Arc<Mutex<Option<CacheSnapshot>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// What was last saved.
    pub fn stored(&self) -> Option<CacheSnapshot> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self) -> Result<Option<CacheSnapshot>, CacheError> {
        Ok(self.stored())
    }

    fn save(&self, snapshot: &CacheSnapshot) -> Result<(), CacheError> {
        *self.stored.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::{Finding, Severity};

    fn snapshot() -> CacheSnapshot {
        let mut snap = CacheSnapshot::default();
        snap.entries.insert(
            "src/a.rs".into(),
            CacheEntry {
                fingerprint: "abc".into(),
                analyses: ["security".to_string()].into(),
                findings: vec![Finding {
                    severity: Severity::High,
                    category: "injection".into(),
                    file: "src/a.rs".into(),
                    line: Some(4),
                    message: "unsanitized input".into(),
                    analysis: "security".into(),
                }],
                timestamp: 42,
            },
        );
        snap
    }

    #[test]
    fn json_backend_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::in_dir(dir.path());
        assert!(backend.load().unwrap().is_none());
    }

    #[test]
    fn json_backend_persists_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::in_dir(&dir.path().join("nested"));
        backend.save(&snapshot()).unwrap();
        assert_eq!(backend.load().unwrap(), Some(snapshot()));
        assert!(!backend.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn json_backend_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::in_dir(dir.path());
        std::fs::write(backend.path(), "{not json").unwrap();
        assert!(matches!(backend.load(), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn json_backend_rejects_other_versions() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::in_dir(dir.path());
        std::fs::write(backend.path(), r#"{"version": 99, "entries": {}}"#).unwrap();
        assert!(matches!(backend.load(), Err(CacheError::Version(99))));
    }

    #[test]
    fn memory_backend_clones_share_state() {
        let backend = MemoryBackend::new();
        let other = backend.clone();
        backend.save(&snapshot()).unwrap();
        assert_eq!(other.load().unwrap(), Some(snapshot()));
    }
}
