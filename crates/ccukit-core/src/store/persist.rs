// ── Disk persistence ──
//
// Flat JSON files, one per concern, named by controller host. A missing
// file is a cold start, not an error.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::CcuError;

#[derive(Debug, Clone)]
pub struct Persistence {
    dir: PathBuf,
    host: String,
}

impl Persistence {
    pub fn new(dir: impl Into<PathBuf>, host: &str) -> Self {
        // Hosts can be given as literal IPv6 addresses; keep filenames tame.
        let host = host.replace([':', '/', '\\'], "_");
        Persistence { dir: dir.into(), host }
    }

    /// Device/channel registry snapshot.
    pub fn registry_path(&self) -> PathBuf {
        self.dir.join(format!("ccu_{}.json", self.host))
    }

    /// Channel names, ids, rooms, functions, groups.
    pub fn rega_path(&self) -> PathBuf {
        self.dir.join(format!("ccu_rega_{}.json", self.host))
    }

    /// Last-known datapoint values.
    pub fn values_path(&self) -> PathBuf {
        self.dir.join(format!("ccu_values_{}.json", self.host))
    }

    /// Paramset descriptions are host-independent (schemas are keyed by
    /// device type and firmware), so all sessions share one file.
    pub fn paramsets_path(&self) -> PathBuf {
        self.dir.join("paramsets.json")
    }

    /// Load a persisted file; `None` on a cold start.
    pub fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, CcuError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no persisted state, cold start");
                return Ok(None);
            }
            Err(e) => {
                return Err(CcuError::Persist { path: path.to_owned(), message: e.to_string() });
            }
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| CcuError::Persist {
            path: path.to_owned(),
            message: e.to_string(),
        })
    }

    /// Like [`Persistence::load`], but degrades a corrupt or unreadable
    /// file to a cold start with a warning.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, path: &Path) -> T {
        match self.load(path) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => T::default(),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable persisted state");
                T::default()
            }
        }
    }

    pub fn save<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), CcuError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CcuError::Persist {
                path: path.to_owned(),
                message: e.to_string(),
            })?;
        }
        let bytes = serde_json::to_vec(value).map_err(|e| CcuError::Persist {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        fs::write(path, bytes).map_err(|e| CcuError::Persist {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        debug!(path = %path.display(), "state persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn missing_file_is_cold_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persist = Persistence::new(dir.path(), "ccu");
        let loaded: Option<BTreeMap<String, String>> =
            persist.load(&persist.registry_path()).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persist = Persistence::new(dir.path(), "192.168.1.10");
        let data = BTreeMap::from([("a".to_owned(), 1_i64)]);
        persist.save(&persist.values_path(), &data).expect("save");
        let loaded: Option<BTreeMap<String, i64>> =
            persist.load(&persist.values_path()).expect("load");
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn corrupt_file_degrades_to_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persist = Persistence::new(dir.path(), "ccu");
        std::fs::write(persist.rega_path(), b"{ not json").expect("write");
        let loaded: BTreeMap<String, String> = persist.load_or_default(&persist.rega_path());
        assert!(loaded.is_empty());
    }

    #[test]
    fn ipv6_host_is_filename_safe() {
        let persist = Persistence::new("/tmp", "fd00::1");
        assert!(persist.registry_path().to_string_lossy().contains("fd00__1"));
    }
}
