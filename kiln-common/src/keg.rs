// kiln-common/src/keg.rs
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::config::Config;
use super::error::{KilnError, Result};
use super::model::InstallationRecord;

/// Durable store of installation records, one JSON file per manifest name.
///
/// Writers for the same name are serialised through [`ReceiptStore::lock`].
/// The name -> install path table is filled from disk at open and updated
/// under a write lock whenever a record is persisted or removed, so readers
/// resolving dependency paths see a record as soon as `put` returns.
#[derive(Debug)]
pub struct ReceiptStore {
    receipts_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    install_paths: RwLock<HashMap<String, PathBuf>>,
}

impl ReceiptStore {
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_dir(config.receipts_dir())
    }

    pub fn open_dir(receipts_dir: impl Into<PathBuf>) -> Result<Self> {
        let receipts_dir = receipts_dir.into();
        fs::create_dir_all(&receipts_dir)?;

        let store = Self {
            receipts_dir,
            locks: Mutex::new(HashMap::new()),
            install_paths: RwLock::new(HashMap::new()),
        };
        let records = store.list()?;
        {
            let mut table = store.write_table()?;
            for record in records {
                table.insert(record.name.clone(), record.install_path.clone());
            }
            debug!(
                "Opened receipt store at {} ({} records)",
                store.receipts_dir.display(),
                table.len()
            );
        }
        Ok(store)
    }

    pub fn receipts_dir(&self) -> &Path {
        &self.receipts_dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.receipts_dir.join(format!("{name}.json"))
    }

    fn write_table(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, PathBuf>>> {
        self.install_paths
            .write()
            .map_err(|_| KilnError::Generic("install path table lock poisoned".to_string()))
    }

    /// Per-name lock. Hold the guard for the whole install or uninstall of `name`.
    pub fn lock(&self, name: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| KilnError::Generic("receipt lock table poisoned".to_string()))?;
        Ok(locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    pub fn get(&self, name: &str) -> Result<Option<InstallationRecord>> {
        let path = self.record_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let record = serde_json::from_str(&raw).map_err(|e| {
            KilnError::ParseError("installation record", format!("{}: {e}", path.display()))
        })?;
        Ok(Some(record))
    }

    /// Persists `record` atomically and publishes its install path.
    pub fn put(&self, record: &InstallationRecord) -> Result<()> {
        let path = self.record_path(&record.name);
        let mut tmp = NamedTempFile::new_in(&self.receipts_dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| KilnError::Io(Arc::new(e.error)))?;
        debug!("[{}] Persisted installation record {}", record.name, path.display());

        self.write_table()?
            .insert(record.name.clone(), record.install_path.clone());
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<Option<InstallationRecord>> {
        let existing = self.get(name)?;
        let path = self.record_path(name);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("[{}] Removed installation record", name);
        }
        self.write_table()?.remove(name);
        Ok(existing)
    }

    /// All records, sorted by name. Unreadable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<InstallationRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.receipts_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(name) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    pub fn install_path(&self, name: &str) -> Option<PathBuf> {
        self.install_paths
            .read()
            .ok()
            .and_then(|table| table.get(name).cloned())
    }

    /// Install paths for `names`; every name must already have a record.
    pub fn install_paths_for<'n, I>(&self, names: I) -> Result<Vec<(String, PathBuf)>>
    where
        I: IntoIterator<Item = &'n String>,
    {
        names
            .into_iter()
            .map(|name| {
                self.install_path(name)
                    .map(|path| (name.clone(), path))
                    .ok_or_else(|| {
                        KilnError::NotFound(format!("dependency '{name}' is not installed"))
                    })
            })
            .collect()
    }

    /// Names of installed manifests whose records link against `name`.
    pub fn dependents_of(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.linked_dependencies.iter().any(|d| d == name))
            .map(|r| r.name)
            .collect())
    }

    /// Syncs the receipts directory. Called once at process exit.
    pub fn flush(&self) -> Result<()> {
        if let Ok(dir) = fs::File::open(&self.receipts_dir) {
            if let Err(e) = dir.sync_all() {
                debug!("Could not sync {}: {}", self.receipts_dir.display(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::InstallSource;

    fn record(name: &str, deps: &[&str]) -> InstallationRecord {
        InstallationRecord {
            name: name.to_string(),
            version: "1.0".to_string(),
            install_source: InstallSource::BuiltFromSource,
            payload_sha256: "ab".repeat(32),
            install_path: PathBuf::from(format!("/opt/kiln/Cellar/{name}/1.0")),
            installed_at: Utc::now(),
            linked_dependencies: deps.iter().map(|d| d.to_string()).collect(),
            provided_externally: Vec::new(),
        }
    }

    #[test]
    fn put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiptStore::open_dir(dir.path().join("receipts")).unwrap();
        assert!(store.get("kedge").unwrap().is_none());

        let rec = record("kedge", &["go"]);
        store.put(&rec).unwrap();
        assert_eq!(store.get("kedge").unwrap(), Some(rec.clone()));
        assert_eq!(store.install_path("kedge"), Some(rec.install_path.clone()));
        assert_eq!(store.dependents_of("go").unwrap(), vec!["kedge"]);

        assert_eq!(store.remove("kedge").unwrap(), Some(rec));
        assert!(store.get("kedge").unwrap().is_none());
        assert!(store.install_path("kedge").is_none());
    }

    #[test]
    fn reopening_restores_install_paths() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ReceiptStore::open_dir(dir.path()).unwrap();
            store.put(&record("a", &[])).unwrap();
            store.put(&record("b", &["a"])).unwrap();
            store.flush().unwrap();
        }
        fs::write(dir.path().join("junk.json"), "not json").unwrap();

        let store = ReceiptStore::open_dir(dir.path()).unwrap();
        let names: Vec<String> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        let paths = store
            .install_paths_for(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(paths[1].1, PathBuf::from("/opt/kiln/Cellar/b/1.0"));
        assert!(store.install_paths_for(&["zzz".to_string()]).is_err());
    }

    #[test]
    fn lock_is_shared_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiptStore::open_dir(dir.path()).unwrap();
        let a1 = store.lock("a").unwrap();
        let a2 = store.lock("a").unwrap();
        let b = store.lock("b").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
