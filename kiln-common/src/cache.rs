// kiln-common/src/cache.rs
// Content-addressed cache of downloaded payloads.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use super::error::{KilnError, Result};
use crate::Config;

/// Cache of fetched payloads keyed by their declared sha256.
///
/// Entries are never trusted on their own: callers must verify the bytes
/// they get back before use.
#[derive(Debug, Clone)]
pub struct Cache {
    cache_dir: PathBuf,
}

impl Cache {
    pub fn new(config: &Config) -> Result<Self> {
        Self::new_in(config.cache_dir())
    }

    pub fn new_in(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir)?;
        }
        Ok(Self { cache_dir })
    }

    pub fn get_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// `<cache>/<sha256>--<last url segment>`
    pub fn entry_path(&self, sha256: &str, url: &str) -> PathBuf {
        let file_name = url
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("payload");
        let file_name: String = file_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "._-@+".contains(c) { c } else { '_' })
            .collect();
        self.cache_dir
            .join(format!("{}--{file_name}", sha256.to_ascii_lowercase()))
    }

    pub fn load(&self, sha256: &str, url: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(sha256, url);
        if !path.is_file() {
            return Ok(None);
        }
        tracing::debug!("Loading cached payload {}", path.display());
        fs::read(&path)
            .map(Some)
            .map_err(|e| KilnError::Cache(format!("Failed to read {}: {e}", path.display())))
    }

    /// Stores `bytes` atomically; concurrent writers of the same entry are harmless.
    pub fn store(&self, sha256: &str, url: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.entry_path(sha256, url);
        let mut tmp = NamedTempFile::new_in(&self.cache_dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(&path)
            .map_err(|e| KilnError::Io(Arc::new(e.error)))?;
        tracing::debug!("Cached {} bytes at {}", bytes.len(), path.display());
        Ok(path)
    }

    pub fn remove(&self, sha256: &str, url: &str) -> Result<()> {
        let path = self.entry_path(sha256, url);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)?;
            fs::create_dir_all(&self.cache_dir)?;
        }
        Ok(())
    }
}
