// kiln-common/src/formulary.rs
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::config::Config;
use super::error::{KilnError, Result};
use super::model::Manifest;

/// The universe of known manifests, keyed by name.
#[derive(Debug, Default, Clone)]
pub struct Formulary {
    manifests: HashMap<String, Arc<Manifest>>,
}

impl Formulary {
    /// Loads every `*.json` manifest in the configured formula directory.
    pub fn load(config: &Config) -> Result<Self> {
        Self::load_dir(&config.formula_dir)
    }

    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(KilnError::Config(format!(
                "Formula directory {} does not exist",
                dir.display()
            )));
        }

        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut manifests = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = fs::read_to_string(&path)?;
            let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| {
                KilnError::ParseError("manifest", format!("{}: {e}", path.display()))
            })?;
            let expected_name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if manifest.name != expected_name {
                warn!(
                    "Manifest {} declares name '{}' which differs from its file name",
                    path.display(),
                    manifest.name
                );
            }
            manifests.push(manifest);
        }
        debug!("Loaded {} manifests from {}", manifests.len(), dir.display());
        Self::from_manifests(manifests)
    }

    /// Builds a universe from already-parsed manifests, validating each one and
    /// rejecting duplicate names.
    pub fn from_manifests<I>(manifests: I) -> Result<Self>
    where
        I: IntoIterator<Item = Manifest>,
    {
        let mut map = HashMap::new();
        for manifest in manifests {
            manifest.validate()?;
            let name = manifest.name.clone();
            if map.insert(name.clone(), Arc::new(manifest)).is_some() {
                return Err(KilnError::ValidationError(format!(
                    "manifest name '{name}' is declared more than once"
                )));
            }
        }
        Ok(Self { manifests: map })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Manifest>> {
        self.manifests.get(name).cloned()
    }

    pub fn load_manifest(&self, name: &str) -> Result<Arc<Manifest>> {
        self.get(name)
            .ok_or_else(|| KilnError::NotFound(format!("No manifest named '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.manifests.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.manifests.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
