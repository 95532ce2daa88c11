// kiln-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};

use directories::UserDirs;
use tracing::debug;

use super::error::{KilnError, Result};

// Fallback if KILN_ROOT is not set or is empty.
const DEFAULT_FALLBACK_KILN_ROOT: &str = "/opt/kiln";
const MAX_DEFAULT_JOBS: usize = 6;

#[derive(Debug, Clone)]
pub struct Config {
    pub kiln_root: PathBuf,
    pub formula_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Number of targets that may be installed concurrently.
    pub jobs: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading kiln configuration");

        let kiln_root = env::var("KILN_ROOT")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                debug!(
                    "KILN_ROOT not set or empty, falling back to default: {}",
                    DEFAULT_FALLBACK_KILN_ROOT
                );
                PathBuf::from(DEFAULT_FALLBACK_KILN_ROOT)
            });
        debug!("Effective KILN_ROOT set to: {}", kiln_root.display());

        let formula_dir = env::var("KILN_FORMULA_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| kiln_root.join("Formula"));

        let cache_dir = env::var("KILN_CACHE_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| kiln_root.join("var").join("cache"));

        let jobs = match env::var("KILN_JOBS") {
            Ok(raw) if !raw.is_empty() => raw.parse::<usize>().map_err(|e| {
                KilnError::Config(format!("KILN_JOBS must be a positive integer ('{raw}'): {e}"))
            })?,
            _ => default_jobs(),
        };
        if jobs == 0 {
            return Err(KilnError::Config(
                "KILN_JOBS must be at least 1".to_string(),
            ));
        }

        debug!("Configuration loaded successfully (jobs={}).", jobs);
        Ok(Self {
            kiln_root,
            formula_dir,
            cache_dir,
            jobs,
        })
    }

    /// Builds a configuration rooted at `root`, used by tests and `--root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let kiln_root = root.into();
        Self {
            formula_dir: kiln_root.join("Formula"),
            cache_dir: kiln_root.join("var").join("cache"),
            kiln_root,
            jobs: 1,
        }
    }

    pub fn kiln_root(&self) -> &Path {
        &self.kiln_root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.kiln_root.join("bin")
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.kiln_root.join("Cellar")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.kiln_root.join("var").join("log")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.kiln_root.join("tmp")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.kiln_root.join("var").join("kiln")
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.state_dir().join("receipts")
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_keg_path(&self, formula_name: &str, version_str: &str) -> PathBuf {
        self.formula_cellar_dir(formula_name).join(version_str)
    }

    pub fn home_dir(&self) -> PathBuf {
        UserDirs::new().map_or_else(|| PathBuf::from("/"), |ud| ud.home_dir().to_path_buf())
    }
}

fn default_jobs() -> usize {
    std::cmp::max(1, num_cpus::get_physical().saturating_sub(1)).min(MAX_DEFAULT_JOBS)
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
