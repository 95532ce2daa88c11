// kiln-core/src/uninstall.rs
// Removes installed prefixes and their records.

use std::fs;
use std::path::{Component, Path};

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::{check_path_component, InstallationRecord};
use kiln_common::pipeline::PipelineEvent;
use tracing::{debug, error, info, warn};

use crate::install::InstallContext;

#[derive(Debug, Clone, Copy, Default)]
pub struct UninstallOptions {
    /// Remove even when other installed records link against the target.
    pub ignore_dependencies: bool,
}

/// Fails unless `path` lies strictly below the Cellar, both as written and
/// once symlinks are resolved.
pub fn ensure_inside_cellar(config: &Config, path: &Path) -> Result<()> {
    let cellar = config.cellar_dir();
    let refuse = || {
        Err(KilnError::InstallError(format!(
            "Refusing to touch '{}': not inside {}",
            path.display(),
            cellar.display()
        )))
    };

    let relative = match path.strip_prefix(&cellar) {
        Ok(relative) => relative,
        Err(_) => return refuse(),
    };
    let mut components = relative.components().peekable();
    if components.peek().is_none() || !components.all(|c| matches!(c, Component::Normal(_))) {
        return refuse();
    }

    if path.exists() {
        let resolved = fs::canonicalize(path)?;
        let resolved_cellar = fs::canonicalize(&cellar)?;
        if resolved == resolved_cellar || !resolved.starts_with(&resolved_cellar) {
            return refuse();
        }
    }
    Ok(())
}

/// Deletes the keg directory of `record`, and the per-name Cellar directory
/// when it becomes empty.
pub fn remove_keg(config: &Config, record: &InstallationRecord) -> Result<()> {
    let path = &record.install_path;
    ensure_inside_cellar(config, path)?;
    if path.exists() {
        debug!("[{}] Removing keg directory {}", record.name, path.display());
        fs::remove_dir_all(path).map_err(|e| {
            error!("Failed to remove keg {}: {}", path.display(), e);
            KilnError::InstallError(format!(
                "Failed to remove keg directory {}: {}",
                path.display(),
                e
            ))
        })?;
    } else {
        warn!(
            "[{}] Keg directory {} not found; it might have been removed already",
            record.name,
            path.display()
        );
    }

    let name_dir = config.formula_cellar_dir(&record.name);
    if name_dir
        .read_dir()
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
    {
        let _ = fs::remove_dir(&name_dir);
    }
    Ok(())
}

/// Uninstalls `name`, returning the record that was removed.
pub fn uninstall(
    ctx: &InstallContext,
    name: &str,
    options: UninstallOptions,
) -> Result<InstallationRecord> {
    check_path_component("formula name", name)?;
    let lock = ctx.store.lock(name)?;
    let _guard = lock
        .lock()
        .map_err(|_| KilnError::Generic(format!("install lock for '{name}' poisoned")))?;

    let record = ctx
        .store
        .get(name)?
        .ok_or_else(|| KilnError::NotFound(format!("'{name}' is not installed")))?;

    let dependents: Vec<String> = ctx
        .store
        .dependents_of(name)?
        .into_iter()
        .filter(|d| d != name)
        .collect();
    if !dependents.is_empty() {
        if !options.ignore_dependencies {
            return Err(KilnError::InstallError(format!(
                "Refusing to uninstall '{}': required by {}",
                name,
                dependents.join(", ")
            )));
        }
        warn!(
            "[{}] Uninstalling although {} depend on it",
            name,
            dependents.join(", ")
        );
    }

    ctx.emit(PipelineEvent::UninstallStarted {
        target_id: name.to_string(),
        version: record.version.clone(),
    });
    remove_keg(&ctx.config, &record)?;
    ctx.store.remove(name)?;
    ctx.emit(PipelineEvent::UninstallFinished {
        target_id: name.to_string(),
        version: record.version.clone(),
    });
    info!("[{}] Uninstalled {}", name, record.version);
    Ok(record)
}
