// kiln-core/src/install/mod.rs
// Install orchestration: one manifest, one chosen source, one prefix.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::ReceiptStore;
use kiln_common::model::{Artifact, InstallSource, InstallationRecord, Manifest, SourceLocator};
use kiln_common::pipeline::PipelineEvent;
use kiln_net::Downloader;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::build::source::build_from_source;
use crate::process::{CancelToken, CommandRunner, SystemCommandRunner};
use crate::uninstall::{ensure_inside_cellar, remove_keg};

pub mod bottle;
pub mod extract;

/// Shared services for installs, tests and uninstalls in one operation.
#[derive(Clone)]
pub struct InstallContext {
    pub config: Config,
    pub store: Arc<ReceiptStore>,
    pub downloader: Arc<Downloader>,
    pub runner: Arc<dyn CommandRunner>,
    pub cancel: CancelToken,
    pub events: Option<broadcast::Sender<PipelineEvent>>,
}

impl InstallContext {
    pub fn new(config: Config, store: Arc<ReceiptStore>, downloader: Arc<Downloader>) -> Self {
        Self {
            config,
            store,
            downloader,
            runner: Arc::new(SystemCommandRunner),
            cancel: CancelToken::new(),
            events: None,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Everything needed to install one target.
#[derive(Debug, Clone, Copy)]
pub struct InstallRequest<'a> {
    pub manifest: &'a Manifest,
    pub source: &'a InstallSource,
    /// Direct dependencies, recorded in the installation record.
    pub linked_dependencies: &'a [String],
    /// Every dependency whose prefix is visible to the build, in install order.
    pub dependency_closure: &'a [String],
    pub provided_externally: &'a [String],
}

impl<'a> InstallRequest<'a> {
    pub fn new(manifest: &'a Manifest, source: &'a InstallSource) -> Self {
        Self {
            manifest,
            source,
            linked_dependencies: &[],
            dependency_closure: &[],
            provided_externally: &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub record: InstallationRecord,
    /// The same payload was already installed; nothing ran.
    pub already_installed: bool,
    pub steps_run: usize,
}

/// The payload an install source refers to, and its artifact entry if any.
pub fn payload_for<'m>(
    manifest: &'m Manifest,
    source: &InstallSource,
) -> Result<(SourceLocator, Option<&'m Artifact>)> {
    match source {
        InstallSource::Artifact { platform } => {
            let artifact = manifest.artifacts.get(platform).ok_or_else(|| KilnError::FatalConfig {
                target: manifest.name.clone(),
                reason: format!("no artifact declared for platform '{platform}'"),
            })?;
            let locator = SourceLocator {
                url: artifact.url.clone(),
                sha256: artifact.sha256.clone(),
                mirrors: Vec::new(),
            };
            Ok((locator, Some(artifact)))
        }
        InstallSource::BuiltFromSource => {
            let locator = manifest.source.clone().ok_or_else(|| KilnError::FatalConfig {
                target: manifest.name.clone(),
                reason: "no source declared".to_string(),
            })?;
            Ok((locator, None))
        }
    }
}

/// Installs one target and persists its record before returning.
#[instrument(skip_all, fields(target = %request.manifest.name))]
pub fn install(ctx: &InstallContext, request: InstallRequest<'_>) -> Result<InstallOutcome> {
    let manifest = request.manifest;
    manifest.check_identity()?;
    let name = manifest.name.as_str();
    let lock = ctx.store.lock(name)?;
    let _guard = lock
        .lock()
        .map_err(|_| KilnError::Generic(format!("install lock for '{name}' poisoned")))?;

    let (locator, artifact) = payload_for(manifest, request.source)?;
    let version = manifest.version_str_full();
    let prefix = ctx.config.formula_keg_path(name, &version);
    ensure_inside_cellar(&ctx.config, &prefix)?;

    let existing = ctx.store.get(name)?;
    if let Some(existing) = &existing {
        if existing.matches_payload(&locator.sha256)
            && existing.version == version
            && existing.install_path.is_dir()
        {
            info!("[{}] {} is already installed", name, version);
            return Ok(InstallOutcome {
                record: existing.clone(),
                already_installed: true,
                steps_run: 0,
            });
        }
    }

    ctx.cancel.check(name)?;
    let dependency_paths = ctx.store.install_paths_for(request.dependency_closure)?;

    ctx.emit(PipelineEvent::DownloadStarted {
        target_id: name.to_string(),
        url: locator.url.clone(),
    });
    let what = if artifact.is_some() { "artifact" } else { "source" };
    let bytes = ctx.downloader.fetch_verified(&locator, name, what)?;
    ctx.emit(PipelineEvent::DownloadFinished {
        target_id: name.to_string(),
        url: locator.url.clone(),
        size_bytes: bytes.len() as u64,
    });
    ctx.cancel.check(name)?;

    // The previous install stays in place until the new payload is verified.
    if let Some(existing) = existing {
        debug!(
            "[{}] Installed payload {} differs; replacing {}",
            name, existing.payload_sha256, existing.version
        );
        remove_keg(&ctx.config, &existing)?;
        ctx.store.remove(name)?;
    }

    ctx.emit(PipelineEvent::InstallStarted {
        target_id: name.to_string(),
    });
    let steps_run = match artifact {
        Some(artifact) => {
            bottle::install_artifact(name, &bytes, artifact, &prefix, &ctx.config)?;
            0
        }
        None => {
            if prefix.exists() {
                debug!("[{}] Clearing leftover prefix {}", name, prefix.display());
                fs::remove_dir_all(&prefix)?;
            }
            build_from_source(ctx, manifest, &locator.url, &bytes, &prefix, &dependency_paths)?
        }
    };

    let record = InstallationRecord {
        name: name.to_string(),
        version,
        install_source: request.source.clone(),
        payload_sha256: locator.sha256.to_ascii_lowercase(),
        install_path: prefix,
        installed_at: Utc::now(),
        linked_dependencies: request.linked_dependencies.to_vec(),
        provided_externally: request.provided_externally.to_vec(),
    };
    ctx.store.put(&record)?;
    info!(
        "[{}] Installed {} ({}) to {}",
        name,
        record.version,
        record.install_source,
        record.install_path.display()
    );
    Ok(InstallOutcome {
        record,
        already_installed: false,
        steps_run,
    })
}

/// Prefix paths for `names`, for callers outside an install.
pub fn installed_prefixes(store: &ReceiptStore, names: &[String]) -> Result<Vec<PathBuf>> {
    Ok(store
        .install_paths_for(names)?
        .into_iter()
        .map(|(_, path)| path)
        .collect())
}
