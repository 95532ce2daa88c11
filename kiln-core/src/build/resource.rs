// kiln-core/src/build/resource.rs
// Fetches and unpacks a manifest's auxiliary resources into the build tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::{Manifest, Step};
use kiln_net::Downloader;
use tracing::debug;

use crate::install::extract::{extract_payload, Strip};

/// Stages resources on demand. Each resource is downloaded and verified at
/// most once per stager unless a step explicitly stages it again elsewhere.
pub struct ResourceStager<'a> {
    manifest: &'a Manifest,
    downloader: &'a Downloader,
    work_dir: &'a Path,
    staged: HashMap<String, PathBuf>,
}

impl<'a> ResourceStager<'a> {
    pub fn new(manifest: &'a Manifest, downloader: &'a Downloader, work_dir: &'a Path) -> Self {
        Self {
            manifest,
            downloader,
            work_dir,
            staged: HashMap::new(),
        }
    }

    pub fn staged(&self) -> &HashMap<String, PathBuf> {
        &self.staged
    }

    /// Downloads, verifies and unpacks `name` into `into` (or its default
    /// destination under the working directory).
    pub fn stage(&mut self, name: &str, into: Option<PathBuf>) -> Result<PathBuf> {
        let resource = self.manifest.resource(name).ok_or_else(|| {
            KilnError::ValidationError(format!(
                "manifest '{}': unknown resource '{}'",
                self.manifest.name, name
            ))
        })?;
        let dest = into.unwrap_or_else(|| self.work_dir.join(resource.staging_destination()));
        debug!(
            "[{}] Staging resource '{}' into {}",
            self.manifest.name,
            name,
            dest.display()
        );
        let bytes = self.downloader.fetch_verified(
            &resource.locator(),
            &self.manifest.name,
            &format!("resource '{name}'"),
        )?;
        extract_payload(&bytes, &resource.url, &dest, Strip::SingleRoot)?;
        self.staged.insert(name.to_string(), dest.clone());
        Ok(dest)
    }

    /// Stages everything `step` refers to that is not staged yet.
    pub fn stage_referenced(&mut self, step: &Step) -> Result<()> {
        for name in step.referenced_resources() {
            if !self.staged.contains_key(name) {
                self.stage(name, None)?;
            }
        }
        Ok(())
    }

    /// Stages resources no step mentions at all; they are placed at their
    /// default destinations before the first step runs.
    pub fn stage_unreferenced(&mut self, steps: &[Step]) -> Result<()> {
        let mentioned: Vec<&str> = steps
            .iter()
            .flat_map(|s| {
                let mut names = s.referenced_resources();
                names.extend(s.staged_resource());
                names
            })
            .collect();
        let pending: Vec<String> = self
            .manifest
            .resources
            .iter()
            .filter(|r| !mentioned.contains(&r.name.as_str()) && !self.staged.contains_key(&r.name))
            .map(|r| r.name.clone())
            .collect();
        for name in pending {
            self.stage(&name, None)?;
        }
        Ok(())
    }
}
