// kiln-core/src/build/source.rs
// Builds a manifest from its verified source archive into an install prefix.

use std::fs;
use std::path::{Path, PathBuf};

use kiln_common::error::Result;
use kiln_common::model::Manifest;
use kiln_common::pipeline::PipelineEvent;
use tracing::{debug, instrument};

use super::env::StepEnvironment;
use super::resource::ResourceStager;
use super::steps::ProcedureRunner;
use crate::install::extract::{extract_payload, Strip};
use crate::install::InstallContext;

/// Extracts `source_archive` into a private working directory and runs the
/// install procedure against `prefix`. The working directory is removed when
/// this returns, whether the build succeeded or not. Returns the number of
/// steps run.
#[instrument(skip_all, fields(target = %manifest.name))]
pub fn build_from_source(
    ctx: &InstallContext,
    manifest: &Manifest,
    source_url: &str,
    source_archive: &[u8],
    prefix: &Path,
    dependencies: &[(String, PathBuf)],
) -> Result<usize> {
    let tmp_root = ctx.config.tmp_dir();
    fs::create_dir_all(&tmp_root)?;
    let work_root = tempfile::Builder::new()
        .prefix(&format!("{}-", manifest.name))
        .tempdir_in(&tmp_root)?;
    let src_dir = work_root.path().join("src");
    let home_dir = work_root.path().join("home");
    fs::create_dir_all(&home_dir)?;
    debug!(
        "[{}] Building in {}",
        manifest.name,
        work_root.path().display()
    );

    extract_payload(source_archive, source_url, &src_dir, Strip::SingleRoot)?;
    fs::create_dir_all(prefix)?;

    let mut env = StepEnvironment::base(ctx.config.kiln_root(), &home_dir);
    env.add_build_dependencies(dependencies);

    ctx.emit(PipelineEvent::BuildStarted {
        target_id: manifest.name.clone(),
    });
    let steps = &manifest.install.steps;
    let mut stager = ResourceStager::new(manifest, ctx.downloader.as_ref(), &src_dir);
    stager.stage_unreferenced(steps)?;
    let mut procedure = ProcedureRunner::new(
        &manifest.name,
        prefix,
        &src_dir,
        env,
        ctx.runner.as_ref(),
        &ctx.cancel,
    )
    .with_dependencies(dependencies)
    .with_env_overrides(&manifest.env)
    .with_stager(stager)
    .with_events(ctx.events.as_ref());
    procedure.run(steps)?;

    debug!(
        "[{}] Ran {} step(s) into {}",
        manifest.name,
        steps.len(),
        prefix.display()
    );
    Ok(steps.len())
}
