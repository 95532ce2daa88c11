// kiln-core/src/test_runner.rs
// Runs a manifest's test procedure against an installed prefix.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::keg::ReceiptStore;
use kiln_common::model::{InstallationRecord, Manifest};
use kiln_common::pipeline::{PipelineEvent, TestResult};
use tracing::{debug, instrument, warn};

use crate::build::env::StepEnvironment;
use crate::build::resource::ResourceStager;
use crate::build::steps::ProcedureRunner;
use crate::install::InstallContext;

/// Runs the test procedure of `manifest` in a throwaway directory. A failing
/// test is reported as [`TestResult::Failed`]; only cancellation, integrity
/// failures and setup problems are errors. Never touches the installation.
#[instrument(skip_all, fields(target = %manifest.name))]
pub fn run_test(
    ctx: &InstallContext,
    manifest: &Manifest,
    install_path: &Path,
    dependencies: &[(String, PathBuf)],
) -> Result<TestResult> {
    let Some(test) = &manifest.test else {
        debug!("[{}] No test procedure", manifest.name);
        return Ok(TestResult::Passed {
            output: format!("no test defined for '{}'", manifest.name),
        });
    };
    ctx.emit(PipelineEvent::TestStarted {
        target_id: manifest.name.clone(),
    });

    let tmp_root = ctx.config.tmp_dir();
    fs::create_dir_all(&tmp_root)?;
    let test_root = tempfile::Builder::new()
        .prefix(&format!("{}-test-", manifest.name))
        .tempdir_in(&tmp_root)?;
    let work_dir = test_root.path().join("testpath");
    let home_dir = test_root.path().join("home");
    fs::create_dir_all(&work_dir)?;
    fs::create_dir_all(&home_dir)?;

    let mut env = StepEnvironment::base(ctx.config.kiln_root(), &home_dir);
    let mut search: Vec<PathBuf> = vec![install_path.to_path_buf()];
    search.extend(dependencies.iter().map(|(_, p)| p.clone()));
    env.add_runtime_prefixes(&search);

    let stager = ResourceStager::new(manifest, ctx.downloader.as_ref(), &work_dir);
    let mut procedure = ProcedureRunner::new(
        &manifest.name,
        install_path,
        &work_dir,
        env,
        ctx.runner.as_ref(),
        &ctx.cancel,
    )
    .with_dependencies(dependencies)
    .with_stager(stager)
    .with_events(ctx.events.as_ref());

    let result = match procedure.run(&test.steps) {
        Ok(output) => match test
            .expect_output
            .iter()
            .find(|expected| !output.contains(expected.as_str()))
        {
            Some(missing) => TestResult::Failed {
                reason: format!("output does not contain '{missing}'"),
                output,
            },
            None => TestResult::Passed { output },
        },
        Err(e) if e.aborts_operation() => return Err(e),
        Err(KilnError::StepFailed {
            step_index,
            command,
            status,
            output,
            ..
        }) => TestResult::Failed {
            reason: format!("step {step_index} failed ({status}): {command}"),
            output,
        },
        Err(e) => TestResult::Failed {
            reason: e.to_string(),
            output: String::new(),
        },
    };

    if let TestResult::Failed { reason, .. } = &result {
        warn!("[{}] Test failed: {}", manifest.name, reason);
    }
    ctx.emit(PipelineEvent::TestFinished {
        target_id: manifest.name.clone(),
        result: result.clone(),
    });
    Ok(result)
}

/// Tests an already installed target, making the prefixes of everything it
/// links against (transitively, per the installation records) visible.
pub fn test_installed(ctx: &InstallContext, manifest: &Manifest) -> Result<TestResult> {
    let record = ctx
        .store
        .get(&manifest.name)?
        .ok_or_else(|| KilnError::NotFound(format!("'{}' is not installed", manifest.name)))?;
    let dependencies = linked_closure(&ctx.store, &record)?;
    run_test(ctx, manifest, &record.install_path, &dependencies)
}

fn linked_closure(
    store: &ReceiptStore,
    record: &InstallationRecord,
) -> Result<Vec<(String, PathBuf)>> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    let mut pending: Vec<String> = record.linked_dependencies.clone();
    while let Some(name) = pending.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        match store.get(&name)? {
            Some(dep) => {
                pending.extend(dep.linked_dependencies.iter().cloned());
                ordered.push((name, dep.install_path));
            }
            None => warn!(
                "[{}] Linked dependency '{}' has no installation record",
                record.name, name
            ),
        }
    }
    Ok(ordered)
}
