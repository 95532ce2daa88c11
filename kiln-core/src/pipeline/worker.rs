// kiln-core/src/pipeline/worker.rs
// One unit of pipeline work: install a target, then optionally test it.

use std::sync::Arc;

use kiln_common::error::{KilnError, Result};
use kiln_common::model::{InstallSource, Manifest};
use kiln_common::pipeline::{PipelineEvent, TargetStatus, TestResult};
use tracing::{debug, instrument};

use crate::install::{self, InstallContext, InstallRequest};
use crate::test_runner::run_test;

#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub index: usize,
    pub manifest: Arc<Manifest>,
    pub source: InstallSource,
    pub linked_dependencies: Vec<String>,
    pub dependency_closure: Vec<String>,
    pub provided_externally: Vec<String>,
    pub run_test: bool,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub index: usize,
    pub status: TargetStatus,
    pub test: Option<TestResult>,
    /// Aborting error hit after the target itself was installed.
    pub abort: Option<KilnError>,
}

impl JobResult {
    /// Error that must stop the whole operation, if the job hit one.
    pub fn aborting_error(&self) -> Option<&KilnError> {
        match &self.status {
            TargetStatus::Failed(e) if e.aborts_operation() => Some(e),
            _ => self.abort.as_ref(),
        }
    }
}

#[instrument(skip_all, fields(job_id = %job.manifest.name))]
pub(super) fn execute_job(ctx: &InstallContext, job: WorkerJob) -> JobResult {
    let name = job.manifest.name.clone();
    let request = InstallRequest {
        manifest: &job.manifest,
        source: &job.source,
        linked_dependencies: &job.linked_dependencies,
        dependency_closure: &job.dependency_closure,
        provided_externally: &job.provided_externally,
    };

    let outcome = match install::install(ctx, request) {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!("[{}] Install failed: {}", name, e);
            ctx.emit(PipelineEvent::job_failed(&name, &e));
            return JobResult {
                index: job.index,
                status: TargetStatus::Failed(e),
                test: None,
                abort: None,
            };
        }
    };
    ctx.emit(PipelineEvent::JobSuccess {
        target_id: name.clone(),
        version: outcome.record.version.clone(),
        already_installed: outcome.already_installed,
    });

    let mut abort = None;
    let test = if job.run_test {
        match run_job_test(ctx, &job, &outcome.record.install_path) {
            Ok(result) => Some(result),
            Err(e) => {
                let failed = TestResult::Failed {
                    reason: e.to_string(),
                    output: String::new(),
                };
                if e.aborts_operation() {
                    debug!("[{}] Test aborted the run: {}", name, e);
                    abort = Some(e);
                }
                Some(failed)
            }
        }
    } else {
        None
    };

    let status = if outcome.already_installed {
        TargetStatus::AlreadyInstalled(outcome.record)
    } else {
        TargetStatus::Installed(outcome.record)
    };
    JobResult {
        index: job.index,
        status,
        test,
        abort,
    }
}

fn run_job_test(
    ctx: &InstallContext,
    job: &WorkerJob,
    install_path: &std::path::Path,
) -> Result<TestResult> {
    let dependencies = ctx.store.install_paths_for(&job.dependency_closure)?;
    run_test(ctx, &job.manifest, install_path, &dependencies)
}
