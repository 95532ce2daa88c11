// kiln-common/src/pipeline.rs
use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, KilnError};
use crate::model::{InstallSource, InstallationRecord};

/// Outcome of a test procedure. Never an error: a failing test leaves the
/// target installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TestResult {
    Passed { output: String },
    Failed { reason: String, output: String },
}

impl TestResult {
    pub fn passed(&self) -> bool {
        matches!(self, TestResult::Passed { .. })
    }

    pub fn output(&self) -> &str {
        match self {
            TestResult::Passed { output } | TestResult::Failed { output, .. } => output,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TargetStatus {
    Installed(InstallationRecord),
    /// Same payload already installed; nothing was run.
    AlreadyInstalled(InstallationRecord),
    Failed(KilnError),
    /// Not attempted because a dependency in the same plan failed.
    Blocked { dependency: String },
    /// Not attempted because the operation was aborted.
    Skipped,
}

impl TargetStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TargetStatus::Installed(_) | TargetStatus::AlreadyInstalled(_)
        )
    }

    pub fn record(&self) -> Option<&InstallationRecord> {
        match self {
            TargetStatus::Installed(r) | TargetStatus::AlreadyInstalled(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub name: String,
    pub status: TargetStatus,
    pub test: Option<TestResult>,
}

/// Everything a pipeline run produced, in install order.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub outcomes: Vec<TargetOutcome>,
    pub provided_externally: Vec<String>,
    /// Set when an error stopped the whole operation.
    pub aborted_by: Option<KilnError>,
}

impl PipelineReport {
    pub fn outcome(&self, name: &str) -> Option<&TargetOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_success()).count()
    }

    pub fn fail_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.aborted_by.is_none() && self.fail_count() == 0
    }

    pub fn failed_tests(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.test.as_ref().is_some_and(|t| !t.passed()))
    }

    /// Most severe error class in the report: an aborting error first, then
    /// any target failure. Blocked targets count as build failures.
    pub fn error_class(&self) -> Option<ErrorClass> {
        if let Some(err) = &self.aborted_by {
            return Some(err.class());
        }
        let mut worst = None;
        for outcome in &self.outcomes {
            let class = match &outcome.status {
                TargetStatus::Failed(e) => e.class(),
                TargetStatus::Blocked { .. } | TargetStatus::Skipped => ErrorClass::Build,
                _ => continue,
            };
            worst = Some(worst.map_or(class, |w: ErrorClass| w.worst(class)));
        }
        worst
    }
}

/// Progress notifications broadcast while a pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        targets: Vec<String>,
    },
    ResolutionFinished {
        install_order: Vec<String>,
        provided_externally: Vec<String>,
    },
    SourceSelected {
        target_id: String,
        source: InstallSource,
    },
    DownloadStarted {
        target_id: String,
        url: String,
    },
    DownloadFinished {
        target_id: String,
        url: String,
        size_bytes: u64,
    },
    BuildStarted {
        target_id: String,
    },
    StepStarted {
        target_id: String,
        index: usize,
        total: usize,
        command: String,
    },
    InstallStarted {
        target_id: String,
    },
    JobSuccess {
        target_id: String,
        version: String,
        already_installed: bool,
    },
    JobFailed {
        target_id: String,
        error: String,
    },
    JobBlocked {
        target_id: String,
        dependency: String,
    },
    TestStarted {
        target_id: String,
    },
    TestFinished {
        target_id: String,
        result: TestResult,
    },
    UninstallStarted {
        target_id: String,
        version: String,
    },
    UninstallFinished {
        target_id: String,
        version: String,
    },
    LogInfo {
        message: String,
    },
    LogWarn {
        message: String,
    },
    LogError {
        message: String,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
    },
}

impl PipelineEvent {
    pub fn job_failed(target_id: impl Into<String>, error: &KilnError) -> Self {
        PipelineEvent::JobFailed {
            target_id: target_id.into(),
            error: error.to_string(),
        }
    }
}
