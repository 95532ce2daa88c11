use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum KilnError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Dependency cycle detected: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("Cannot select an install source for '{target}': {reason}")]
    FatalConfig { target: String, reason: String },

    #[error("Checksum mismatch for {what} of '{target}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        target: String,
        what: String,
        expected: String,
        actual: String,
    },

    #[error("DownloadError: Failed to download '{0}' from '{1}': {2}")]
    DownloadError(String, String, String),

    #[error(
        "Step {step_index} of '{target}' failed ({status}): {command}\n{output}"
    )]
    StepFailed {
        target: String,
        step_index: usize,
        command: String,
        status: String,
        output: String,
    },

    #[error("Installation Error: {0}")]
    InstallError(String),

    #[error("Build environment setup failed: {0}")]
    BuildEnvError(String),

    #[error("Failed to execute command: {0}")]
    CommandExecError(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Validation Error: {0}")]
    ValidationError(String),

    #[error("Archive Error: {0}")]
    ArchiveError(String),

    #[error("Cache Error: {0}")]
    Cache(String),

    #[error("Parsing Error in {0}: {1}")]
    ParseError(&'static str, String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

/// Coarse grouping used by the CLI to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Resolution,
    Integrity,
    Build,
    Other,
}

impl ErrorClass {
    fn rank(self) -> u8 {
        match self {
            ErrorClass::Other => 0,
            ErrorClass::Build => 1,
            ErrorClass::Resolution => 2,
            ErrorClass::Integrity => 3,
        }
    }

    /// The more severe of two classes: integrity, then resolution, then build.
    pub fn worst(self, other: ErrorClass) -> ErrorClass {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl KilnError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KilnError::DependencyCycle { .. }
            | KilnError::NotFound(_)
            | KilnError::FatalConfig { .. } => ErrorClass::Resolution,
            KilnError::ChecksumMismatch { .. } => ErrorClass::Integrity,
            KilnError::StepFailed { .. }
            | KilnError::InstallError(_)
            | KilnError::BuildEnvError(_)
            | KilnError::CommandExecError(_)
            | KilnError::ArchiveError(_) => ErrorClass::Build,
            _ => ErrorClass::Other,
        }
    }

    /// Errors that stop the whole requested operation rather than one target.
    pub fn aborts_operation(&self) -> bool {
        matches!(
            self,
            KilnError::DependencyCycle { .. }
                | KilnError::FatalConfig { .. }
                | KilnError::ChecksumMismatch { .. }
                | KilnError::Cancelled(_)
        )
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        KilnError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Json(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
