// kiln-common/src/model/record.rs
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::platform::PlatformKey;

/// Where an installed prefix came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstallSource {
    Artifact { platform: PlatformKey },
    BuiltFromSource,
}

impl InstallSource {
    pub fn is_artifact(&self) -> bool {
        matches!(self, InstallSource::Artifact { .. })
    }
}

impl std::fmt::Display for InstallSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallSource::Artifact { platform } => write!(f, "artifact ({platform})"),
            InstallSource::BuiltFromSource => write!(f, "built from source"),
        }
    }
}

/// Persisted receipt for one installed manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallationRecord {
    pub name: String,
    pub version: String,
    pub install_source: InstallSource,
    /// sha256 of the payload that was installed (artifact or source archive).
    pub payload_sha256: String,
    pub install_path: PathBuf,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub linked_dependencies: Vec<String>,
    #[serde(default)]
    pub provided_externally: Vec<String>,
}

impl InstallationRecord {
    /// True when `sha256` names the same payload this record was installed from.
    pub fn matches_payload(&self, sha256: &str) -> bool {
        self.payload_sha256.eq_ignore_ascii_case(sha256)
    }
}
