// kiln-common/src/model/artifact.rs
use serde::{Deserialize, Serialize};

/// How a precompiled artifact is placed into the install prefix.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelocationPolicy {
    /// Embedded prefix placeholders must be rewritten after unpacking.
    #[default]
    #[serde(rename = "none")]
    Relocate,
    /// Placed byte-identical; contains no prefix-relative paths.
    SkipRelocation,
    /// Placed byte-identical and usable on every platform.
    AnyPlatform,
}

impl RelocationPolicy {
    pub fn needs_relocation(self) -> bool {
        matches!(self, RelocationPolicy::Relocate)
    }
}

/// A precompiled payload (bottle) for one platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub relocation: RelocationPolicy,
}
