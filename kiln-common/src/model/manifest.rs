// kiln-common/src/model/manifest.rs
// Structs for one formula manifest, deserialized from its JSON document.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::dependency::{Dependency, DependencyTag};
use crate::error::{KilnError, Result};
use crate::model::artifact::{Artifact, RelocationPolicy};
use crate::model::platform::PlatformKey;
use crate::model::procedure::{EnvOverride, InstallProcedure, TestProcedure};

/// Where a payload comes from and what it must hash to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceLocator {
    pub url: String,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum License {
    Single(String),
    AllOf { all_of: Vec<String> },
    AnyOf { any_of: Vec<String> },
}

impl License {
    pub fn tags(&self) -> Vec<&str> {
        match self {
            License::Single(tag) => vec![tag.as_str()],
            License::AllOf { all_of } => all_of.iter().map(String::as_str).collect(),
            License::AnyOf { any_of } => any_of.iter().map(String::as_str).collect(),
        }
    }
}

/// An auxiliary payload fetched and verified independently of the main source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub url: String,
    pub sha256: String,
    /// Staging directory relative to the working directory.
    #[serde(default)]
    pub destination: Option<String>,
}

impl Resource {
    pub fn staging_destination(&self) -> String {
        self.destination
            .clone()
            .unwrap_or_else(|| format!("resources/{}", self.name))
    }

    pub fn locator(&self) -> SourceLocator {
        SourceLocator {
            url: self.url.clone(),
            sha256: self.sha256.clone(),
            mirrors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub source: Option<SourceLocator>,
    #[serde(default)]
    pub license: Option<License>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub artifacts: BTreeMap<PlatformKey, Artifact>,
    #[serde(default)]
    pub env: Vec<EnvOverride>,
    #[serde(default)]
    pub install: InstallProcedure,
    #[serde(default)]
    pub test: Option<TestProcedure>,
}

impl Manifest {
    /// Minimal manifest with only identity set, used when building manifests
    /// programmatically.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            revision: 0,
            desc: None,
            homepage: None,
            source: None,
            license: None,
            dependencies: Vec::new(),
            resources: Vec::new(),
            artifacts: BTreeMap::new(),
            env: Vec::new(),
            install: InstallProcedure::default(),
            test: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version including the revision suffix, as used for the keg directory.
    pub fn version_str_full(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.clone()
        }
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn dependencies_with(&self, tag: DependencyTag) -> impl Iterator<Item = &Dependency> {
        self.dependencies
            .iter()
            .filter(move |dep| dep.tags.intersects(tag))
    }

    /// Name and full version become Cellar directory names; both must be a
    /// single plain path component.
    pub fn check_identity(&self) -> Result<()> {
        check_path_component("manifest name", &self.name)?;
        let version = self.version_str_full();
        if !is_plain_component(&version) {
            return Err(KilnError::ValidationError(format!(
                "manifest '{}': version '{}' is not a valid directory name",
                self.name,
                version.escape_debug()
            )));
        }
        Ok(())
    }

    /// Checks the structural invariants of a single manifest.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            Err(KilnError::ValidationError(format!(
                "manifest '{}': {reason}",
                self.name
            )))
        };

        if self.name.trim().is_empty() {
            return Err(KilnError::ValidationError(
                "manifest has an empty name".to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return invalid("empty version".to_string());
        }
        self.check_identity()?;
        match &self.source {
            Some(source) if source.sha256.trim().is_empty() && self.artifacts.is_empty() => {
                return invalid("source has no sha256 and no artifacts are declared".to_string());
            }
            None if self.artifacts.is_empty() => {
                return invalid("neither a source nor any artifact is declared".to_string());
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for resource in &self.resources {
            if !seen.insert(resource.name.as_str()) {
                return invalid(format!("duplicate resource '{}'", resource.name));
            }
            if resource.sha256.trim().is_empty() {
                return invalid(format!("resource '{}' has no sha256", resource.name));
            }
            if !is_plain_component(&resource.name) {
                return invalid(format!(
                    "resource name '{}' is not a valid directory name",
                    resource.name.escape_debug()
                ));
            }
            if let Some(dest) = &resource.destination {
                let escapes = std::path::Path::new(dest).components().any(|c| {
                    !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
                });
                if escapes {
                    return invalid(format!(
                        "resource '{}' destination '{dest}' leaves the working directory",
                        resource.name
                    ));
                }
            }
        }

        for (key, artifact) in &self.artifacts {
            if artifact.sha256.trim().is_empty() {
                return invalid(format!("artifact for '{key}' has no sha256"));
            }
            if key.is_universal() && artifact.relocation != RelocationPolicy::AnyPlatform {
                return invalid(format!(
                    "artifact keyed 'all' must use the any_platform relocation policy, found {:?}",
                    artifact.relocation
                ));
            }
        }

        for dep in &self.dependencies {
            if dep.name == self.name {
                return invalid("depends on itself".to_string());
            }
        }
        Ok(())
    }
}

fn is_plain_component(value: &str) -> bool {
    !(value.trim().is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']))
}

/// Rejects `value` unless it names exactly one ordinary directory entry.
pub fn check_path_component(what: &str, value: &str) -> Result<()> {
    if !is_plain_component(value) {
        return Err(KilnError::ValidationError(format!(
            "{what} '{}' is not a valid directory name",
            value.escape_debug()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::procedure::Step;

    const KEDGE: &str = r#"{
        "name": "kedge",
        "version": "0.12.0",
        "desc": "Deployment tool for Kubernetes artifacts",
        "source": {"url": "https://github.com/kedgeproject/kedge/archive/v0.12.0.tar.gz",
                   "sha256": "6ede5c0b9d6e8a5e4c8b9b6f5e0d3c6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e"},
        "license": "Apache-2.0",
        "dependencies": [{"name": "go", "tags": ["build"]}],
        "env": [{"key": "GOPATH", "value": {"work_dir": "gopath"}, "create_dir": true}],
        "install": [
            {"run": {"program": "make", "args": ["bin"]}},
            {"copy": {"from": {"work_dir": "kedge"}, "to": {"prefix": "bin/kedge"}}}
        ],
        "test": {"steps": [{"run": {"program": {"prefix": "bin/kedge"}, "args": ["version"]}}]}
    }"#;

    #[test]
    fn parses_full_manifest() {
        let manifest: Manifest = serde_json::from_str(KEDGE).unwrap();
        assert_eq!(manifest.name(), "kedge");
        assert_eq!(manifest.version_str_full(), "0.12.0");
        assert_eq!(manifest.install.steps.len(), 2);
        assert!(matches!(manifest.install.steps[0], Step::Run(_)));
        assert_eq!(manifest.dependencies_with(DependencyTag::BUILD).count(), 1);
        assert_eq!(manifest.license.as_ref().unwrap().tags(), vec!["Apache-2.0"]);
        assert!(manifest.env[0].create_dir);
        manifest.validate().unwrap();
    }

    #[test]
    fn revision_is_part_of_full_version() {
        let mut manifest = Manifest::new("libtrace", "4.0.18");
        manifest.revision = 2;
        assert_eq!(manifest.version_str_full(), "4.0.18_2");
    }

    #[test]
    fn rejects_manifest_without_any_install_source() {
        let manifest = Manifest::new("ghost", "1.0");
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("neither a source nor any artifact"));
    }

    #[test]
    fn rejects_unhashed_source_without_artifacts() {
        let mut manifest = Manifest::new("nohash", "1.0");
        manifest.source = Some(SourceLocator {
            url: "https://example.com/nohash-1.0.tar.gz".into(),
            sha256: String::new(),
            mirrors: Vec::new(),
        });
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_resources_and_relocating_universal_artifact() {
        let mut manifest: Manifest = serde_json::from_str(KEDGE).unwrap();
        let resource = Resource {
            name: "six".into(),
            url: "https://example.com/six.tar.gz".into(),
            sha256: "aa".into(),
            destination: None,
        };
        manifest.resources = vec![resource.clone(), resource];
        assert!(manifest.validate().is_err());

        let mut manifest: Manifest = serde_json::from_str(KEDGE).unwrap();
        manifest.artifacts.insert(
            PlatformKey::universal(),
            Artifact {
                url: "https://example.com/kedge.all.tar.gz".into(),
                sha256: "bb".into(),
                relocation: RelocationPolicy::Relocate,
            },
        );
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn resource_destination_defaults_under_resources_dir() {
        let resource = Resource {
            name: "mutagen".into(),
            url: "https://example.com/mutagen.tar.gz".into(),
            sha256: "cc".into(),
            destination: None,
        };
        assert_eq!(resource.staging_destination(), "resources/mutagen");
    }

    #[test]
    fn rejects_names_and_versions_that_are_not_plain_directory_names() {
        for bad in ["../../victim", "..", ".", "a/b", "a\\b", "nul\0byte", " "] {
            let mut manifest: Manifest = serde_json::from_str(KEDGE).unwrap();
            manifest.version = bad.to_string();
            assert!(manifest.validate().is_err(), "version {bad:?} accepted");

            let mut manifest: Manifest = serde_json::from_str(KEDGE).unwrap();
            manifest.name = bad.to_string();
            assert!(manifest.check_identity().is_err(), "name {bad:?} accepted");
        }

        let mut manifest: Manifest = serde_json::from_str(KEDGE).unwrap();
        manifest.version = "1.0..2".into();
        manifest.revision = 3;
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn rejects_resource_destination_outside_work_dir() {
        let mut manifest: Manifest = serde_json::from_str(KEDGE).unwrap();
        manifest.resources.push(Resource {
            name: "six".into(),
            url: "https://example.com/six.tar.gz".into(),
            sha256: "aa".into(),
            destination: Some("../../outside".into()),
        });
        assert!(manifest.validate().is_err());

        manifest.resources[0].destination = Some("vendor/six".into());
        assert!(manifest.validate().is_ok());
    }
}
