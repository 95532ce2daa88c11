// kiln-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Phase(s) in which a dependency is needed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DependencyTag: u8 {
        const RUNTIME       = 0b00000001;
        const BUILD         = 0b00000010;
        /// Satisfied by the host when the capability probe says so.
        const HOST_PROVIDED = 0b00000100;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl DependencyTag {
    /// Tags that make an edge part of the acyclic install graph.
    pub const GRAPH: DependencyTag = DependencyTag::RUNTIME.union(DependencyTag::BUILD);

    pub fn is_build_only(self) -> bool {
        self.contains(DependencyTag::BUILD) && !self.contains(DependencyTag::RUNTIME)
    }

    fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(DependencyTag::BUILD) {
            names.push("build");
        }
        if self.contains(DependencyTag::RUNTIME) {
            names.push("runtime");
        }
        if self.contains(DependencyTag::HOST_PROVIDED) {
            names.push("host_provided");
        }
        names
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join("+"))
    }
}

// Tags travel as a list of names: ["build"], ["host_provided", "build"].
impl Serialize for DependencyTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DependencyTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut tags = DependencyTag::empty();
        for name in &names {
            tags |= match name.as_str() {
                "build" => DependencyTag::BUILD,
                "runtime" => DependencyTag::RUNTIME,
                "host_provided" | "optional" => DependencyTag::HOST_PROVIDED,
                other => {
                    return Err(serde::de::Error::unknown_variant(
                        other,
                        &["build", "runtime", "host_provided"],
                    ))
                }
            };
        }
        if tags.is_empty() {
            tags = DependencyTag::RUNTIME;
        }
        Ok(tags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Dependency {
    pub name: String,
    pub tags: DependencyTag,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Name(String),
    Tagged {
        name: String,
        #[serde(default)]
        tags: DependencyTag,
    },
}

impl<'de> Deserialize<'de> for Dependency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawDependency::deserialize(deserializer)? {
            RawDependency::Name(name) => Dependency::new_runtime(name),
            RawDependency::Tagged { name, tags } => Dependency::new_with_tags(name, tags),
        })
    }
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: DependencyTag::RUNTIME,
        }
    }

    pub fn new_build(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: DependencyTag::BUILD,
        }
    }

    pub fn new_with_tags(name: impl Into<String>, tags: DependencyTag) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }

    pub fn is_host_provided(&self) -> bool {
        self.tags.contains(DependencyTag::HOST_PROVIDED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_string_is_runtime() {
        let deps: Vec<Dependency> =
            serde_json::from_str(r#"["libffi", {"name": "go", "tags": ["build"]}]"#).unwrap();
        assert_eq!(deps[0], Dependency::new_runtime("libffi"));
        assert_eq!(deps[1], Dependency::new_build("go"));
        assert!(deps[1].tags.is_build_only());
    }

    #[test]
    fn host_provided_may_combine_with_build() {
        let dep: Dependency =
            serde_json::from_str(r#"{"name": "unzip", "tags": ["host_provided", "build"]}"#)
                .unwrap();
        assert!(dep.is_host_provided());
        assert!(dep.tags.contains(DependencyTag::BUILD));
        assert_eq!(dep.tags.to_string(), "build+host_provided");
        assert_eq!(
            serde_json::to_string(&dep.tags).unwrap(),
            r#"["build","host_provided"]"#
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let res: Result<Dependency, _> =
            serde_json::from_str(r#"{"name": "x", "tags": ["recommended"]}"#);
        assert!(res.is_err());
    }
}
