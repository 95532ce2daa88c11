// kiln-common/src/model/platform.rs
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::KilnError;

/// macOS releases in the order they shipped. Used to pick the closest
/// compatible artifact when no exact OS version match exists.
pub const MACOS_RELEASES: &[&str] = &[
    "el_capitan",
    "sierra",
    "high_sierra",
    "mojave",
    "catalina",
    "big_sur",
    "monterey",
    "ventura",
    "sonoma",
    "sequoia",
    "tahoe",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    Arm64,
    X86_64,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OsFamily {
    MacOs,
    Linux,
    Any,
}

/// (architecture, OS family, OS version) identifying where an artifact runs.
///
/// The textual form follows the bottle tag convention: `arm64_sonoma`,
/// `sonoma` (Intel macOS), `x86_64_linux`, `arm64_linux` and `all`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlatformKey {
    pub arch: Arch,
    pub os: OsFamily,
    pub os_version: Option<String>,
}

impl PlatformKey {
    pub fn new(arch: Arch, os: OsFamily, os_version: Option<&str>) -> Self {
        Self {
            arch,
            os,
            os_version: os_version.map(str::to_string),
        }
    }

    pub fn macos(arch: Arch, release: &str) -> Self {
        Self::new(arch, OsFamily::MacOs, Some(release))
    }

    pub fn linux(arch: Arch) -> Self {
        Self::new(arch, OsFamily::Linux, None)
    }

    /// The `all` key: an artifact usable on every host.
    pub fn universal() -> Self {
        Self::new(Arch::Any, OsFamily::Any, None)
    }

    pub fn is_universal(&self) -> bool {
        self.arch == Arch::Any && self.os == OsFamily::Any
    }

    /// Same architecture and OS family, ignoring the OS version.
    pub fn same_family(&self, other: &PlatformKey) -> bool {
        self.arch == other.arch && self.os == other.os
    }

    /// Position of the OS version in the known release order, if any.
    pub fn release_rank(&self) -> Option<usize> {
        let version = self.os_version.as_deref()?;
        match self.os {
            OsFamily::MacOs => MACOS_RELEASES.iter().position(|r| *r == version),
            _ => None,
        }
    }

    /// Orders same-family candidates by preference relative to `self` (the
    /// host): releases not newer than the host first, newest first; then
    /// newer releases, oldest first; then releases we cannot rank.
    pub fn fallback_preference(&self, a: &PlatformKey, b: &PlatformKey) -> Ordering {
        let host_rank = self.release_rank();
        let bucket = |key: &PlatformKey| -> (u8, i64) {
            match (key.release_rank(), host_rank) {
                (Some(r), Some(h)) if r <= h => (0, -(r as i64)),
                (Some(r), Some(_)) => (1, r as i64),
                (Some(r), None) => (0, -(r as i64)),
                (None, _) => (2, 0),
            }
        };
        bucket(a)
            .cmp(&bucket(b))
            .then_with(|| a.os_version.cmp(&b.os_version))
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_universal() {
            return write!(f, "all");
        }
        let arch = match self.arch {
            Arch::Arm64 => "arm64",
            Arch::X86_64 => "x86_64",
            Arch::Any => "any",
        };
        match (self.os, self.os_version.as_deref()) {
            (OsFamily::Linux, _) => write!(f, "{arch}_linux"),
            (OsFamily::MacOs, Some(v)) if self.arch == Arch::X86_64 => write!(f, "{v}"),
            (OsFamily::MacOs, Some(v)) => write!(f, "{arch}_{v}"),
            (OsFamily::MacOs, None) => write!(f, "{arch}_macos"),
            (OsFamily::Any, _) => write!(f, "{arch}_any"),
        }
    }
}

impl FromStr for PlatformKey {
    type Err = KilnError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let valid = !tag.is_empty()
            && tag
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(KilnError::ParseError(
                "platform key",
                format!("invalid platform tag '{tag}'"),
            ));
        }
        if tag == "all" {
            return Ok(Self::universal());
        }
        let (arch, rest) = if let Some(rest) = tag.strip_prefix("arm64_") {
            (Arch::Arm64, rest)
        } else if let Some(rest) = tag.strip_prefix("x86_64_") {
            (Arch::X86_64, rest)
        } else {
            (Arch::X86_64, tag)
        };
        if rest == "linux" {
            return Ok(Self::linux(arch));
        }
        if rest.is_empty() {
            return Err(KilnError::ParseError(
                "platform key",
                format!("missing OS version in platform tag '{tag}'"),
            ));
        }
        Ok(Self::macos(arch, rest))
    }
}

impl Serialize for PlatformKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PlatformKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(de::Error::custom)
    }
}
