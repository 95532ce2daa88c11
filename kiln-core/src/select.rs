// kiln-core/src/select.rs
// Chooses between a precompiled artifact and a source build.

use kiln_common::error::{KilnError, Result};
use kiln_common::model::{Artifact, InstallSource, Manifest, PlatformKey, RelocationPolicy};
use tracing::debug;

/// Artifact entry for `host`, if any: an any-platform artifact first, then an
/// exact key, then the preferred key of the same architecture and OS family.
pub fn artifact_for_platform<'m>(
    manifest: &'m Manifest,
    host: &PlatformKey,
) -> Option<(&'m PlatformKey, &'m Artifact)> {
    if let Some(found) = manifest
        .artifacts
        .iter()
        .find(|(_, a)| a.relocation == RelocationPolicy::AnyPlatform)
    {
        debug!("[{}] Using any-platform artifact '{}'", manifest.name, found.0);
        return Some(found);
    }

    if let Some(found) = manifest.artifacts.get_key_value(host) {
        debug!("[{}] Found exact artifact match for {}", manifest.name, host);
        return Some(found);
    }

    let found = manifest
        .artifacts
        .iter()
        .filter(|(key, _)| key.same_family(host))
        .min_by(|(a, _), (b, _)| host.fallback_preference(a, b));
    if let Some((key, _)) = found {
        debug!(
            "[{}] No artifact for {}; falling back to compatible '{}'",
            manifest.name, host, key
        );
    }
    found
}

/// Decides the install source for `manifest` on `host`.
pub fn select(manifest: &Manifest, host: &PlatformKey) -> Result<InstallSource> {
    select_with_preference(manifest, host, false)
}

/// Like [`select`], but `force_source` skips artifacts entirely.
pub fn select_with_preference(
    manifest: &Manifest,
    host: &PlatformKey,
    force_source: bool,
) -> Result<InstallSource> {
    if !force_source {
        if let Some((key, _)) = artifact_for_platform(manifest, host) {
            return Ok(InstallSource::Artifact {
                platform: key.clone(),
            });
        }
    }

    if manifest.has_source() {
        debug!("[{}] Selected build from source", manifest.name);
        return Ok(InstallSource::BuiltFromSource);
    }

    let reason = if force_source {
        "a source build was requested but no source is declared".to_string()
    } else {
        format!(
            "no artifact matches platform '{}' (available: {}) and no source is declared",
            host,
            manifest
                .artifacts
                .keys()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )
    };
    Err(KilnError::FatalConfig {
        target: manifest.name.clone(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use kiln_common::model::{Arch, SourceLocator};

    use super::*;

    fn artifact(relocation: RelocationPolicy) -> Artifact {
        Artifact {
            url: "https://example.com/a.tar.gz".into(),
            sha256: "ab".repeat(32),
            relocation,
        }
    }

    fn with_artifacts(keys: &[&str], source: bool) -> Manifest {
        let mut m = Manifest::new("a", "1.0");
        for key in keys {
            m.artifacts
                .insert(key.parse().unwrap(), artifact(RelocationPolicy::Relocate));
        }
        if source {
            m.source = Some(SourceLocator {
                url: "https://example.com/a-1.0.tar.gz".into(),
                sha256: "cd".repeat(32),
                mirrors: Vec::new(),
            });
        }
        m
    }

    fn sonoma() -> PlatformKey {
        PlatformKey::macos(Arch::Arm64, "sonoma")
    }

    #[test]
    fn exact_match_wins() {
        let m = with_artifacts(&["arm64_ventura", "arm64_sonoma", "sonoma"], true);
        assert_eq!(
            select(&m, &sonoma()).unwrap(),
            InstallSource::Artifact { platform: sonoma() }
        );
    }

    #[test]
    fn falls_back_within_family_before_building() {
        let m = with_artifacts(&["arm64_monterey", "arm64_ventura", "ventura"], true);
        assert_eq!(
            select(&m, &sonoma()).unwrap(),
            InstallSource::Artifact {
                platform: PlatformKey::macos(Arch::Arm64, "ventura")
            }
        );
    }

    #[test]
    fn other_architecture_is_not_a_match() {
        let m = with_artifacts(&["sonoma", "x86_64_linux"], true);
        assert_eq!(select(&m, &sonoma()).unwrap(), InstallSource::BuiltFromSource);
    }

    #[test]
    fn any_platform_artifact_matches_everywhere() {
        let mut m = with_artifacts(&[], false);
        m.artifacts
            .insert(PlatformKey::universal(), artifact(RelocationPolicy::AnyPlatform));
        for host in [sonoma(), PlatformKey::linux(Arch::X86_64)] {
            assert_eq!(
                select(&m, &host).unwrap(),
                InstallSource::Artifact {
                    platform: PlatformKey::universal()
                }
            );
        }
    }

    #[test]
    fn unselectable_without_source() {
        let m = with_artifacts(&["x86_64_linux"], false);
        let err = select(&m, &sonoma()).unwrap_err();
        assert!(matches!(err, KilnError::FatalConfig { .. }));
        assert!(err.to_string().contains("x86_64_linux"));
    }

    #[test]
    fn forced_source_build() {
        let m = with_artifacts(&["arm64_sonoma"], true);
        assert_eq!(
            select_with_preference(&m, &sonoma(), true).unwrap(),
            InstallSource::BuiltFromSource
        );
        let m = with_artifacts(&["arm64_sonoma"], false);
        assert!(select_with_preference(&m, &sonoma(), true).is_err());
    }
}
