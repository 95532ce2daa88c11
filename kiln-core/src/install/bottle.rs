// kiln-core/src/install/bottle.rs
// Places a verified precompiled artifact into its install prefix.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::{Artifact, RelocationPolicy};
use tempfile::NamedTempFile;
use tracing::{debug, error};
use walkdir::WalkDir;

use super::extract::{extract_payload, Strip};

// Bottles are laid out as `<name>/<version>/...`.
const BOTTLE_STRIP_COMPONENTS: usize = 2;
const MAX_TEXT_RELOCATION_SIZE: u64 = 5 * 1024 * 1024;

/// Unpacks `bytes` (already verified against `artifact.sha256`) into
/// `install_dir`, replacing whatever was there.
pub fn install_artifact(
    name: &str,
    bytes: &[u8],
    artifact: &Artifact,
    install_dir: &Path,
    config: &Config,
) -> Result<PathBuf> {
    if install_dir.exists() {
        debug!(
            "[{}] Removing existing keg directory before installing: {}",
            name,
            install_dir.display()
        );
        fs::remove_dir_all(install_dir).map_err(|e| {
            KilnError::InstallError(format!(
                "Failed to remove existing keg {}: {}",
                install_dir.display(),
                e
            ))
        })?;
    }
    fs::create_dir_all(install_dir)?;

    extract_payload(bytes, &artifact.url, install_dir, Strip::Components(BOTTLE_STRIP_COMPONENTS))?;
    ensure_write_permissions(install_dir);

    match artifact.relocation {
        RelocationPolicy::Relocate => {
            debug!("[{}] Relocating artifact in {}", name, install_dir.display());
            let replaced = relocate_text_files(install_dir, &relocation_table(config))?;
            debug!("[{}] Rewrote {} text file(s)", name, replaced);
        }
        policy => debug!("[{}] Artifact placed byte-identical ({:?})", name, policy),
    }
    Ok(install_dir.to_path_buf())
}

/// Placeholder -> replacement pairs for relocatable artifacts.
pub fn relocation_table(config: &Config) -> Vec<(String, String)> {
    let prefix = config.kiln_root().display().to_string();
    let cellar = config.cellar_dir().display().to_string();
    vec![
        ("@@KILN_CELLAR@@".to_string(), cellar.clone()),
        ("@@KILN_PREFIX@@".to_string(), prefix.clone()),
        ("@@HOMEBREW_CELLAR@@".to_string(), cellar),
        ("@@HOMEBREW_PREFIX@@".to_string(), prefix),
    ]
}

fn ensure_write_permissions(path: &Path) {
    #[cfg(unix)]
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() && !entry.file_type().is_dir() {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            let mut perms = metadata.permissions();
            let mode = perms.mode();
            if mode & 0o200 == 0 {
                perms.set_mode(mode | 0o200);
                let _ = fs::set_permissions(entry.path(), perms);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn is_likely_text(path: &Path, len: u64) -> bool {
    if len >= MAX_TEXT_RELOCATION_SIZE {
        return false;
    }
    let Ok(mut f) = File::open(path) else {
        return false;
    };
    let mut buf = [0u8; 1024];
    match f.read(&mut buf) {
        Ok(n) => !buf[..n].contains(&0),
        Err(_) => false,
    }
}

/// Rewrites placeholders in every text file under `install_dir`. Binary
/// files are left untouched. Returns the number of files changed.
pub fn relocate_text_files(install_dir: &Path, replacements: &[(String, String)]) -> Result<usize> {
    let mut replaced = 0;
    let mut seen = HashSet::new();
    for entry in WalkDir::new(install_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !seen.insert(path.to_path_buf()) {
            continue;
        }
        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if !is_likely_text(path, len) {
            continue;
        }
        let Ok(content) = fs::read_to_string(path) else {
            debug!("Could not read {} as text for relocation", path.display());
            continue;
        };
        let mut new_content = content.clone();
        for (placeholder, replacement) in replacements {
            if new_content.contains(placeholder.as_str()) {
                new_content = new_content.replace(placeholder.as_str(), replacement);
            }
        }
        if new_content != content {
            write_text_file_atomic(path, &new_content)?;
            replaced += 1;
        }
    }
    Ok(replaced)
}

fn write_text_file_atomic(original_path: &Path, content: &str) -> Result<()> {
    let dir = original_path.parent().ok_or_else(|| {
        KilnError::Generic(format!(
            "Cannot get parent directory for {}",
            original_path.display()
        ))
    })?;
    let original_perms = fs::metadata(original_path).map(|m| m.permissions()).ok();

    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(content.as_bytes())?;
    temp_file.flush()?;
    temp_file.persist(original_path).map_err(|e| {
        error!(
            "Failed to replace {} after relocation: {}",
            original_path.display(),
            e.error
        );
        KilnError::from(e.error)
    })?;

    if let Some(perms) = original_perms {
        let _ = fs::set_permissions(original_path, perms);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn bottle(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn artifact(relocation: RelocationPolicy) -> Artifact {
        Artifact {
            url: "https://example.test/libtrace-4.0.1.x86_64_linux.bottle.tar.gz".into(),
            sha256: String::new(),
            relocation,
        }
    }

    #[test]
    fn relocates_text_but_not_binaries() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let bytes = bottle(&[
            ("libtrace/4.0.1/bin/trace-config", b"#!/bin/sh\necho @@KILN_PREFIX@@/lib\n", 0o755),
            ("libtrace/4.0.1/lib/libtrace.so", b"\x7fELF\0@@KILN_PREFIX@@", 0o644),
        ]);
        let prefix = config.formula_keg_path("libtrace", "4.0.1");
        install_artifact("libtrace", &bytes, &artifact(RelocationPolicy::Relocate), &prefix, &config)
            .unwrap();

        let script = fs::read_to_string(prefix.join("bin/trace-config")).unwrap();
        assert_eq!(script, format!("#!/bin/sh\necho {}/lib\n", root.path().display()));
        #[cfg(unix)]
        assert_ne!(
            fs::metadata(prefix.join("bin/trace-config")).unwrap().permissions().mode() & 0o111,
            0
        );
        assert_eq!(
            fs::read(prefix.join("lib/libtrace.so")).unwrap(),
            b"\x7fELF\0@@KILN_PREFIX@@"
        );
    }

    #[test]
    fn skip_relocation_is_byte_identical() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let bytes = bottle(&[("vulkan-headers/1.3.275/include/vk.h", b"// @@KILN_PREFIX@@\n", 0o644)]);
        let prefix = config.formula_keg_path("vulkan-headers", "1.3.275");
        install_artifact(
            "vulkan-headers",
            &bytes,
            &artifact(RelocationPolicy::AnyPlatform),
            &prefix,
            &config,
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(prefix.join("include/vk.h")).unwrap(),
            "// @@KILN_PREFIX@@\n"
        );
    }

    #[test]
    fn replaces_stale_prefix_contents() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let prefix = config.formula_keg_path("a", "1.0");
        fs::create_dir_all(prefix.join("old")).unwrap();
        let bytes = bottle(&[("a/1.0/new.txt", b"new", 0o644)]);
        install_artifact("a", &bytes, &artifact(RelocationPolicy::SkipRelocation), &prefix, &config)
            .unwrap();
        assert!(!prefix.join("old").exists());
        assert!(prefix.join("new.txt").is_file());
    }
}
