// kiln-core/src/install/extract.rs
// Unpacks verified payloads (already in memory) into a directory.
use std::collections::HashSet;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use kiln_common::error::{KilnError, Result};
use tar::{Archive, EntryType};
use tracing::{debug, error, warn};
use xz2::read::XzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Gzip,
    Bzip2,
    Xz,
    Tar,
    /// Not an archive; staged as a single file.
    Plain,
}

/// How many leading path components to drop from archive entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strip {
    Components(usize),
    /// Drop the top-level directory only if every entry lives under one.
    SingleRoot,
}

/// Sniffs the payload's magic bytes, falling back to the file name.
pub fn detect_kind(bytes: &[u8], file_name: &str) -> ArchiveKind {
    if let Some(kind) = infer::get(bytes) {
        match kind.extension() {
            "gz" => return ArchiveKind::Gzip,
            "bz2" => return ArchiveKind::Bzip2,
            "xz" => return ArchiveKind::Xz,
            "tar" => return ArchiveKind::Tar,
            other => debug!("Payload '{}' sniffed as '{}'", file_name, other),
        }
    }
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        ArchiveKind::Gzip
    } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz") || lower.ends_with(".tbz2") {
        ArchiveKind::Bzip2
    } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
        ArchiveKind::Xz
    } else if lower.ends_with(".tar") {
        ArchiveKind::Tar
    } else {
        ArchiveKind::Plain
    }
}

fn tar_reader<'a>(bytes: &'a [u8], kind: ArchiveKind) -> Box<dyn Read + 'a> {
    let cursor = Cursor::new(bytes);
    match kind {
        ArchiveKind::Gzip => Box::new(GzDecoder::new(cursor)),
        ArchiveKind::Bzip2 => Box::new(BzDecoder::new(cursor)),
        ArchiveKind::Xz => Box::new(XzDecoder::new(cursor)),
        ArchiveKind::Tar | ArchiveKind::Plain => Box::new(cursor),
    }
}

/// Single top-level directory shared by every entry, if there is one.
pub fn infer_tar_root(bytes: &[u8], kind: ArchiveKind, label: &str) -> Result<Option<PathBuf>> {
    let mut archive = Archive::new(tar_reader(bytes, kind));
    let mut unique_roots = HashSet::new();
    let mut has_nested_entries = false;

    for entry_result in archive.entries()? {
        let entry = entry_result.map_err(|e| {
            KilnError::ArchiveError(format!("Error reading TAR entry from {label}: {e}"))
        })?;
        let path = entry
            .path()
            .map_err(|e| KilnError::ArchiveError(format!("Invalid path in {label}: {e}")))?
            .into_owned();

        let mut components = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir));
        match components.next() {
            None => continue,
            Some(Component::Normal(name)) => {
                unique_roots.insert(PathBuf::from(name));
                if components.next().is_some() || entry.header().entry_type().is_dir() {
                    has_nested_entries = true;
                }
            }
            Some(other) => {
                debug!("Non-standard top-level component {:?} in {}", other, label);
                return Ok(None);
            }
        }
        if unique_roots.len() > 1 {
            debug!("Multiple top-level items found in {}, no single root", label);
            return Ok(None);
        }
    }

    if !has_nested_entries {
        if unique_roots.is_empty() {
            warn!("Archive {} appears to be empty", label);
        }
        return Ok(None);
    }
    Ok(unique_roots.into_iter().next())
}

/// Extracts `bytes` into `target_dir`. Plain files are written as
/// `target_dir/<file_name>`.
pub fn extract_payload(bytes: &[u8], file_name: &str, target_dir: &Path, strip: Strip) -> Result<()> {
    fs::create_dir_all(target_dir)?;
    let kind = detect_kind(bytes, file_name);
    debug!(
        "Extracting '{}' ({:?}) to '{}' ({:?})",
        file_name,
        kind,
        target_dir.display(),
        strip
    );

    if kind == ArchiveKind::Plain {
        let dest = target_dir.join(sanitize_file_name(file_name));
        fs::write(&dest, bytes)?;
        return Ok(());
    }

    let strip_components = match strip {
        Strip::Components(n) => n,
        Strip::SingleRoot => usize::from(infer_tar_root(bytes, kind, file_name)?.is_some()),
    };
    extract_tar(tar_reader(bytes, kind), target_dir, strip_components, file_name)
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    if base.is_empty() || base == "." || base == ".." {
        "payload".to_string()
    } else {
        base.to_string()
    }
}

/// Maps an archive path to its on-disk location, or `None` when stripping
/// consumes it. Absolute and `..` components are rejected.
fn stripped_target(target_dir: &Path, path: &Path, strip_components: usize) -> Result<Option<PathBuf>> {
    let mut out = target_dir.to_path_buf();
    let mut pushed = false;
    for comp in path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .skip(strip_components)
    {
        match comp {
            Component::Normal(p) => {
                out.push(p);
                pushed = true;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(KilnError::ArchiveError(format!(
                    "Unsafe '..' in archive path {}",
                    path.display()
                )))
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(KilnError::ArchiveError(format!(
                    "Disallowed component {:?} in archive path {}",
                    comp,
                    path.display()
                )))
            }
        }
    }
    Ok(pushed.then_some(out))
}

struct DeferredHardLink {
    link: PathBuf,
    target: PathBuf,
}

fn extract_tar<R: Read>(reader: R, target_dir: &Path, strip_components: usize, label: &str) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut deferred_hardlinks: Vec<DeferredHardLink> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    for entry_result in archive.entries()? {
        let mut entry = entry_result.map_err(|e| {
            KilnError::ArchiveError(format!("Error reading TAR entry from {label}: {e}"))
        })?;
        let original_path: PathBuf = entry
            .path()
            .map_err(|e| KilnError::ArchiveError(format!("Invalid path in {label}: {e}")))?
            .into_owned();

        let dest = match stripped_target(target_dir, &original_path, strip_components) {
            Ok(Some(dest)) => dest,
            Ok(None) => continue,
            Err(e) => {
                error!("{}", e);
                errors.push(e.to_string());
                continue;
            }
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if entry.header().entry_type() == EntryType::Link {
            match entry.link_name() {
                Ok(Some(target_name)) => {
                    match stripped_target(target_dir, &target_name, strip_components) {
                        Ok(Some(target)) => deferred_hardlinks.push(DeferredHardLink { link: dest, target }),
                        _ => errors.push(format!(
                            "Hardlink '{}' has an unusable target '{}'",
                            original_path.display(),
                            target_name.display()
                        )),
                    }
                }
                _ => errors.push(format!(
                    "Hardlink entry '{}' has no link target name",
                    original_path.display()
                )),
            }
            continue;
        }

        if let Err(e) = entry.unpack(&dest) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                let msg = format!(
                    "Failed to unpack entry {:?} to {}: {}",
                    original_path,
                    dest.display(),
                    e
                );
                error!("{}", msg);
                errors.push(msg);
            }
        }
    }

    for deferred in deferred_hardlinks {
        if !deferred.target.exists() {
            errors.push(format!(
                "Target '{}' for hardlink '{}' does not exist",
                deferred.target.display(),
                deferred.link.display()
            ));
            continue;
        }
        if deferred.link.symlink_metadata().is_ok() {
            if let Err(e) = fs::remove_file(&deferred.link) {
                warn!("Could not replace {}: {}", deferred.link.display(), e);
            }
        }
        if let Err(e) = fs::hard_link(&deferred.target, &deferred.link) {
            errors.push(format!(
                "Failed to create hardlink '{}' -> '{}': {}",
                deferred.link.display(),
                deferred.target.display(),
                e
            ));
        }
    }

    if !errors.is_empty() {
        return Err(KilnError::ArchiveError(format!(
            "Failed to extract {} with {} error(s): {}",
            label,
            errors.len(),
            errors.join("; ")
        )));
    }
    debug!("Finished extracting {}", label);
    Ok(())
}

#[cfg(test)]
mod tests {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn detects_by_magic_then_name() {
        let gz = tar_gz(&[("a/b", "x")]);
        assert_eq!(detect_kind(&gz, "whatever.bin"), ArchiveKind::Gzip);
        assert_eq!(detect_kind(b"#!/bin/sh\n", "run.sh"), ArchiveKind::Plain);
        assert_eq!(detect_kind(b"", "src.tar.xz"), ArchiveKind::Xz);
    }

    #[test]
    fn strips_single_root() {
        let gz = tar_gz(&[("kedge-1.0/Makefile", "all:\n"), ("kedge-1.0/src/main.c", "int main;")]);
        assert_eq!(
            infer_tar_root(&gz, ArchiveKind::Gzip, "t").unwrap(),
            Some(PathBuf::from("kedge-1.0"))
        );
        let dir = tempfile::tempdir().unwrap();
        extract_payload(&gz, "kedge-1.0.tar.gz", dir.path(), Strip::SingleRoot).unwrap();
        assert!(dir.path().join("Makefile").is_file());
        assert!(dir.path().join("src/main.c").is_file());
    }

    #[test]
    fn keeps_layout_without_single_root() {
        let gz = tar_gz(&[("README", "hi"), ("src/lib.c", "")]);
        let dir = tempfile::tempdir().unwrap();
        extract_payload(&gz, "x.tar.gz", dir.path(), Strip::SingleRoot).unwrap();
        assert!(dir.path().join("README").is_file());
        assert!(dir.path().join("src/lib.c").is_file());
    }

    #[test]
    fn strips_fixed_components() {
        let gz = tar_gz(&[("libtrace/4.0.1/lib/libtrace.a", "ar")]);
        let dir = tempfile::tempdir().unwrap();
        extract_payload(&gz, "b.tar.gz", dir.path(), Strip::Components(2)).unwrap();
        assert!(dir.path().join("lib/libtrace.a").is_file());
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(stripped_target(Path::new("/t"), Path::new("a/../../etc/passwd"), 0).is_err());
        assert!(stripped_target(Path::new("/t"), Path::new("/etc/passwd"), 0).is_err());
        assert_eq!(stripped_target(Path::new("/t"), Path::new("a/b"), 2).unwrap(), None);
    }

    #[test]
    fn plain_payload_is_written_as_file() {
        let dir = tempfile::tempdir().unwrap();
        extract_payload(b"data", "https://example.com/dl/font.ttf", dir.path(), Strip::SingleRoot)
            .unwrap();
        assert_eq!(fs::read(dir.path().join("font.ttf")).unwrap(), b"data");
    }
}
