// kiln-core/src/host.rs
// Facts about the machine we install on: platform key, capabilities, compilers.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use kiln_common::dependency::HostProbe;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::{Arch, PlatformKey};
use tracing::debug;

const LIBRARY_DIRS: &[&str] = &[
    "/usr/lib",
    "/usr/local/lib",
    "/lib",
    "/usr/lib/x86_64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
];

/// Probes the running system: a capability is satisfied by an executable on
/// PATH or a shared library named `lib<name>` in the standard library dirs.
#[derive(Debug, Clone, Default)]
pub struct SystemHostProbe {
    library_dirs: Vec<PathBuf>,
}

impl SystemHostProbe {
    pub fn new() -> Self {
        Self {
            library_dirs: LIBRARY_DIRS.iter().map(PathBuf::from).collect(),
        }
    }

    fn has_library(&self, name: &str) -> bool {
        let stem = format!("lib{name}");
        self.library_dirs.iter().any(|dir| {
            ["so", "dylib", "a"]
                .iter()
                .any(|ext| dir.join(format!("{stem}.{ext}")).exists())
        })
    }
}

impl HostProbe for SystemHostProbe {
    fn has_capability(&self, name: &str) -> bool {
        if which::which(name).is_ok() {
            debug!("Host provides executable '{}'", name);
            return true;
        }
        self.has_library(name)
    }
}

fn current_arch() -> Arch {
    match env::consts::ARCH {
        "aarch64" => Arch::Arm64,
        _ => Arch::X86_64,
    }
}

/// Maps a `sw_vers -productVersion` string to a release name.
pub fn macos_release_name(product_version: &str) -> Option<&'static str> {
    let mut parts = product_version.trim().split('.');
    let major = parts.next()?;
    let name = match major {
        "26" => "tahoe",
        "15" => "sequoia",
        "14" => "sonoma",
        "13" => "ventura",
        "12" => "monterey",
        "11" => "big_sur",
        "10" => match parts.next()? {
            "15" => "catalina",
            "14" => "mojave",
            "13" => "high_sierra",
            "12" => "sierra",
            "11" => "el_capitan",
            _ => return None,
        },
        _ => return None,
    };
    Some(name)
}

/// Platform key of the running host.
pub fn current_platform() -> Result<PlatformKey> {
    let arch = current_arch();
    if cfg!(target_os = "linux") {
        return Ok(PlatformKey::linux(arch));
    }
    if !cfg!(target_os = "macos") {
        return Err(KilnError::Generic(format!(
            "Unsupported host operating system '{}'",
            env::consts::OS
        )));
    }

    let output = Command::new("/usr/bin/sw_vers")
        .arg("-productVersion")
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| {
            KilnError::BuildEnvError(format!("Failed to execute 'sw_vers -productVersion': {e}"))
        })?;
    if !output.status.success() {
        return Err(KilnError::BuildEnvError(format!(
            "sw_vers failed to get product version: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let release = macos_release_name(&version).ok_or_else(|| {
        KilnError::BuildEnvError(format!("Unknown macOS version '{version}'"))
    })?;
    debug!("Detected macOS {} ({})", version, release);
    Ok(PlatformKey::macos(arch, release))
}

/// Locates a C or C++ compiler: `$CC`/`$CXX` first, then PATH.
pub fn find_compiler(name: &str) -> Result<PathBuf> {
    let env_var_name = match name {
        "cc" => "CC",
        "c++" | "cxx" => "CXX",
        _ => "",
    };
    if !env_var_name.is_empty() {
        if let Ok(compiler) = env::var(env_var_name) {
            let path = PathBuf::from(&compiler);
            if path.is_file() {
                debug!("Using compiler from env var {}: {}", env_var_name, path.display());
                return Ok(path);
            }
            if let Ok(found) = which::which(&compiler) {
                return Ok(found);
            }
            debug!("Env var {} points to unusable compiler '{}'", env_var_name, compiler);
        }
    }

    let candidates: &[&str] = match name {
        "cc" => &["cc", "clang", "gcc"],
        "c++" | "cxx" => &["c++", "clang++", "g++"],
        other => return which::which(other).map_err(|e| {
            KilnError::BuildEnvError(format!("Failed to find '{other}' on PATH: {e}"))
        }),
    };
    for candidate in candidates {
        if let Ok(path) = which::which(candidate) {
            debug!("Found compiler '{}' at {}", name, path.display());
            return Ok(path);
        }
    }
    Err(KilnError::BuildEnvError(format!(
        "Failed to find a '{name}' compiler on PATH (tried {candidates:?})"
    )))
}

/// True when `path` names an existing executable regular file.
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}
