// kiln-core/src/build/env.rs
// Explicit, per-install environment passed to every command. The process
// environment is read once for the keep-list and never modified.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use kiln_common::model::EnvMode;
use tracing::debug;

// Passed through from the invoking user's environment; everything else is dropped.
const ENV_VARS_TO_KEEP: &[&str] = &[
    "USER", "LOGNAME", "TERM", "SHELL", "LANG", "LC_ALL", "LC_CTYPE", "TZ", "DISPLAY",
    "XAUTHORITY", "SSL_CERT_FILE", "SSL_CERT_DIR",
];

const SYSTEM_PATH_DIRS: &[&str] = &[
    "/usr/local/bin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepEnvironment {
    vars: BTreeMap<String, String>,
}

impl StepEnvironment {
    /// Empty environment, for callers that build everything themselves.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sanitised base: the keep-list from the current process, a PATH of the
    /// kiln bin dir plus system dirs, and HOME pointed at `home`.
    pub fn base(kiln_root: &Path, home: &Path) -> Self {
        let mut vars = BTreeMap::new();
        for key in ENV_VARS_TO_KEEP {
            if let Ok(value) = env::var(key) {
                vars.insert(key.to_string(), value);
            }
        }
        let mut path_dirs = vec![kiln_root.join("bin")];
        path_dirs.extend(SYSTEM_PATH_DIRS.iter().map(PathBuf::from));
        vars.insert("PATH".to_string(), join_paths(&path_dirs));
        vars.insert("HOME".to_string(), home.display().to_string());
        vars.insert("KILN_PREFIX".to_string(), kiln_root.display().to_string());
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Prepends to a `:`-separated list. An entry already present moves to the front.
    pub fn prepend_path(&mut self, key: &str, value: &str) {
        self.merge_list(key, value, ':', true);
    }

    pub fn append_path(&mut self, key: &str, value: &str) {
        self.merge_list(key, value, ':', false);
    }

    /// Space-separated flag lists (CPPFLAGS, LDFLAGS).
    pub fn append_flag(&mut self, key: &str, flag: &str) {
        self.merge_list(key, flag, ' ', false);
    }

    fn merge_list(&mut self, key: &str, value: &str, sep: char, front: bool) {
        let mut items: Vec<String> = self
            .vars
            .get(key)
            .map(|v| {
                v.split(sep)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if front {
            items.retain(|item| item != value);
            items.insert(0, value.to_string());
        } else if !items.iter().any(|item| item == value) {
            items.push(value.to_string());
        }
        self.vars.insert(key.to_string(), items.join(&sep.to_string()));
    }

    pub fn apply(&mut self, key: &str, value: &str, mode: EnvMode) {
        match mode {
            EnvMode::Set => self.set(key, value),
            EnvMode::Prepend => self.prepend_path(key, value),
            EnvMode::Append => self.append_path(key, value),
        }
    }

    /// Makes dependency prefixes visible to build tools. `deps` is in install
    /// order; later entries take precedence on PATH.
    pub fn add_build_dependencies(&mut self, deps: &[(String, PathBuf)]) {
        for (name, prefix) in deps {
            debug!("Adding dependency '{}' at {}", name, prefix.display());
            let bin = prefix.join("bin");
            if bin.is_dir() {
                self.prepend_path("PATH", &bin.display().to_string());
            }
            let sbin = prefix.join("sbin");
            if sbin.is_dir() {
                self.prepend_path("PATH", &sbin.display().to_string());
            }
            for pc in [prefix.join("lib/pkgconfig"), prefix.join("share/pkgconfig")] {
                if pc.is_dir() {
                    self.append_path("PKG_CONFIG_PATH", &pc.display().to_string());
                }
            }
            self.append_path("CMAKE_PREFIX_PATH", &prefix.display().to_string());
            let include = prefix.join("include");
            if include.is_dir() {
                self.append_flag("CPPFLAGS", &format!("-I{}", include.display()));
            }
            let lib = prefix.join("lib");
            if lib.is_dir() {
                self.append_flag("LDFLAGS", &format!("-L{}", lib.display()));
            }
        }
    }

    /// Makes an installed prefix (and its runtime dependencies) reachable for
    /// tests: binaries, libraries, headers and pkg-config files.
    pub fn add_runtime_prefixes(&mut self, prefixes: &[PathBuf]) {
        for prefix in prefixes.iter().rev() {
            let prefix_str = prefix.display().to_string();
            self.prepend_path("PATH", &format!("{prefix_str}/bin"));
            self.prepend_path("LIBRARY_PATH", &format!("{prefix_str}/lib"));
            self.prepend_path("CPATH", &format!("{prefix_str}/include"));
            self.prepend_path("PKG_CONFIG_PATH", &format!("{prefix_str}/lib/pkgconfig"));
            let lib_var = if cfg!(target_os = "macos") {
                "DYLD_LIBRARY_PATH"
            } else {
                "LD_LIBRARY_PATH"
            };
            self.prepend_path(lib_var, &format!("{prefix_str}/lib"));
        }
    }

    pub fn to_vec(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn join_paths(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn base_env_is_sanitised() {
        let env = StepEnvironment::base(Path::new("/opt/kiln"), Path::new("/tmp/w/home"));
        assert_eq!(env.get("HOME"), Some("/tmp/w/home"));
        let path = env.get("PATH").unwrap();
        assert!(path.starts_with("/opt/kiln/bin:"));
        assert!(path.contains("/usr/bin"));
        assert!(env.get("CARGO_HOME").is_none());
        assert!(env.get("PYTHONPATH").is_none());
    }

    #[test]
    fn list_merging_deduplicates() {
        let mut env = StepEnvironment::empty();
        env.prepend_path("P", "/b");
        env.prepend_path("P", "/a");
        env.append_path("P", "/c");
        env.append_path("P", "/a");
        assert_eq!(env.get("P"), Some("/a:/b:/c"));
        env.prepend_path("P", "/c");
        assert_eq!(env.get("P"), Some("/c:/a:/b"));
        env.apply("P", "/x", EnvMode::Set);
        assert_eq!(env.get("P"), Some("/x"));
    }

    #[test]
    fn dependency_dirs_are_added_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let dep = dir.path().join("Cellar/go/1.22");
        fs::create_dir_all(dep.join("bin")).unwrap();
        fs::create_dir_all(dep.join("lib/pkgconfig")).unwrap();

        let mut env = StepEnvironment::base(dir.path(), dir.path());
        env.add_build_dependencies(&[("go".to_string(), dep.clone())]);
        assert!(env
            .get("PATH")
            .unwrap()
            .starts_with(&dep.join("bin").display().to_string()));
        assert_eq!(
            env.get("PKG_CONFIG_PATH"),
            Some(dep.join("lib/pkgconfig").display().to_string().as_str())
        );
        assert_eq!(
            env.get("LDFLAGS"),
            Some(format!("-L{}", dep.join("lib").display()).as_str())
        );
        assert!(env.get("CPPFLAGS").is_none());
    }

    #[test]
    fn prepend_override_takes_precedence_over_existing_entry() {
        let mut env = StepEnvironment::empty();
        env.set("PATH", "/usr/bin:/opt/tool/bin:/bin");
        env.apply("PATH", "/opt/tool/bin", EnvMode::Prepend);
        assert_eq!(env.get("PATH"), Some("/opt/tool/bin:/usr/bin:/bin"));
    }

    #[test]
    fn runtime_prefixes_are_prepended_in_order() {
        let mut env = StepEnvironment::empty();
        env.set("PATH", "/usr/bin");
        env.add_runtime_prefixes(&[PathBuf::from("/k/a"), PathBuf::from("/k/b")]);
        assert_eq!(env.get("PATH"), Some("/k/a/bin:/k/b/bin:/usr/bin"));
        assert_eq!(env.get("CPATH"), Some("/k/a/include:/k/b/include"));
    }
}
