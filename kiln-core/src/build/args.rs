// kiln-core/src/build/args.rs
// Resolves step arguments (literals and placeholders) to concrete strings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::{Arg, Placeholder, StdArgs, Tool};

use crate::host;

/// Standard `./configure` arguments for an install prefix.
pub fn std_configure_args(prefix: &Path) -> Vec<String> {
    let prefix = prefix.display();
    vec![
        "--disable-debug".to_string(),
        "--disable-dependency-tracking".to_string(),
        format!("--prefix={prefix}"),
        format!("--libdir={prefix}/lib"),
    ]
}

/// Standard `cmake` arguments for an install prefix.
pub fn std_cmake_args(prefix: &Path) -> Vec<String> {
    vec![
        format!("-DCMAKE_INSTALL_PREFIX={}", prefix.display()),
        "-DCMAKE_INSTALL_LIBDIR=lib".to_string(),
        "-DCMAKE_BUILD_TYPE=Release".to_string(),
        "-DCMAKE_FIND_FRAMEWORK=LAST".to_string(),
        "-DCMAKE_VERBOSE_MAKEFILE=ON".to_string(),
        "-Wno-dev".to_string(),
        "-DBUILD_TESTING=OFF".to_string(),
    ]
}

fn join_under(base: &Path, sub: &str) -> PathBuf {
    let sub = sub.trim_start_matches('/');
    if sub.is_empty() {
        base.to_path_buf()
    } else {
        base.join(sub)
    }
}

/// Everything a placeholder may refer to while one procedure runs.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub target: &'a str,
    pub prefix: &'a Path,
    pub work_dir: &'a Path,
    /// Install prefixes of the target's linked dependencies.
    pub dependencies: &'a [(String, PathBuf)],
    /// Staged resource locations by name.
    pub resources: &'a HashMap<String, PathBuf>,
}

impl<'a> StepContext<'a> {
    /// Resolves an argument; standard argument sets expand to several values.
    pub fn resolve(&self, arg: &Arg) -> Result<Vec<String>> {
        let placeholder = match arg {
            Arg::Literal(s) => return Ok(vec![s.clone()]),
            Arg::Placeholder(p) => p,
        };
        let values = match placeholder {
            Placeholder::Prefix(sub) => vec![join_under(self.prefix, sub).display().to_string()],
            Placeholder::WorkDir(sub) => {
                vec![join_under(self.work_dir, sub).display().to_string()]
            }
            Placeholder::Dependency { name, path } => {
                let dep_prefix = self
                    .dependencies
                    .iter()
                    .find(|(dep, _)| dep == name)
                    .map(|(_, p)| p)
                    .ok_or_else(|| {
                        KilnError::BuildEnvError(format!(
                            "'{}' refers to dependency '{}', which is not installed for it",
                            self.target, name
                        ))
                    })?;
                vec![join_under(dep_prefix, path).display().to_string()]
            }
            Placeholder::Resource(name) => {
                let staged = self.resources.get(name).ok_or_else(|| {
                    KilnError::BuildEnvError(format!(
                        "Resource '{}' of '{}' has not been staged",
                        name, self.target
                    ))
                })?;
                vec![staged.display().to_string()]
            }
            Placeholder::Std(StdArgs::Configure) => std_configure_args(self.prefix),
            Placeholder::Std(StdArgs::Cmake) => std_cmake_args(self.prefix),
            Placeholder::Tool(tool) => {
                let name = match tool {
                    Tool::Cc => "cc",
                    Tool::Cxx => "c++",
                };
                vec![host::find_compiler(name)?.display().to_string()]
            }
            Placeholder::Concat(parts) => {
                let mut joined = String::new();
                for part in parts {
                    joined.push_str(&self.resolve(part)?.join(" "));
                }
                vec![joined]
            }
        };
        Ok(values)
    }

    /// Resolves an argument that must produce exactly one value.
    pub fn resolve_one(&self, arg: &Arg) -> Result<String> {
        let mut values = self.resolve(arg)?;
        if values.len() != 1 {
            return Err(KilnError::ValidationError(format!(
                "'{}': argument '{}' expands to {} values where one is required",
                self.target,
                arg,
                values.len()
            )));
        }
        Ok(values.remove(0))
    }

    /// Resolves an argument to a path; relative literals are taken relative to
    /// the working directory.
    pub fn resolve_path(&self, arg: &Arg) -> Result<PathBuf> {
        let value = PathBuf::from(self.resolve_one(arg)?);
        if value.is_absolute() {
            Ok(value)
        } else {
            Ok(self.work_dir.join(value))
        }
    }

    pub fn resolve_all(&self, args: &[Arg]) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            out.extend(self.resolve(arg)?);
        }
        Ok(out)
    }
}
