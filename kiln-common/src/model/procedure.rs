// kiln-common/src/model/procedure.rs
//! Install and test procedures: a flat list of steps interpreted in order.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An argument to a step. Plain strings are literals; objects are placeholders
/// resolved against the install context when the step runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Arg {
    Literal(String),
    Placeholder(Placeholder),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Placeholder {
    /// Path under the install prefix (`""` is the prefix itself).
    Prefix(String),
    /// Path under the working directory (build path or test path).
    WorkDir(String),
    /// Path under a dependency's install prefix.
    Dependency {
        name: String,
        #[serde(default)]
        path: String,
    },
    /// Location of a staged resource; staging happens on first reference.
    Resource(String),
    /// A standard argument set for a build tool; expands to several args.
    Std(StdArgs),
    /// A build tool discovered from the environment.
    Tool(Tool),
    /// Concatenation of several args into one.
    Concat(Vec<Arg>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StdArgs {
    Configure,
    Cmake,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Cc,
    Cxx,
}

impl Arg {
    pub fn prefix(path: impl Into<String>) -> Self {
        Arg::Placeholder(Placeholder::Prefix(path.into()))
    }

    pub fn work_dir(path: impl Into<String>) -> Self {
        Arg::Placeholder(Placeholder::WorkDir(path.into()))
    }

    pub fn dependency(name: impl Into<String>, path: impl Into<String>) -> Self {
        Arg::Placeholder(Placeholder::Dependency {
            name: name.into(),
            path: path.into(),
        })
    }

    pub fn resource(name: impl Into<String>) -> Self {
        Arg::Placeholder(Placeholder::Resource(name.into()))
    }

    /// Names of resources this argument refers to, in order.
    pub fn referenced_resources(&self) -> Vec<&str> {
        match self {
            Arg::Literal(_) => Vec::new(),
            Arg::Placeholder(Placeholder::Resource(name)) => vec![name.as_str()],
            Arg::Placeholder(Placeholder::Concat(parts)) => parts
                .iter()
                .flat_map(Arg::referenced_resources)
                .collect(),
            Arg::Placeholder(_) => Vec::new(),
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Literal(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Literal(value)
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Literal(s) => write!(f, "{s}"),
            Arg::Placeholder(Placeholder::Prefix(p)) => write!(f, "{{prefix}}/{p}"),
            Arg::Placeholder(Placeholder::WorkDir(p)) => write!(f, "{{workdir}}/{p}"),
            Arg::Placeholder(Placeholder::Dependency { name, path }) => {
                write!(f, "{{dep:{name}}}/{path}")
            }
            Arg::Placeholder(Placeholder::Resource(name)) => write!(f, "{{resource:{name}}}"),
            Arg::Placeholder(Placeholder::Std(StdArgs::Configure)) => {
                write!(f, "{{std_configure_args}}")
            }
            Arg::Placeholder(Placeholder::Std(StdArgs::Cmake)) => write!(f, "{{std_cmake_args}}"),
            Arg::Placeholder(Placeholder::Tool(Tool::Cc)) => write!(f, "{{cc}}"),
            Arg::Placeholder(Placeholder::Tool(Tool::Cxx)) => write!(f, "{{cxx}}"),
            Arg::Placeholder(Placeholder::Concat(parts)) => {
                for part in parts {
                    write!(f, "{part}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    #[default]
    Set,
    Prepend,
    Append,
}

/// An environment variable override, scoped to one install (manifest level)
/// or one step (command level).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvOverride {
    pub key: String,
    pub value: Arg,
    #[serde(default)]
    pub mode: EnvMode,
    /// Create the directory named by the value before use.
    #[serde(default)]
    pub create_dir: bool,
}

impl EnvOverride {
    pub fn set(key: impl Into<String>, value: impl Into<Arg>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            mode: EnvMode::Set,
            create_dir: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub program: Arg,
    #[serde(default)]
    pub args: Vec<Arg>,
    #[serde(default)]
    pub env: Vec<EnvOverride>,
    /// Working subdirectory; defaults to the working directory itself.
    #[serde(default)]
    pub cwd: Option<Arg>,
}

impl Command {
    pub fn new(program: impl Into<Arg>, args: Vec<Arg>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            cwd: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Run(Command),
    WriteFile {
        path: Arg,
        contents: String,
    },
    Mkdir {
        path: Arg,
    },
    Symlink {
        target: Arg,
        link: Arg,
    },
    Copy {
        from: Arg,
        to: Arg,
    },
    StageResource {
        resource: String,
        #[serde(default)]
        into: Option<Arg>,
    },
}

impl Step {
    pub fn run(program: impl Into<Arg>, args: Vec<Arg>) -> Self {
        Step::Run(Command::new(program, args))
    }

    /// Resources that must be staged before this step executes.
    pub fn referenced_resources(&self) -> Vec<&str> {
        match self {
            Step::Run(cmd) => std::iter::once(&cmd.program)
                .chain(cmd.args.iter())
                .chain(cmd.env.iter().map(|e| &e.value))
                .chain(cmd.cwd.iter())
                .flat_map(Arg::referenced_resources)
                .collect(),
            Step::WriteFile { path, .. } | Step::Mkdir { path } => path.referenced_resources(),
            Step::Symlink { target, link } => {
                let mut names = target.referenced_resources();
                names.extend(link.referenced_resources());
                names
            }
            Step::Copy { from, to } => {
                let mut names = from.referenced_resources();
                names.extend(to.referenced_resources());
                names
            }
            Step::StageResource { .. } => Vec::new(),
        }
    }

    /// Resource explicitly staged by this step, if any.
    pub fn staged_resource(&self) -> Option<&str> {
        match self {
            Step::StageResource { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Run(cmd) => {
                write!(f, "{}", cmd.program)?;
                for arg in &cmd.args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            Step::WriteFile { path, .. } => write!(f, "write {path}"),
            Step::Mkdir { path } => write!(f, "mkdir -p {path}"),
            Step::Symlink { target, link } => write!(f, "ln -s {target} {link}"),
            Step::Copy { from, to } => write!(f, "cp -R {from} {to}"),
            Step::StageResource { resource, into } => match into {
                Some(dest) => write!(f, "stage resource {resource} into {dest}"),
                None => write!(f, "stage resource {resource}"),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct InstallProcedure {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestProcedure {
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Literal substrings the combined captured output must contain.
    #[serde(default)]
    pub expect_output: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_literal_and_placeholder_args() {
        let step: Step = serde_json::from_str(
            r#"{"run": {"program": "cmake", "args": ["-S", ".", {"std": "cmake"}, {"concat": ["-I", {"prefix": "include"}]}]}}"#,
        )
        .unwrap();
        let Step::Run(cmd) = &step else {
            panic!("expected a run step");
        };
        assert_eq!(cmd.program, Arg::from("cmake"));
        assert_eq!(cmd.args.len(), 4);
        assert_eq!(cmd.args[2], Arg::Placeholder(Placeholder::Std(StdArgs::Cmake)));
        assert_eq!(step.to_string(), "cmake -S . {std_cmake_args} -I{prefix}/include");
    }

    #[test]
    fn finds_resources_referenced_by_a_step() {
        let step = Step::Run(Command {
            program: Arg::dependency("python@3.9", "bin/python3"),
            args: vec![Arg::from("setup.py"), Arg::resource("mutagen")],
            env: vec![EnvOverride::set(
                "VENDOR",
                Arg::Placeholder(Placeholder::Concat(vec![
                    Arg::resource("six"),
                    Arg::from("/lib"),
                ])),
            )],
            cwd: None,
        });
        assert_eq!(step.referenced_resources(), vec!["mutagen", "six"]);
    }

    #[test]
    fn test_procedure_defaults() {
        let test: TestProcedure =
            serde_json::from_str(r#"{"expect_output": ["name: test"]}"#).unwrap();
        assert!(test.steps.is_empty());
        assert_eq!(test.expect_output, vec!["name: test".to_string()]);
    }
}
