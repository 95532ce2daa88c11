// kiln-core/src/build/steps.rs
// Interprets install and test procedures step by step.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::{EnvOverride, Step};
use kiln_common::pipeline::PipelineEvent;
use tokio::sync::broadcast;
use tracing::debug;
use walkdir::WalkDir;

use super::args::StepContext;
use super::env::StepEnvironment;
use super::resource::ResourceStager;
use crate::process::{CancelToken, CommandRunner, CommandSpec};

/// Runs a list of steps in one working directory against one prefix.
pub struct ProcedureRunner<'a> {
    target: &'a str,
    prefix: &'a Path,
    work_dir: &'a Path,
    dependencies: &'a [(String, PathBuf)],
    env: StepEnvironment,
    env_overrides: &'a [EnvOverride],
    runner: &'a dyn CommandRunner,
    cancel: &'a CancelToken,
    stager: Option<ResourceStager<'a>>,
    events: Option<&'a broadcast::Sender<PipelineEvent>>,
    no_resources: HashMap<String, PathBuf>,
}

impl<'a> ProcedureRunner<'a> {
    pub fn new(
        target: &'a str,
        prefix: &'a Path,
        work_dir: &'a Path,
        env: StepEnvironment,
        runner: &'a dyn CommandRunner,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            target,
            prefix,
            work_dir,
            dependencies: &[],
            env,
            env_overrides: &[],
            runner,
            cancel,
            stager: None,
            events: None,
            no_resources: HashMap::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: &'a [(String, PathBuf)]) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Overrides applied to every command, before the command's own.
    pub fn with_env_overrides(mut self, overrides: &'a [EnvOverride]) -> Self {
        self.env_overrides = overrides;
        self
    }

    pub fn with_stager(mut self, stager: ResourceStager<'a>) -> Self {
        self.stager = Some(stager);
        self
    }

    pub fn with_events(mut self, events: Option<&'a broadcast::Sender<PipelineEvent>>) -> Self {
        self.events = events;
        self
    }

    fn context(&self) -> StepContext<'_> {
        StepContext {
            target: self.target,
            prefix: self.prefix,
            work_dir: self.work_dir,
            dependencies: self.dependencies,
            resources: self
                .stager
                .as_ref()
                .map(ResourceStager::staged)
                .unwrap_or(&self.no_resources),
        }
    }

    /// Runs `steps` in order, stopping at the first failure. Returns the
    /// combined output of every command.
    pub fn run(&mut self, steps: &[Step]) -> Result<String> {
        let total = steps.len();
        let mut combined = String::new();
        for (index, step) in steps.iter().enumerate() {
            self.cancel.check(self.target)?;
            if let Some(stager) = self.stager.as_mut() {
                stager.stage_referenced(step)?;
            }
            let command = step.to_string();
            debug!("[{}] Step {}/{}: {}", self.target, index + 1, total, command);
            if let Some(tx) = self.events {
                let _ = tx.send(PipelineEvent::StepStarted {
                    target_id: self.target.to_string(),
                    index,
                    total,
                    command,
                });
            }
            combined.push_str(&self.execute(index, step)?);
        }
        Ok(combined)
    }

    fn execute(&mut self, index: usize, step: &Step) -> Result<String> {
        if let Step::StageResource { resource, into } = step {
            let dest = match into {
                Some(arg) => Some(self.context().resolve_path(arg)?),
                None => None,
            };
            let stager = self.stager.as_mut().ok_or_else(|| {
                KilnError::BuildEnvError(format!(
                    "'{}': resources cannot be staged here",
                    self.target
                ))
            })?;
            stager.stage(resource, dest)?;
            return Ok(String::new());
        }

        let ctx = self.context();
        match step {
            Step::Run(cmd) => {
                let mut env = self.env.clone();
                apply_overrides(&mut env, self.env_overrides, &ctx)?;
                apply_overrides(&mut env, &cmd.env, &ctx)?;
                let spec = CommandSpec {
                    program: ctx.resolve_one(&cmd.program)?,
                    args: ctx.resolve_all(&cmd.args)?,
                    cwd: match &cmd.cwd {
                        Some(arg) => ctx.resolve_path(arg)?,
                        None => self.work_dir.to_path_buf(),
                    },
                    env: env.to_vec(),
                };
                let out = self.runner.run(&spec, self.cancel)?;
                if !out.success {
                    return Err(KilnError::StepFailed {
                        target: self.target.to_string(),
                        step_index: index,
                        command: spec.display(),
                        status: out.status,
                        output: out.output,
                    });
                }
                Ok(out.output)
            }
            Step::WriteFile { path, contents } => {
                let path = ctx.resolve_path(path)?;
                self.fs_step(index, step, || {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, contents)
                })
            }
            Step::Mkdir { path } => {
                let path = ctx.resolve_path(path)?;
                self.fs_step(index, step, || fs::create_dir_all(&path))
            }
            Step::Symlink { target, link } => {
                let target = ctx.resolve_one(target)?;
                let link = ctx.resolve_path(link)?;
                self.fs_step(index, step, || symlink(Path::new(&target), &link))
            }
            Step::Copy { from, to } => {
                let from = ctx.resolve_path(from)?;
                let to = ctx.resolve_path(to)?;
                self.fs_step(index, step, || copy_recursive(&from, &to))
            }
            Step::StageResource { .. } => Ok(String::new()),
        }
    }

    fn fs_step<F>(&self, index: usize, step: &Step, op: F) -> Result<String>
    where
        F: FnOnce() -> io::Result<()>,
    {
        op().map_err(|e| KilnError::StepFailed {
            target: self.target.to_string(),
            step_index: index,
            command: step.to_string(),
            status: "error".to_string(),
            output: e.to_string(),
        })?;
        Ok(String::new())
    }
}

/// Applies overrides in order; values are resolved against `ctx`.
pub fn apply_overrides(
    env: &mut StepEnvironment,
    overrides: &[EnvOverride],
    ctx: &StepContext<'_>,
) -> Result<()> {
    for ov in overrides {
        let value = ctx.resolve_one(&ov.value)?;
        if ov.create_dir {
            fs::create_dir_all(&value)?;
        }
        env.apply(&ov.key, &value, ov.mode);
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are only supported on unix hosts",
    ))
}

/// `cp -R from to`: a file into an existing directory lands inside it; a
/// directory is copied to `to` itself.
fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_file() {
        let dest = if to.is_dir() {
            match from.file_name() {
                Some(name) => to.join(name),
                None => to.to_path_buf(),
            }
        } else {
            to.to_path_buf()
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, &dest)?;
        return Ok(());
    }

    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let dest = to.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            symlink(&target, &dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use kiln_common::model::{Arg, Command, EnvMode};

    use super::*;
    use crate::process::{CommandOutput, SystemCommandRunner};

    /// Records commands instead of running them.
    #[derive(Default)]
    struct RecordingRunner {
        seen: Mutex<Vec<CommandSpec>>,
        fail_program: Option<String>,
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, spec: &CommandSpec, _cancel: &CancelToken) -> Result<CommandOutput> {
            self.seen.lock().unwrap().push(spec.clone());
            let fail = self.fail_program.as_deref() == Some(spec.program.as_str());
            Ok(CommandOutput {
                success: !fail,
                code: Some(if fail { 2 } else { 0 }),
                status: if fail { "exit status: 2" } else { "exit status: 0" }.to_string(),
                output: format!("ran {}\n", spec.program),
            })
        }
    }

    #[test]
    fn runs_commands_with_resolved_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let runner = RecordingRunner::default();
        let cancel = CancelToken::new();
        let mut env = StepEnvironment::empty();
        env.set("PATH", "/usr/bin");
        let overrides = vec![EnvOverride {
            key: "PATH".into(),
            value: Arg::prefix("libexec/bin"),
            mode: EnvMode::Prepend,
            create_dir: false,
        }];
        let mut procedure = ProcedureRunner::new("kedge", &prefix, dir.path(), env, &runner, &cancel)
            .with_env_overrides(&overrides);
        let out = procedure
            .run(&[Step::run("make", vec![Arg::from("install"), Arg::prefix("")])])
            .unwrap();
        assert_eq!(out, "ran make\n");

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].args, vec!["install".to_string(), prefix.display().to_string()]);
        assert_eq!(seen[0].cwd, dir.path());
        let path = seen[0].env.iter().find(|(k, _)| k == "PATH").unwrap();
        assert_eq!(path.1, format!("{}/libexec/bin:/usr/bin", prefix.display()));
    }

    #[test]
    fn stops_at_first_failing_step() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner {
            fail_program: Some("make".into()),
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let mut procedure = ProcedureRunner::new(
            "kedge",
            dir.path(),
            dir.path(),
            StepEnvironment::empty(),
            &runner,
            &cancel,
        );
        let err = procedure
            .run(&[
                Step::run("./configure", vec![]),
                Step::run("make", vec![Arg::from("bin")]),
                Step::run("make", vec![Arg::from("install")]),
            ])
            .unwrap_err();
        match err {
            KilnError::StepFailed {
                step_index,
                command,
                status,
                ..
            } => {
                assert_eq!(step_index, 1);
                assert_eq!(command, "make bin");
                assert_eq!(status, "exit status: 2");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runner.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn filesystem_steps() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let cancel = CancelToken::new();
        let runner = SystemCommandRunner;
        let mut procedure =
            ProcedureRunner::new("t", &prefix, &work, StepEnvironment::empty(), &runner, &cancel);
        procedure
            .run(&[
                Step::WriteFile {
                    path: Arg::from("src/hello.txt"),
                    contents: "hello\n".into(),
                },
                Step::Mkdir {
                    path: Arg::prefix("share/doc"),
                },
                Step::Copy {
                    from: Arg::from("src"),
                    to: Arg::prefix("share/doc/src"),
                },
                Step::Symlink {
                    target: Arg::from("doc/src/hello.txt"),
                    link: Arg::prefix("share/hello"),
                },
            ])
            .unwrap();
        assert_eq!(
            fs::read_to_string(prefix.join("share/doc/src/hello.txt")).unwrap(),
            "hello\n"
        );
        assert_eq!(fs::read_to_string(prefix.join("share/hello")).unwrap(), "hello\n");
    }

    #[test]
    fn resource_reference_without_stager_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::default();
        let cancel = CancelToken::new();
        let mut procedure = ProcedureRunner::new(
            "mat2",
            dir.path(),
            dir.path(),
            StepEnvironment::empty(),
            &runner,
            &cancel,
        );
        let step = Step::Run(Command::new("python3", vec![Arg::resource("mutagen")]));
        assert!(matches!(
            procedure.run(&[step]),
            Err(KilnError::BuildEnvError(_))
        ));
    }

    #[test]
    fn cancelled_before_first_step() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut procedure = ProcedureRunner::new(
            "t",
            dir.path(),
            dir.path(),
            StepEnvironment::empty(),
            &runner,
            &cancel,
        );
        assert!(matches!(
            procedure.run(&[Step::run("true", vec![])]),
            Err(KilnError::Cancelled(_))
        ));
        assert!(runner.seen.lock().unwrap().is_empty());
    }
}
