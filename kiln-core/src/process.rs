// kiln-core/src/process.rs
// External command execution with combined output capture and cancellation.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kiln_common::error::{KilnError, Result};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shared flag that asks running and future commands to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(KilnError::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }
}

/// A fully resolved command: the environment is complete, not a delta on
/// top of the current process environment.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// e.g. `exit status: 2`
    pub status: String,
    /// stdout and stderr, interleaved in arrival order.
    pub output: String,
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput> {
        (**self).run(spec, cancel)
    }
}

/// Runs commands as child processes in their own process group so that
/// cancellation can terminate everything they spawned.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

fn pump<R: Read + Send + 'static>(
    mut reader: R,
    sink: Arc<Mutex<Vec<u8>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut out) = sink.lock() {
                        out.extend_from_slice(&buf[..n]);
                    }
                }
            }
        }
    })
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: killpg only sends a signal; the group id is our own child's pid.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            "killpg({}) failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput> {
        cancel.check(&spec.display())?;
        debug!("Running: {} (cwd {})", spec.display(), spec.cwd.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| {
            KilnError::CommandExecError(format!("Failed to spawn '{}': {e}", spec.program))
        })?;

        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, Arc::clone(&sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, Arc::clone(&sink)));
        }

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                warn!("Cancelling: {}", spec.display());
                #[cfg(unix)]
                kill_process_group(child.id());
                if let Err(e) = child.kill() {
                    debug!("kill after killpg: {}", e);
                }
                let _ = child.wait();
                for handle in pumps {
                    let _ = handle.join();
                }
                return Err(KilnError::Cancelled(spec.display()));
            }
            thread::sleep(POLL_INTERVAL);
        };

        for handle in pumps {
            let _ = handle.join();
        }
        let bytes = sink.lock().map(|b| b.clone()).unwrap_or_default();
        let output = String::from_utf8_lossy(&bytes).into_owned();
        debug!("'{}' finished with {}", spec.program, status);

        Ok(CommandOutput {
            success: status.success(),
            code: status.code(),
            status: status.to_string(),
            output,
        })
    }
}
