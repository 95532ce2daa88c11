// kiln/src/cli/status.rs
use std::collections::HashMap;
use std::time::Instant;

use colored::*;
use kiln_common::pipeline::{PipelineEvent, TestResult};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Downloading,
    Downloaded,
    Building,
    Installing,
    Testing,
    Success,
    Failed,
}

impl JobStatus {
    fn display_state(&self) -> &'static str {
        match self {
            JobStatus::Downloading => "downloading",
            JobStatus::Downloaded => "downloaded",
            JobStatus::Building => "building",
            JobStatus::Installing => "installing",
            JobStatus::Testing => "testing",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    fn colored_state(&self) -> ColoredString {
        match self {
            JobStatus::Downloading => self.display_state().yellow(),
            JobStatus::Downloaded => self.display_state().green(),
            JobStatus::Building => self.display_state().blue(),
            JobStatus::Installing => self.display_state().magenta(),
            JobStatus::Testing => self.display_state().cyan(),
            JobStatus::Success => self.display_state().green().bold(),
            JobStatus::Failed => self.display_state().red().bold(),
        }
    }
}

struct StatusDisplay {
    jobs: HashMap<String, (JobStatus, Instant)>,
    total_jobs: usize,
    finished: usize,
}

impl StatusDisplay {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            total_jobs: 0,
            finished: 0,
        }
    }

    fn update(&mut self, target_id: &str, status: JobStatus, detail: Option<String>) {
        let started = self
            .jobs
            .get(target_id)
            .map(|(_, t)| *t)
            .unwrap_or_else(Instant::now);
        if matches!(status, JobStatus::Success | JobStatus::Failed) {
            self.finished += 1;
        }
        self.jobs.insert(target_id.to_string(), (status, started));

        let progress = if self.total_jobs > 0 {
            format!("[{}/{}]", self.finished, self.total_jobs)
        } else {
            String::new()
        };
        let mut line = format!(
            "{:<8} {:<12} {}",
            progress.dimmed(),
            status.colored_state(),
            target_id.cyan()
        );
        if matches!(status, JobStatus::Success | JobStatus::Failed) {
            line.push_str(&format!(" {:.1}s", started.elapsed().as_secs_f64()));
        }
        if let Some(detail) = detail {
            line.push(' ');
            line.push_str(&detail);
        }
        println!("{line}");
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit_idx = 0;

    while value >= 1000.0 && unit_idx < UNITS.len() - 1 {
        value /= 1000.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{bytes}B")
    } else {
        format!("{:.1}{}", value, UNITS[unit_idx])
    }
}

/// Prints progress lines until every sender of the channel is gone.
pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) {
    let mut display = StatusDisplay::new();

    loop {
        let event = match event_rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Status display skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            PipelineEvent::PipelineStarted { targets } => {
                println!(
                    "{} {}",
                    "==>".bold().blue(),
                    format!("Resolving {}", targets.join(", ")).bold()
                );
            }
            PipelineEvent::ResolutionFinished {
                install_order,
                provided_externally,
            } => {
                display.total_jobs = install_order.len();
                println!(
                    "{} {}",
                    "Install order:".bold(),
                    install_order.join(" -> ")
                );
                if !provided_externally.is_empty() {
                    println!(
                        "{} {}",
                        "Host provides:".dimmed(),
                        provided_externally.join(", ")
                    );
                }
            }
            PipelineEvent::SourceSelected { target_id, source } => {
                tracing::debug!("[{}] Install source: {}", target_id, source);
            }
            PipelineEvent::DownloadStarted { target_id, .. } => {
                display.update(&target_id, JobStatus::Downloading, None);
            }
            PipelineEvent::DownloadFinished {
                target_id,
                size_bytes,
                ..
            } => {
                display.update(
                    &target_id,
                    JobStatus::Downloaded,
                    Some(format_bytes(size_bytes).dimmed().to_string()),
                );
            }
            PipelineEvent::BuildStarted { target_id } => {
                display.update(&target_id, JobStatus::Building, None);
            }
            PipelineEvent::StepStarted {
                target_id,
                index,
                total,
                command,
            } => {
                println!(
                    "  {} {} {}",
                    format!("{target_id} {}/{}", index + 1, total).dimmed(),
                    "$".dimmed(),
                    command
                );
            }
            PipelineEvent::InstallStarted { target_id } => {
                display.update(&target_id, JobStatus::Installing, None);
            }
            PipelineEvent::JobSuccess {
                target_id,
                version,
                already_installed,
            } => {
                let detail = if already_installed {
                    format!("{version} (already installed)")
                } else {
                    version
                };
                display.update(&target_id, JobStatus::Success, Some(detail));
            }
            PipelineEvent::JobFailed { target_id, .. } => {
                display.update(&target_id, JobStatus::Failed, None);
            }
            PipelineEvent::JobBlocked {
                target_id,
                dependency,
            } => {
                display.update(
                    &target_id,
                    JobStatus::Failed,
                    Some(format!("(blocked by {dependency})").yellow().to_string()),
                );
            }
            PipelineEvent::TestStarted { target_id } => {
                display.update(&target_id, JobStatus::Testing, None);
            }
            PipelineEvent::TestFinished { target_id, result } => match result {
                TestResult::Passed { .. } => {
                    println!("  {} test of {} passed", "✓".green(), target_id.cyan())
                }
                TestResult::Failed { reason, .. } => {
                    println!("  {} test of {} failed: {}", "✗".red(), target_id.cyan(), reason)
                }
            },
            PipelineEvent::UninstallStarted { target_id, version } => {
                tracing::debug!("[{}] Removing {}", target_id, version);
            }
            PipelineEvent::UninstallFinished { .. } => {}
            PipelineEvent::LogInfo { message } => println!("{message}"),
            PipelineEvent::LogWarn { message } => {
                eprintln!("{} {}", "Warning:".yellow().bold(), message)
            }
            PipelineEvent::LogError { message } => {
                eprintln!("{} {}", "Error:".red().bold(), message)
            }
            PipelineEvent::PipelineFinished {
                duration_secs,
                success_count,
                fail_count,
            } => {
                println!(
                    "{} {} ok, {} failed in {:.1}s",
                    "==>".bold().blue(),
                    success_count,
                    fail_count,
                    duration_secs
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_use_decimal_units() {
        assert_eq!(format_bytes(999), "999B");
        assert_eq!(format_bytes(1500), "1.5kB");
        assert_eq!(format_bytes(2_000_000), "2.0MB");
    }
}
