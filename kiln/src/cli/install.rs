// kiln/src/cli/install.rs

use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::dependency::CachedHostProbe;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::pipeline::{PipelineReport, TargetStatus, TestResult};
use kiln_core::host::{current_platform, SystemHostProbe};
use kiln_core::{Pipeline, PipelineOptions};
use tracing::{instrument, warn};

use crate::cli;

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[arg(required = true)]
    names: Vec<String>,

    #[arg(
        long,
        help = "Build the requested formulae from source, even if an artifact is available"
    )]
    build_from_source: bool,
    #[arg(long, help = "Skip the test procedure of the requested formulae")]
    no_test: bool,
    #[arg(
        long,
        help = "Install build-only dependencies even when nothing is built from source"
    )]
    include_build_deps: bool,
    #[arg(long, short, value_name = "N", help = "Install up to N targets concurrently")]
    pub jobs: Option<usize>,
}

impl InstallArgs {
    #[instrument(skip(self, config), fields(targets = ?self.names))]
    pub async fn run(&self, config: &Config) -> Result<i32> {
        let formulary = Formulary::load(config)?;
        let host = current_platform()?;
        let (ctx, status) = cli::attach_status(cli::open_context(config)?);
        let options = PipelineOptions {
            build_from_source: self.build_from_source,
            include_build_deps: self.include_build_deps,
            run_tests: !self.no_test,
            jobs: config.jobs,
        };
        let targets = self.names.clone();

        let report = tokio::task::spawn_blocking(move || {
            let probe = CachedHostProbe::new(SystemHostProbe::new());
            let report = Pipeline::new(&ctx, &formulary, &probe, host, options).run(&targets);
            if let Err(e) = ctx.store.flush() {
                warn!("Could not flush installation records: {}", e);
            }
            report
        })
        .await
        .map_err(|e| KilnError::Generic(format!("install task failed: {e}")))?;
        let _ = status.await;

        print_report(&report);
        Ok(cli::report_exit_code(&report))
    }
}

fn print_report(report: &PipelineReport) {
    for outcome in &report.outcomes {
        match &outcome.status {
            TargetStatus::Installed(record) => println!(
                "{} {} {} ({})",
                "✓".green().bold(),
                outcome.name.green(),
                record.version,
                record.install_source
            ),
            TargetStatus::AlreadyInstalled(record) => println!(
                "{} {} {} already installed",
                "✓".green(),
                outcome.name.cyan(),
                record.version
            ),
            TargetStatus::Failed(e) => {
                eprintln!("{} {}: {}", "✗".red().bold(), outcome.name.red(), e)
            }
            TargetStatus::Blocked { dependency } => eprintln!(
                "{} {}: not attempted, dependency '{}' failed",
                "✗".red(),
                outcome.name.yellow(),
                dependency
            ),
            TargetStatus::Skipped => {
                eprintln!("{} {}: skipped", "·".dimmed(), outcome.name.dimmed())
            }
        }
        if let Some(TestResult::Failed { reason, output }) = &outcome.test {
            eprintln!(
                "  {} test of {} failed: {}",
                "!".yellow().bold(),
                outcome.name,
                reason
            );
            for line in output.lines() {
                eprintln!("    {line}");
            }
        }
    }
    if let Some(e) = &report.aborted_by {
        eprintln!("{} {}", "Aborted:".red().bold(), e);
    }
}
