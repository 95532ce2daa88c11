// kiln/src/cli/test.rs

use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::pipeline::TestResult;
use kiln_core::test_installed;
use tracing::{error, instrument};

use crate::cli;

#[derive(Debug, Args)]
pub struct TestArgs {
    /// Installed formulae whose test procedure should run
    #[arg(required = true)]
    names: Vec<String>,
}

impl TestArgs {
    #[instrument(skip(self, config), fields(targets = ?self.names))]
    pub async fn run(&self, config: &Config) -> Result<i32> {
        let formulary = Formulary::load(config)?;
        let (ctx, status) = cli::attach_status(cli::open_context(config)?);
        let mut worst = None;
        let mut tests_failed = false;

        for name in &self.names {
            let manifest = match formulary.load_manifest(name) {
                Ok(manifest) => manifest,
                Err(e) => {
                    error!("✖ {}", e);
                    eprintln!("{} {}: {}", "✗".red().bold(), name.red(), e);
                    cli::record_failure(&mut worst, e.class());
                    continue;
                }
            };
            let task_ctx = ctx.clone();
            let result = tokio::task::spawn_blocking(move || test_installed(&task_ctx, &manifest))
                .await
                .map_err(|e| KilnError::Generic(format!("test task failed: {e}")))?;

            match result {
                Ok(TestResult::Passed { .. }) => {
                    println!("{} {} passed", "✓".green().bold(), name.green())
                }
                Ok(TestResult::Failed { reason, output }) => {
                    eprintln!("{} {}: {}", "✗".red().bold(), name.red(), reason);
                    for line in output.lines() {
                        eprintln!("    {line}");
                    }
                    tests_failed = true;
                }
                Err(e) => {
                    eprintln!("{} {}: {}", "✗".red().bold(), name.red(), e);
                    cli::record_failure(&mut worst, e.class());
                }
            }
        }

        drop(ctx);
        let _ = status.await;
        Ok(cli::exit_code(worst, tests_failed))
    }
}
