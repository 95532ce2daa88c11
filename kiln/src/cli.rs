// kiln/src/cli.rs
//! Defines the command-line argument structure using clap.
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use kiln_common::error::{ErrorClass, Result};
use kiln_common::pipeline::{PipelineEvent, PipelineReport};
use kiln_common::{Cache, Config, ReceiptStore};
use kiln_core::InstallContext;
use kiln_net::{Downloader, HttpFetcher};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

pub mod install;
pub mod list;
pub mod status;
pub mod test;
pub mod uninstall;

use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::test::TestArgs;
use crate::cli::uninstall::Uninstall;

const EVENT_CHANNEL_SIZE: usize = 100;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "kiln", bin_name = "kiln")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Use this directory as the kiln root instead of KILN_ROOT
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Install(InstallArgs),
    Uninstall(Uninstall),
    Test(TestArgs),
    List(List),
}

impl Command {
    /// Returns the process exit code for a command that ran to completion.
    pub async fn run(&self, config: &Config) -> Result<i32> {
        match self {
            Self::Install(command) => command.run(config).await,
            Self::Uninstall(command) => command.run(config).await,
            Self::Test(command) => command.run(config).await,
            Self::List(command) => command.run(config).await,
        }
    }

    pub fn jobs_override(&self) -> Option<usize> {
        match self {
            Self::Install(command) => command.jobs,
            _ => None,
        }
    }
}

pub fn exit_code_for(class: ErrorClass) -> i32 {
    match class {
        ErrorClass::Other => 1,
        ErrorClass::Resolution => 2,
        ErrorClass::Integrity => 3,
        ErrorClass::Build => 4,
    }
}

pub const TEST_FAILURE_EXIT_CODE: i32 = 5;

/// Exit code for a command that saw the errors of class `worst` and, when
/// nothing else went wrong, possibly some failed tests.
pub fn exit_code(worst: Option<ErrorClass>, tests_failed: bool) -> i32 {
    match worst {
        Some(class) => exit_code_for(class),
        None if tests_failed => TEST_FAILURE_EXIT_CODE,
        None => 0,
    }
}

pub fn report_exit_code(report: &PipelineReport) -> i32 {
    exit_code(report.error_class(), report.failed_tests().next().is_some())
}

/// Folds `class` into the running worst class.
pub fn record_failure(worst: &mut Option<ErrorClass>, class: ErrorClass) {
    *worst = Some(worst.map_or(class, |w| w.worst(class)));
}

/// Opens the record store and download cache, and arms Ctrl-C to cancel
/// whatever the returned context is running.
pub fn open_context(config: &Config) -> Result<InstallContext> {
    let store = Arc::new(ReceiptStore::open(config)?);
    let cache = Cache::new(config)?;
    let fetcher = Arc::new(HttpFetcher::new()?);
    let downloader = Downloader::new(fetcher, Some(cache));
    let ctx = InstallContext::new(config.clone(), store, Arc::new(downloader));

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling running work");
            cancel.cancel();
        }
    });
    Ok(ctx)
}

/// Attaches a progress printer to `ctx`. The printer finishes once every
/// clone of the returned context has been dropped.
pub fn attach_status(ctx: InstallContext) -> (InstallContext, JoinHandle<()>) {
    let (event_tx, event_rx) = broadcast::channel::<PipelineEvent>(EVENT_CHANNEL_SIZE);
    let handle = tokio::spawn(status::handle_events(event_rx));
    (ctx.with_events(event_tx), handle)
}
