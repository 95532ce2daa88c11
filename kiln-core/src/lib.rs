// kiln-core/src/lib.rs

pub mod build;
pub mod host;
pub mod install;
pub mod pipeline;
pub mod process;
pub mod select;
pub mod test_runner;
pub mod uninstall;

pub use install::{install, InstallContext, InstallOutcome, InstallRequest};
pub use pipeline::{InstallPlan, Pipeline, PipelineOptions};
pub use process::{CancelToken, CommandRunner, SystemCommandRunner};
pub use select::{select, select_with_preference};
pub use test_runner::{run_test, test_installed};
pub use uninstall::{uninstall, UninstallOptions};
