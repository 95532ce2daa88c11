use std::path::Path;

use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::check_path_component;
use kiln_core::{uninstall as core_uninstall, UninstallOptions};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use crate::cli;

#[derive(Args, Debug)]
pub struct Uninstall {
    /// The names of the formulae to uninstall
    #[arg(required = true)]
    pub names: Vec<String>,
    /// Uninstall even when other installed formulae depend on the target
    #[arg(long)]
    pub ignore_dependencies: bool,
}

impl Uninstall {
    pub async fn run(&self, config: &Config) -> Result<i32> {
        let ctx = cli::open_context(config)?;
        let options = UninstallOptions {
            ignore_dependencies: self.ignore_dependencies,
        };
        let mut errors: Vec<(String, KilnError)> = Vec::new();

        for name in &self.names {
            if let Err(e) = check_path_component("formula name", name) {
                error!("✖ {e}");
                errors.push((name.clone(), e));
                continue;
            }
            println!("Uninstalling {name}...");

            let (file_count, size_bytes) = ctx
                .store
                .install_path(name)
                .map(|path| count_files_and_size(&path))
                .unwrap_or((0, 0));
            let task_ctx = ctx.clone();
            let task_name = name.clone();
            let result = tokio::task::spawn_blocking(move || {
                core_uninstall(&task_ctx, &task_name, options)
            })
            .await
            .map_err(|e| KilnError::Generic(format!("uninstall task failed: {e}")))?;

            match result {
                Ok(record) => println!(
                    "✓ Uninstalled {} {} ({} files, {})",
                    name.green(),
                    record.version,
                    file_count,
                    format_size(size_bytes)
                ),
                Err(e) => {
                    error!("✖ Failed to uninstall '{}': {}", name.cyan(), e);
                    errors.push((name.clone(), e));
                }
            }
        }
        if let Err(e) = ctx.store.flush() {
            warn!("Could not flush installation records: {}", e);
        }

        if errors.is_empty() {
            return Ok(0);
        }
        eprintln!("\n{}:", "Finished uninstalling with errors".yellow());
        for (name, e) in &errors {
            eprintln!("- {}: {}", name.red(), e);
        }
        let mut worst = None;
        for (_, e) in &errors {
            cli::record_failure(&mut worst, e.class());
        }
        debug!("{} uninstall(s) failed", errors.len());
        Ok(cli::exit_code(worst, false))
    }
}

fn count_files_and_size(path: &Path) -> (usize, u64) {
    let mut file_count = 0;
    let mut total_size = 0;
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            file_count += 1;
            total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (file_count, total_size)
}

fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if size >= GB {
        format!("{:.1}GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.1}MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.1}KB", size as f64 / KB as f64)
    } else {
        format!("{size}B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0MB");
    }
}
