use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::keg::ReceiptStore;
use prettytable::{format, Cell, Row, Table};
use tracing::debug;

#[derive(Args, Debug)]
pub struct List {
    /// Print the installation records as JSON
    #[arg(long)]
    pub json: bool,
}

impl List {
    pub async fn run(&self, config: &Config) -> Result<i32> {
        let store = ReceiptStore::open(config)?;
        let mut records = store.list()?;
        records.sort_by(|a, b| a.name.cmp(&b.name));

        if self.json {
            let json = serde_json::to_string_pretty(&records)
                .map_err(|e| KilnError::Json(std::sync::Arc::new(e)))?;
            println!("{json}");
            return Ok(0);
        }
        if records.is_empty() {
            println!("{}", "0 formulae installed".yellow());
            return Ok(0);
        }

        // Newer manifests are flagged; a missing formula directory is not an error here.
        let formulary = match Formulary::load(config) {
            Ok(formulary) => Some(formulary),
            Err(e) => {
                debug!("Not comparing against manifests: {}", e);
                None
            }
        };

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.add_row(Row::new(vec![
            Cell::new("Name").style_spec("b"),
            Cell::new("Installed").style_spec("b"),
            Cell::new("Source").style_spec("b"),
            Cell::new("Depends on").style_spec("b"),
            Cell::new("New?").style_spec("b"),
        ]));
        for record in &records {
            let newer = formulary
                .as_ref()
                .and_then(|f| f.get(&record.name))
                .map(|m| m.version_str_full())
                .filter(|latest| *latest != record.version);
            let source = if record.install_source.is_artifact() {
                "artifact"
            } else {
                "source"
            };
            table.add_row(Row::new(vec![
                Cell::new(&record.name).style_spec("Fb"),
                Cell::new(&record.version),
                Cell::new(source),
                Cell::new(&record.linked_dependencies.join(", ")),
                Cell::new(newer.as_deref().unwrap_or("")),
            ]));
        }
        table.printstd();
        println!("{}", format!("{} formulae installed", records.len()).bold());
        Ok(0)
    }
}
