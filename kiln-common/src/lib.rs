// kiln-common/src/lib.rs
pub mod cache;
pub mod config;
pub mod dependency;
pub mod error;
pub mod formulary;
pub mod keg;
pub mod model;
pub mod pipeline;

// Re-export key types
pub use cache::Cache;
pub use config::Config;
pub use error::{KilnError, Result};
pub use formulary::Formulary;
pub use keg::ReceiptStore;
pub use model::{InstallSource, InstallationRecord, Manifest, PlatformKey};
