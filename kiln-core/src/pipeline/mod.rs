// kiln-core/src/pipeline/mod.rs
pub mod engine;
pub mod worker;

pub use engine::{InstallPlan, Pipeline, PipelineOptions, PlannedTarget};
