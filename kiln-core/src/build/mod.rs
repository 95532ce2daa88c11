// kiln-core/src/build/mod.rs
// Source builds: step environment, argument resolution and the step interpreter.

pub mod args;
pub mod env;
pub mod resource;
pub mod source;
pub mod steps;

pub use env::StepEnvironment;
pub use source::build_from_source;
pub use steps::ProcedureRunner;
